//! Distributed value gateway — a uniform "gather → map → combine" view over
//! values that are split one-per-device.
//!
//! The device strategy decides how packed values are unpacked and how a
//! function is executed per replica. The gateway never synchronises devices
//! itself; reduction points block until the strategy returns.

use crate::data::{MetricData, PerReplica};
use crate::error::{MlpugError, Result};
use std::fmt;
use std::sync::Arc;

/// Identifies the replica a function is executing on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplicaContext {
    pub replica_id: usize,
    pub num_replicas: usize,
}

/// Device strategy capability injected into a run.
pub trait DistributionStrategy: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn num_replicas(&self) -> usize;

    /// Split packed components into one component list per replica.
    ///
    /// Components that are not per-replica values are mirrored on every replica.
    fn local_results(&self, packed: &[MetricData]) -> Result<Vec<Vec<MetricData>>> {
        let num_replicas = self.num_replicas();
        let mut unpacked = vec![Vec::with_capacity(packed.len()); num_replicas];
        for (component_idx, component) in packed.iter().enumerate() {
            match component {
                MetricData::PerReplica(values) => {
                    if values.num_replicas() != num_replicas {
                        return Err(MlpugError::distributed(format!(
                            "component {component_idx} has {} replica values, strategy '{}' has {num_replicas} replicas",
                            values.num_replicas(),
                            self.name()
                        )));
                    }
                    for (replica, value) in unpacked.iter_mut().zip(values.iter()) {
                        replica.push(value.clone());
                    }
                }
                mirrored => {
                    for replica in unpacked.iter_mut() {
                        replica.push(mirrored.clone());
                    }
                }
            }
        }
        Ok(unpacked)
    }

    /// Run `func` once per replica and collect the results.
    ///
    /// A single-replica strategy returns the plain result.
    fn run(&self, func: &dyn Fn(&ReplicaContext) -> Result<MetricData>) -> Result<MetricData> {
        let num_replicas = self.num_replicas();
        let mut results = Vec::with_capacity(num_replicas);
        for replica_id in 0..num_replicas {
            results.push(func(&ReplicaContext {
                replica_id,
                num_replicas,
            })?);
        }
        if num_replicas == 1 {
            if let Some(result) = results.pop() {
                return Ok(result);
            }
        }
        Ok(MetricData::PerReplica(PerReplica::new(results)))
    }
}

/// Everything runs on one device.
#[derive(Debug, Clone, Default)]
pub struct SingleDevice;

impl DistributionStrategy for SingleDevice {
    fn name(&self) -> &str {
        "single_device"
    }

    fn num_replicas(&self) -> usize {
        1
    }
}

/// Mirrors execution over a fixed number of in-process replicas.
#[derive(Debug, Clone)]
pub struct MirroredStrategy {
    num_replicas: usize,
}

impl MirroredStrategy {
    pub fn new(num_replicas: usize) -> Result<Self> {
        if num_replicas == 0 {
            return Err(MlpugError::config("a mirrored strategy needs at least one replica"));
        }
        Ok(Self { num_replicas })
    }
}

impl DistributionStrategy for MirroredStrategy {
    fn name(&self) -> &str {
        "mirrored"
    }

    fn num_replicas(&self) -> usize {
        self.num_replicas
    }
}

/// True when `value` is a per-replica composite, or a sequence whose first
/// element is one.
pub fn is_distributed(value: &MetricData) -> bool {
    match value {
        MetricData::PerReplica(_) => true,
        MetricData::Sequence(items) => items.first().is_some_and(is_distributed),
        _ => false,
    }
}

/// Unpack per-replica data and map every replica's components.
///
/// Exactly one of `packed` and `unpacked` must be given. Packed data needs a
/// strategy to extract the per-replica components.
pub fn unpack_and_map<R, F>(
    map_func: F,
    packed: Option<&[MetricData]>,
    strategy: Option<&dyn DistributionStrategy>,
    unpacked: Option<Vec<Vec<MetricData>>>,
) -> Result<Vec<R>>
where
    F: FnMut(Vec<MetricData>) -> R,
{
    let unpacked = match (packed, unpacked) {
        (None, None) => {
            return Err(MlpugError::config(
                "provide either packed per-replica data or unpacked replica data",
            ));
        }
        (Some(_), Some(_)) => {
            return Err(MlpugError::config(
                "provide either packed per-replica data or unpacked replica data, not both",
            ));
        }
        (Some(packed), None) => {
            let strategy = strategy.ok_or_else(|| {
                MlpugError::config("a distribution strategy is required to unpack per-replica data")
            })?;
            strategy.local_results(packed)?
        }
        (None, Some(unpacked)) => unpacked,
    };

    Ok(unpacked.into_iter().map(map_func).collect())
}

/// Zip per-device component lists into per-replica composites, component-wise.
pub fn pack(unpacked: &[Vec<MetricData>]) -> Result<Vec<MetricData>> {
    let Some(first) = unpacked.first() else {
        return Ok(Vec::new());
    };
    let num_components = first.len();
    if let Some(idx) = unpacked.iter().position(|r| r.len() != num_components) {
        return Err(MlpugError::distributed(format!(
            "replica {idx} has {} components, replica 0 has {num_components}",
            unpacked[idx].len()
        )));
    }

    Ok((0..num_components)
        .map(|component| {
            let values = unpacked.iter().map(|replica| replica[component].clone()).collect();
            MetricData::PerReplica(PerReplica::new(values))
        })
        .collect())
}

/// A function that runs once per replica each time it is called.
pub struct DistributedFunc<A, F> {
    func_name: String,
    func: F,
    strategy: Arc<dyn DistributionStrategy>,
    monitor_tracing: bool,
    _args: std::marker::PhantomData<fn(&A)>,
}

impl<A, F> DistributedFunc<A, F>
where
    F: Fn(&ReplicaContext, &A) -> Result<MetricData>,
{
    pub fn func_name(&self) -> &str {
        &self.func_name
    }

    /// Log the replica id on every invocation, to diagnose repeated compilation.
    pub fn with_tracing_monitor(mut self, enabled: bool) -> Self {
        self.monitor_tracing = enabled;
        self
    }

    pub fn call(&self, args: &A) -> Result<MetricData> {
        self.strategy.run(&|ctx: &ReplicaContext| {
            if self.monitor_tracing {
                tracing::debug!(
                    func = %self.func_name,
                    replica_id = ctx.replica_id,
                    "Function invoked for replica"
                );
            }
            (self.func)(ctx, args)
        })
    }
}

impl<A, F> fmt::Debug for DistributedFunc<A, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedFunc")
            .field("func_name", &self.func_name)
            .field("strategy", &self.strategy.name())
            .finish()
    }
}

/// Wrap `func` so that each call executes it under `strategy`, once per replica.
pub fn create_distributed_func<A, F>(
    func_name: impl Into<String>,
    func: F,
    strategy: Arc<dyn DistributionStrategy>,
) -> DistributedFunc<A, F>
where
    F: Fn(&ReplicaContext, &A) -> Result<MetricData>,
{
    let func_name = func_name.into();
    tracing::debug!(func = %func_name, strategy = strategy.name(), "Wrapped function as distributed function");
    DistributedFunc {
        func_name,
        func,
        strategy,
        monitor_tracing: false,
        _args: std::marker::PhantomData,
    }
}

/// Uniform access to per-device values for the evaluator and trainers.
#[derive(Debug, Clone)]
pub struct DistributedValueGateway {
    strategy: Arc<dyn DistributionStrategy>,
}

impl Default for DistributedValueGateway {
    fn default() -> Self {
        Self::new(Arc::new(SingleDevice))
    }
}

impl DistributedValueGateway {
    pub fn new(strategy: Arc<dyn DistributionStrategy>) -> Self {
        Self { strategy }
    }

    pub fn strategy(&self) -> &Arc<dyn DistributionStrategy> {
        &self.strategy
    }

    pub fn num_replicas(&self) -> usize {
        self.strategy.num_replicas()
    }

    pub fn is_distributed(&self, value: &MetricData) -> bool {
        is_distributed(value)
    }

    /// Unpack a single packed value (or a packed sequence) and map each replica's part.
    pub fn unpack_and_map<R, F>(&self, map_func: F, packed: &MetricData) -> Result<Vec<R>>
    where
        F: FnMut(Vec<MetricData>) -> R,
    {
        let components: &[MetricData] = match packed {
            MetricData::Sequence(items) => items,
            single => std::slice::from_ref(single),
        };
        unpack_and_map(map_func, Some(components), Some(self.strategy.as_ref()), None)
    }

    pub fn pack(&self, unpacked: &[Vec<MetricData>]) -> Result<Vec<MetricData>> {
        pack(unpacked)
    }

    pub fn create_distributed_func<A, F>(&self, func_name: impl Into<String>, func: F) -> DistributedFunc<A, F>
    where
        F: Fn(&ReplicaContext, &A) -> Result<MetricData>,
    {
        create_distributed_func(func_name, func, Arc::clone(&self.strategy))
    }
}
