//! Metric evaluation — metric specifications and the evaluator that runs them.

pub mod evaluator;
pub mod metric;

pub use evaluator::{EvaluationSource, GatheredInputs, MetricEvaluator, MetricEvaluatorBuilder};
pub use metric::{
    LOSS, MetricSpec, classification_quality, concat_replicas, concat_structural,
    gather_classification_data,
};
