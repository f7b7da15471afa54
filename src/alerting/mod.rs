//! Threshold alerting on collected rows

pub mod evaluator;
pub mod rules;

pub use evaluator::AlertEvaluator;
pub use rules::{Comparison, Measurement, Rule, default_checks, preprocess};
