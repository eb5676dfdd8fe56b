//! Outcome model and response classification.

pub mod classifier;
pub mod types;

pub use classifier::{ClassifierConfig, OutcomeClassifier};
pub use types::{OutcomeKind, RequestOutcome};
