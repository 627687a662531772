//! Attention detection: screen classification and debounced scan timing.

pub mod classifier;
pub mod scheduler;

pub use classifier::{classify, Classifier, PatternClassifier, IDLE_PROMPT_LABEL};
pub use scheduler::{ScanRequest, ScanScheduler, DEFAULT_QUIET_PERIOD};
