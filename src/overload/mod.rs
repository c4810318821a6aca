//! System-wide overload detection.

mod detector;
mod periodic;

pub use detector::{DriftSampler, OverloadDetector, OverloadSignal, Sample};
pub use periodic::PeriodicTask;
