//! Tollgate - Admission Control Primitives
//!
//! This crate provides the two decisions a network service makes before
//! accepting a request: whether the calling client still has credits left
//! (a per-client token bucket with discrete batch refill), and whether the
//! process as a whole is too busy to take more work (an overload flag
//! inferred from the drift of a periodic timer). It never touches transport;
//! binding the decisions to endpoints is left to the caller.

pub mod config;
pub mod error;
pub mod gate;
pub mod overload;
pub mod ratelimit;
pub mod simulate;

pub use gate::{AdmissionGate, Decision};
pub use overload::{OverloadDetector, OverloadSignal};
pub use ratelimit::TokenBucketLimiter;
