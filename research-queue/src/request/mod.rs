//! Research request model and its state machine.

pub mod transitions;
pub mod types;

pub use transitions::{FailureDisposition, RetryPolicy};
pub use types::*;
