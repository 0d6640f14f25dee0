//! Dispatch pipeline: pre-filter, classify, execute, orchestrate
//!
//! Split into a pure decision side ([`classifier`]) and an impure execution
//! side ([`executor`]), stitched together per delivery by the worker.

pub mod classifier;
pub mod executor;
pub mod worker;

pub use classifier::{classify_outcome, pre_filter, Action, ClassifyContext};
pub use executor::ActionExecutor;
pub use worker::BusWorker;
