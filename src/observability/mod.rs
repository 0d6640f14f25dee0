//! Logging setup and dispatch span helpers

pub mod logging;

pub use logging::{init_default_logging, init_logging, LogFormat};
