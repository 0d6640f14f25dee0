//! Test doubles for the transport seam
//!
//! Used by unit tests in this crate and by downstream consumers that want
//! to exercise handlers without a broker.

pub mod mocks;
