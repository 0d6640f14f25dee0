//! Handler invocation with outcome coercion
//!
//! Invocation never touches the broker. Resolution errors and panics are
//! coerced to `CompleteFailure`; the dispatch pipeline decides what that
//! means for the delivery.

use crate::error::{sanitize_error_message, DispatchError};
use crate::handler::{Handler, Outcome, ResolvedArg};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::error;

/// Run a handler against already-resolved arguments and normalize the result
pub async fn invoke(handler: &Handler, args: Vec<ResolvedArg>) -> Outcome {
    let future = match handler.call(args) {
        Ok(future) => future,
        Err(e) => return Outcome::from_error(e),
    };

    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic_message(&panic);
            error!(panic = %message, "handler panicked");
            Outcome::from_error(DispatchError::invocation_failed(format!(
                "handler panicked: {}",
                sanitize_error_message(&message)
            )))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
