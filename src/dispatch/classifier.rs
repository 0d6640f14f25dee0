//! Outcome classification: pure decisions, no broker I/O
//!
//! Everything here is a function from delivery state to an [`Action`]; the
//! executor carries actions out. Keeping the decision side pure is what
//! makes the retry ladder and the pre-filter directly testable.

use crate::config::{ErrorHandlingConfig, RetryConfig};
use crate::error::{sanitize_error_message, DispatchError};
use crate::handler::Outcome;
use crate::protocol::{BrokerMessage, EntityKey, EntityKind, ErrorRecord, MessageMetadata};
use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Shared inputs for classifying one delivery
pub struct ClassifyContext<'a> {
    pub entity: &'a EntityKey,
    pub app_name: &'a str,
    pub retry: &'a RetryConfig,
    pub error_handling: &'a ErrorHandlingConfig,
}

/// What the executor should do with the delivery
#[derive(Debug)]
pub enum Action {
    /// Acknowledge; nothing else
    Complete,
    /// Leave the delivery unsettled so the broker redelivers it later
    Ignore { reason: String },
    /// Send a derived message to this entity, then acknowledge the original
    Republish { message: BrokerMessage },
    /// Dead-letter the delivery with a reason
    DeadLetter { reason: String },
    /// Publish a diagnostic record to the error queue, then acknowledge
    RouteToErrorQueue { queue: String, record: ErrorRecord },
}

/// Checks applied before the handler runs.
///
/// The misroute check comes first and compares provenance against
/// `arrived_on`, the path the delivery actually came in on: a delivery
/// retried from a different entity must not be acknowledged,
/// dead-lettered, or counted against retries here.
pub fn pre_filter(
    ctx: &ClassifyContext<'_>,
    arrived_on: &str,
    delivery_body: &Bytes,
    metadata: &MessageMetadata,
    now: DateTime<Utc>,
) -> Option<Action> {
    if let Some(source) = metadata.retry_source_entity_path() {
        if source != arrived_on {
            return Some(Action::Ignore {
                reason: format!("retry originated from '{source}'"),
            });
        }
    }

    if metadata.retry_count() >= ctx.retry.max_retries {
        let error = DispatchError::MaxRetriesExhausted {
            max_retries: ctx.retry.max_retries,
        };
        return Some(terminal_action(
            ctx,
            delivery_body,
            metadata.message_type(),
            &error,
            &error.to_string(),
            ctx.error_handling.exhaustion_queue(),
            now,
        ));
    }

    None
}

/// Map a handler outcome to its action
pub fn classify_outcome(
    ctx: &ClassifyContext<'_>,
    body: &Bytes,
    metadata: &MessageMetadata,
    message_type: Option<&str>,
    outcome: &Outcome,
    now: DateTime<Utc>,
) -> Action {
    match outcome {
        Outcome::Success => Action::Complete,
        Outcome::RetryableFailure { reason } => Action::Republish {
            message: retry_message(ctx, body, metadata, message_type, reason, now),
        },
        Outcome::Deferred {
            delay,
            schedule_for,
        } => {
            let target = schedule_for
                .or_else(|| delay.and_then(|d| chrono::Duration::from_std(d).ok().map(|d| now + d)))
                .unwrap_or(now);
            Action::Republish {
                message: defer_message(body, message_type, target),
            }
        }
        Outcome::CompleteFailure { error, reason } => terminal_action(
            ctx,
            body,
            message_type,
            error,
            reason,
            ctx.error_handling.unhandled_queue(),
            now,
        ),
    }
}

/// Build the next attempt for a retryable failure.
///
/// The retry count moves from k to k+1 on every hop. Topic retries carry a
/// provenance tag naming this entity so sibling subscriptions skip them.
fn retry_message(
    ctx: &ClassifyContext<'_>,
    body: &Bytes,
    metadata: &MessageMetadata,
    message_type: Option<&str>,
    reason: &str,
    now: DateTime<Utc>,
) -> BrokerMessage {
    let next_attempt = metadata.retry_count() + 1;

    let mut next = MessageMetadata::new();
    next.set_retry_count(next_attempt);
    next.set_last_error(&sanitize_error_message(reason));
    if let Some(type_name) = message_type.or_else(|| metadata.message_type()) {
        next.set_message_type(type_name);
    }
    if ctx.entity.kind == EntityKind::Topic {
        next.set_retry_source_entity_path(&ctx.entity.name);
    }

    let mut message = BrokerMessage::new(body.clone()).with_metadata(next);
    message.content_type = Some(crate::protocol::message::CONTENT_TYPE_JSON.to_string());
    if let Some(backoff) = ctx.retry.backoff(next_attempt) {
        if let Ok(delay) = chrono::Duration::from_std(backoff) {
            message = message.scheduled_for(now + delay);
        }
    }
    message
}

/// Build the redelivery for a deferred outcome.
///
/// Deferral starts a fresh delivery: the retry count does not carry over.
fn defer_message(body: &Bytes, message_type: Option<&str>, target: DateTime<Utc>) -> BrokerMessage {
    let mut metadata = MessageMetadata::new();
    metadata.set_deferred();
    if let Some(type_name) = message_type {
        metadata.set_message_type(type_name);
    }
    let mut message = BrokerMessage::new(body.clone())
        .with_metadata(metadata)
        .scheduled_for(target);
    message.content_type = Some(crate::protocol::message::CONTENT_TYPE_JSON.to_string());
    message
}

/// Terminal failures either produce an error-queue record or dead-letter
fn terminal_action(
    ctx: &ClassifyContext<'_>,
    body: &Bytes,
    message_type: Option<&str>,
    error: &DispatchError,
    reason: &str,
    error_queue: Option<&str>,
    now: DateTime<Utc>,
) -> Action {
    match error_queue {
        Some(queue) => Action::RouteToErrorQueue {
            queue: queue.to_string(),
            record: error_record(ctx, body, message_type, error, reason, now),
        },
        None => Action::DeadLetter {
            reason: sanitize_error_message(reason),
        },
    }
}

fn error_record(
    ctx: &ClassifyContext<'_>,
    body: &Bytes,
    message_type: Option<&str>,
    error: &DispatchError,
    reason: &str,
    now: DateTime<Utc>,
) -> ErrorRecord {
    ErrorRecord {
        original_message: String::from_utf8_lossy(body).into_owned(),
        original_message_type: message_type.map(str::to_string),
        originating_entity_path: ctx.entity.name.clone(),
        originating_app: ctx.app_name.to_string(),
        exception_message: sanitize_error_message(reason),
        exception_type: error.kind_name().to_string(),
        exception_stack_trace: None,
        inner_exception_message: None,
        occurred: now,
    }
}
