//! Handler outcomes and the closed set of handler signatures
//!
//! Handlers are registered through explicit arity constructors
//! (`Handler::of0` .. `Handler::of3`). Each parameter is described by a
//! [`Param`] — either a collaborator (resolved from the delivery scope) or a
//! message parameter (collaborator-first, deserialized from the payload when
//! the scope cannot supply it). At registration time the typed closure is
//! pre-wrapped into a uniform erased call, so every delivery invokes handlers
//! the same way regardless of their shape.

use crate::error::DispatchError;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::any::{Any, TypeId};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

pub mod registry;

pub use registry::{HandlerDescriptor, HandlerRegistry};

/// The semantic result a handler produces for one delivery attempt.
///
/// Exactly one variant is active per invocation; an unhandled handler error
/// is coerced to `CompleteFailure`.
#[derive(Debug)]
pub enum Outcome {
    /// Message fully handled; acknowledge it
    Success,
    /// Transient failure; redeliver with an incremented retry count
    RetryableFailure { reason: String },
    /// Terminal failure; dead-letter or route to the error queue
    CompleteFailure {
        error: DispatchError,
        reason: String,
    },
    /// Not ready yet; redeliver later
    Deferred {
        delay: Option<Duration>,
        schedule_for: Option<DateTime<Utc>>,
    },
}

impl Outcome {
    pub fn retry(reason: impl Into<String>) -> Self {
        Self::RetryableFailure {
            reason: reason.into(),
        }
    }

    pub fn from_error(error: DispatchError) -> Self {
        let reason = error.to_string();
        Self::CompleteFailure { error, reason }
    }

    pub fn defer_for(delay: Duration) -> Self {
        Self::Deferred {
            delay: Some(delay),
            schedule_for: None,
        }
    }

    pub fn defer_until(schedule_for: DateTime<Utc>) -> Self {
        Self::Deferred {
            delay: None,
            schedule_for: Some(schedule_for),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Normalizes handler return values into an [`Outcome`].
///
/// A bare completion maps to `Success`; an error result maps to
/// `CompleteFailure`; an `Outcome` passes through unchanged.
pub trait IntoOutcome: Send + 'static {
    fn into_outcome(self) -> Outcome;
}

impl IntoOutcome for Outcome {
    fn into_outcome(self) -> Outcome {
        self
    }
}

impl IntoOutcome for () {
    fn into_outcome(self) -> Outcome {
        Outcome::Success
    }
}

impl<E> IntoOutcome for Result<(), E>
where
    E: std::error::Error + Send + 'static,
{
    fn into_outcome(self) -> Outcome {
        match self {
            Ok(()) => Outcome::Success,
            Err(e) => Outcome::from_error(DispatchError::invocation_failed(e.to_string())),
        }
    }
}

impl<E> IntoOutcome for Result<Outcome, E>
where
    E: std::error::Error + Send + 'static,
{
    fn into_outcome(self) -> Outcome {
        match self {
            Ok(outcome) => outcome,
            Err(e) => Outcome::from_error(DispatchError::invocation_failed(e.to_string())),
        }
    }
}

/// A value the resolver produced for one handler parameter
pub enum ResolvedArg {
    /// Resolved from the delivery scope
    Scoped(Arc<dyn Any + Send + Sync>),
    /// Deserialized from the message payload
    Decoded(Box<dyn Any + Send>),
}

type PayloadDecoder = Arc<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, String> + Send + Sync>;
type Extractor<A> = Arc<dyn Fn(ResolvedArg) -> Result<A, DispatchError> + Send + Sync>;

/// Erased description of one handler parameter
#[derive(Clone)]
pub struct ParamSpec {
    pub name: String,
    pub type_name: &'static str,
    pub(crate) type_id: TypeId,
    pub(crate) decoder: Option<PayloadDecoder>,
}

impl ParamSpec {
    pub(crate) fn can_decode(&self) -> bool {
        self.decoder.is_some()
    }
}

impl std::fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParamSpec")
            .field("name", &self.name)
            .field("type_name", &self.type_name)
            .field("payload_capable", &self.can_decode())
            .finish()
    }
}

/// Typed descriptor for one handler parameter.
///
/// `A` is the type the handler closure receives at that position.
pub struct Param<A> {
    spec: ParamSpec,
    extract: Extractor<A>,
    _marker: PhantomData<fn() -> A>,
}

/// Deserialize payload bytes with case-insensitive field matching: direct
/// parse first, then a retry with all object keys lowercased.
fn decode_case_insensitive<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, String> {
    match serde_json::from_slice::<T>(bytes) {
        Ok(value) => Ok(value),
        Err(first_err) => {
            let value: Value =
                serde_json::from_slice(bytes).map_err(|_| first_err.to_string())?;
            let lowered = lowercase_keys(value);
            serde_json::from_value(lowered).map_err(|_| first_err.to_string())
        }
    }
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k.to_lowercase(), lowercase_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}

impl<T> Param<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// A parameter filled from the message payload when the scope cannot
    /// supply it. Collaborator resolution is still tried first.
    pub fn message(name: impl Into<String>) -> Param<T> {
        let decoder: PayloadDecoder = Arc::new(|bytes: &[u8]| {
            decode_case_insensitive::<T>(bytes)
                .map(|value| Box::new(value) as Box<dyn Any + Send>)
        });
        let name = name.into();
        let spec = ParamSpec {
            name: name.clone(),
            type_name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            decoder: Some(decoder),
        };
        let extract: Extractor<T> = Arc::new(move |arg| match arg {
            ResolvedArg::Decoded(boxed) => boxed.downcast::<T>().map(|b| *b).map_err(|_| {
                DispatchError::invocation_failed(format!(
                    "decoded payload had an unexpected type for parameter '{name}'"
                ))
            }),
            ResolvedArg::Scoped(shared) => shared
                .downcast::<T>()
                .map(|arc| (*arc).clone())
                .map_err(|_| {
                    DispatchError::invocation_failed(format!(
                        "scoped value had an unexpected type for parameter '{name}'"
                    ))
                }),
        });
        Param {
            spec,
            extract,
            _marker: PhantomData,
        }
    }
}

impl<T> Param<T>
where
    T: Send + Sync + 'static,
{
    /// A parameter resolved from the delivery scope only; the handler
    /// receives it as `Arc<T>`.
    pub fn collaborator(name: impl Into<String>) -> Param<Arc<T>> {
        let name = name.into();
        let spec = ParamSpec {
            name: name.clone(),
            type_name: std::any::type_name::<T>(),
            type_id: TypeId::of::<T>(),
            decoder: None,
        };
        let extract: Extractor<Arc<T>> = Arc::new(move |arg| match arg {
            ResolvedArg::Scoped(shared) => shared.downcast::<T>().map_err(|_| {
                DispatchError::invocation_failed(format!(
                    "scoped value had an unexpected type for parameter '{name}'"
                ))
            }),
            ResolvedArg::Decoded(_) => Err(DispatchError::invocation_failed(format!(
                "collaborator parameter '{name}' cannot come from the payload"
            ))),
        });
        Param {
            spec,
            extract,
            _marker: PhantomData,
        }
    }
}

impl<A> Param<A> {
    pub(crate) fn spec(&self) -> &ParamSpec {
        &self.spec
    }
}

/// Future produced by an erased handler call
pub type HandlerFuture = BoxFuture<'static, Outcome>;

type ErasedCall =
    Arc<dyn Fn(Vec<ResolvedArg>) -> Result<HandlerFuture, DispatchError> + Send + Sync>;

/// A registered handler: parameter specs plus the pre-wrapped erased call
#[derive(Clone)]
pub struct Handler {
    params: Vec<ParamSpec>,
    call: ErasedCall,
}

impl Handler {
    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub(crate) fn call(&self, args: Vec<ResolvedArg>) -> Result<HandlerFuture, DispatchError> {
        (self.call)(args)
    }

    fn arity_error(expected: usize, got: usize) -> DispatchError {
        DispatchError::invocation_failed(format!(
            "handler expected {expected} resolved parameters, got {got}"
        ))
    }

    /// A handler taking no parameters
    pub fn of0<F, Fut, R>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: IntoOutcome,
    {
        let f = Arc::new(f);
        Self {
            params: Vec::new(),
            call: Arc::new(move |args| {
                if !args.is_empty() {
                    return Err(Self::arity_error(0, args.len()));
                }
                let f = Arc::clone(&f);
                Ok(Box::pin(async move { f().await.into_outcome() }))
            }),
        }
    }

    /// A handler taking one parameter
    pub fn of1<A0, F, Fut, R>(p0: Param<A0>, f: F) -> Self
    where
        A0: Send + 'static,
        F: Fn(A0) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: IntoOutcome,
    {
        let f = Arc::new(f);
        let e0 = p0.extract;
        Self {
            params: vec![p0.spec],
            call: Arc::new(move |args| {
                let [a0]: [ResolvedArg; 1] = args
                    .try_into()
                    .map_err(|v: Vec<_>| Self::arity_error(1, v.len()))?;
                let a0 = e0(a0)?;
                let f = Arc::clone(&f);
                Ok(Box::pin(async move { f(a0).await.into_outcome() }))
            }),
        }
    }

    /// A handler taking two parameters
    pub fn of2<A0, A1, F, Fut, R>(p0: Param<A0>, p1: Param<A1>, f: F) -> Self
    where
        A0: Send + 'static,
        A1: Send + 'static,
        F: Fn(A0, A1) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: IntoOutcome,
    {
        let f = Arc::new(f);
        let (e0, e1) = (p0.extract, p1.extract);
        Self {
            params: vec![p0.spec, p1.spec],
            call: Arc::new(move |args| {
                let [a0, a1]: [ResolvedArg; 2] = args
                    .try_into()
                    .map_err(|v: Vec<_>| Self::arity_error(2, v.len()))?;
                let a0 = e0(a0)?;
                let a1 = e1(a1)?;
                let f = Arc::clone(&f);
                Ok(Box::pin(async move { f(a0, a1).await.into_outcome() }))
            }),
        }
    }

    /// A handler taking three parameters
    pub fn of3<A0, A1, A2, F, Fut, R>(
        p0: Param<A0>,
        p1: Param<A1>,
        p2: Param<A2>,
        f: F,
    ) -> Self
    where
        A0: Send + 'static,
        A1: Send + 'static,
        A2: Send + 'static,
        F: Fn(A0, A1, A2) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
        R: IntoOutcome,
    {
        let f = Arc::new(f);
        let (e0, e1, e2) = (p0.extract, p1.extract, p2.extract);
        Self {
            params: vec![p0.spec, p1.spec, p2.spec],
            call: Arc::new(move |args| {
                let [a0, a1, a2]: [ResolvedArg; 3] = args
                    .try_into()
                    .map_err(|v: Vec<_>| Self::arity_error(3, v.len()))?;
                let a0 = e0(a0)?;
                let a1 = e1(a1)?;
                let a2 = e2(a2)?;
                let f = Arc::clone(&f);
                Ok(Box::pin(async move { f(a0, a1, a2).await.into_outcome() }))
            }),
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler").field("params", &self.params).finish()
    }
}
