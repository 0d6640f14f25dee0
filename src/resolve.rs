//! Per-delivery parameter resolution
//!
//! Collaborators win: every parameter is first offered to the delivery
//! scope. At most one parameter may remain unresolved; that one is the
//! payload parameter and is deserialized from the message body. Two or more
//! unresolved parameters make the registration ambiguous.

use crate::error::{DispatchError, DispatchResult};
use crate::handler::{ParamSpec, ResolvedArg};
use crate::scope::DeliveryScope;

/// Outcome of resolving one handler signature against one delivery
pub struct ResolvedParams {
    /// One argument per parameter, in declaration order
    pub args: Vec<ResolvedArg>,
    /// Index of the parameter filled from the payload, if any
    pub payload_index: Option<usize>,
}

pub fn resolve_parameters(
    specs: &[ParamSpec],
    scope: &mut DeliveryScope,
    payload: &[u8],
) -> DispatchResult<ResolvedParams> {
    let mut slots: Vec<Option<ResolvedArg>> = Vec::with_capacity(specs.len());
    let mut unresolved: Option<usize> = None;

    for (index, spec) in specs.iter().enumerate() {
        match scope.resolve_raw(spec.type_id) {
            Some(shared) => slots.push(Some(ResolvedArg::Scoped(shared))),
            None => {
                if let Some(first) = unresolved {
                    return Err(DispatchError::AmbiguousPayloadParameter {
                        first: specs[first].name.clone(),
                        second: spec.name.clone(),
                    });
                }
                unresolved = Some(index);
                slots.push(None);
            }
        }
    }

    if let Some(index) = unresolved {
        let spec = &specs[index];
        let decoder = spec.decoder.as_ref().ok_or_else(|| {
            DispatchError::PayloadDeserializationFailed {
                param: spec.name.clone(),
                type_name: spec.type_name.to_string(),
                message: "parameter is not registered and cannot be read from the message body"
                    .to_string(),
            }
        })?;
        let decoded =
            decoder(payload).map_err(|message| DispatchError::PayloadDeserializationFailed {
                param: spec.name.clone(),
                type_name: spec.type_name.to_string(),
                message,
            })?;
        slots[index] = Some(ResolvedArg::Decoded(decoded));
    }

    let args = slots.into_iter().flatten().collect();
    Ok(ResolvedParams {
        args,
        payload_index: unresolved,
    })
}
