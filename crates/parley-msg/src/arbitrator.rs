//! ---
//! parley_section: "02-cross-context-messaging"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Cross-context message bus, arbitration and broadcaster."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
//! Selective-response arbitration.
//!
//! The host fans each call out to a forwarding listener in every context, so
//! most listeners have no opinion on most actions. For each listener turn,
//! [`arbitrate`] decides whether to reply with a value, reply "done", send an
//! empty acknowledgment, or stay silent and leave the slot to someone else.
//!
//! | mode             | handler returned | decision            |
//! |------------------|------------------|---------------------|
//! | `disallowed`     | nothing          | empty acknowledgment|
//! | `disallowed`     | anything         | violation           |
//! | `acknowledgment` | done sentinel    | claim with done     |
//! | `acknowledgment` | other value      | violation           |
//! | `acknowledgment` | nothing          | stay silent         |
//! | `required`       | value or done    | claim               |
//! | `required`       | nothing          | stay silent         |

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::envelope::{Direction, Envelope, Reply, ReplyBody, Response, ResponseMode};
use crate::clone::structured_clone;
use crate::{BusError, Result};

/// What a local handler produced for one envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerOutcome {
    /// No opinion; this context does not handle the action.
    Absent,
    /// Action performed, intentionally no data.
    Done,
    /// Data to return to the sender.
    Value(JsonValue),
}

impl HandlerOutcome {
    /// Clone a serializable value into an outcome.
    pub fn value<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(HandlerOutcome::Value(structured_clone(value)?))
    }

    /// Whether the handler returned anything at all.
    pub fn is_defined(&self) -> bool {
        !matches!(self, HandlerOutcome::Absent)
    }
}

impl From<Option<JsonValue>> for HandlerOutcome {
    fn from(value: Option<JsonValue>) -> Self {
        match value {
            Some(value) => HandlerOutcome::Value(value),
            None => HandlerOutcome::Absent,
        }
    }
}

/// Transport action chosen for one listener turn.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Claim the slot with data.
    Claim(JsonValue),
    /// Claim the slot with the "done" sentinel.
    ClaimDone,
    /// Reply with an explicit "no value" so the sender resolves.
    AcknowledgeEmpty,
    /// Do not reply; another context may answer.
    StaySilent,
}

impl Decision {
    /// Short label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Claim(_) => "claim",
            Decision::ClaimDone => "claim_done",
            Decision::AcknowledgeEmpty => "acknowledge_empty",
            Decision::StaySilent => "stay_silent",
        }
    }

    /// Reply to send for an envelope sent in `outbound` direction, if any.
    pub fn into_reply(self, outbound: Direction) -> Option<Reply> {
        let body = match self {
            Decision::Claim(value) => ReplyBody::Value(value),
            Decision::ClaimDone => ReplyBody::Done,
            Decision::AcknowledgeEmpty => ReplyBody::Nothing,
            Decision::StaySilent => return None,
        };
        Some(Reply::new(outbound, body))
    }
}

/// Decide what this listener may do with the reply slot.
///
/// Errors are protocol violations: the handler broke the discipline the
/// sender declared, and nothing must be sent for this turn.
pub fn arbitrate(envelope: &Envelope, outcome: HandlerOutcome) -> Result<Decision> {
    let violation = |reason: &str| BusError::ProtocolViolation {
        action: envelope.action().to_string(),
        reason: reason.to_owned(),
    };

    match (envelope.response_mode(), outcome) {
        (ResponseMode::Disallowed, HandlerOutcome::Absent) => Ok(Decision::AcknowledgeEmpty),
        (ResponseMode::Disallowed, _) => Err(violation(
            "handler returned a value where responses are disallowed",
        )),
        (ResponseMode::Acknowledgment, HandlerOutcome::Done) => Ok(Decision::ClaimDone),
        (ResponseMode::Acknowledgment, HandlerOutcome::Value(_)) => Err(violation(
            "handler returned data where only acknowledgment is allowed",
        )),
        (ResponseMode::Acknowledgment, HandlerOutcome::Absent) => Ok(Decision::StaySilent),
        (ResponseMode::Required, HandlerOutcome::Absent) => Ok(Decision::StaySilent),
        (ResponseMode::Required, HandlerOutcome::Done) => Ok(Decision::ClaimDone),
        (ResponseMode::Required, HandlerOutcome::Value(value)) => Ok(Decision::Claim(value)),
    }
}

/// Check a reply received by the sender against the discipline it declared.
///
/// Listeners outside this crate can still answer on the shared transport;
/// anything they return that the mode forbids is refused here.
pub fn admit(envelope: &Envelope, reply: Reply) -> Result<Option<Response>> {
    let response = reply.into_response();
    match (envelope.response_mode(), &response) {
        (_, None) => Ok(None),
        (ResponseMode::Required, Some(_)) => Ok(response),
        (ResponseMode::Acknowledgment, Some(Response::Done)) => Ok(response),
        (mode, Some(_)) => Err(BusError::ProtocolViolation {
            action: envelope.action().to_string(),
            reason: format!("reply carries data under '{}' discipline", mode.as_str()),
        }),
    }
}
