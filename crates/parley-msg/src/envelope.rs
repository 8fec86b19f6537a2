//! ---
//! parley_section: "02-cross-context-messaging"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Cross-context message bus, arbitration and broadcaster."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Action, BusError, Result};

/// Constant separating this bus's traffic from anything else on the host transport.
pub const BUS_IDENTIFIER: &str = "parley-message-bus";

static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(0);

/// Direction tag on the wire. Outbound directions pair with exactly one inbound one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Fire-and-forget call.
    Trigger,
    /// Inbound side of [`Direction::Trigger`].
    Reaction,
    /// Call expecting one meaningful reply.
    Request,
    /// Inbound side of [`Direction::Request`].
    Response,
    /// Broadcast that listeners may acknowledge.
    Shout,
    /// Inbound side of [`Direction::Shout`].
    Silence,
}

impl Direction {
    /// Inbound counterpart for an outbound direction; inbound directions map to themselves.
    pub fn reply(self) -> Direction {
        match self {
            Direction::Trigger => Direction::Reaction,
            Direction::Request => Direction::Response,
            Direction::Shout => Direction::Silence,
            inbound => inbound,
        }
    }

    /// Whether envelopes may be sent with this direction.
    pub fn is_outbound(self) -> bool {
        matches!(
            self,
            Direction::Trigger | Direction::Request | Direction::Shout
        )
    }

    /// Lower-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Trigger => "trigger",
            Direction::Reaction => "reaction",
            Direction::Request => "request",
            Direction::Response => "response",
            Direction::Shout => "shout",
            Direction::Silence => "silence",
        }
    }
}

/// Response discipline governing arbitration of the single reply slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    /// Exactly one meaningful reply expected.
    Required,
    /// Listeners may confirm completion but return no data.
    Acknowledgment,
    /// Listeners must not return anything.
    Disallowed,
}

impl ResponseMode {
    /// Lower-case wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseMode::Required => "required",
            ResponseMode::Acknowledgment => "acknowledgment",
            ResponseMode::Disallowed => "disallowed",
        }
    }
}

/// The legal direction/response-mode pairings, closed as a single type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    /// trigger/disallowed.
    Trigger,
    /// request/required.
    Request,
    /// shout/acknowledgment.
    AcknowledgedShout,
    /// shout/disallowed.
    SilentShout,
}

impl Pattern {
    /// Outbound direction for this pattern.
    pub fn direction(self) -> Direction {
        match self {
            Pattern::Trigger => Direction::Trigger,
            Pattern::Request => Direction::Request,
            Pattern::AcknowledgedShout | Pattern::SilentShout => Direction::Shout,
        }
    }

    /// Response discipline for this pattern.
    pub fn response_mode(self) -> ResponseMode {
        match self {
            Pattern::Trigger | Pattern::SilentShout => ResponseMode::Disallowed,
            Pattern::Request => ResponseMode::Required,
            Pattern::AcknowledgedShout => ResponseMode::Acknowledgment,
        }
    }

    /// Recover the pattern from wire fields, rejecting illegal pairings.
    pub fn from_parts(direction: Direction, response_mode: ResponseMode) -> Option<Pattern> {
        match (direction, response_mode) {
            (Direction::Trigger, ResponseMode::Disallowed) => Some(Pattern::Trigger),
            (Direction::Request, ResponseMode::Required) => Some(Pattern::Request),
            (Direction::Shout, ResponseMode::Acknowledgment) => Some(Pattern::AcknowledgedShout),
            (Direction::Shout, ResponseMode::Disallowed) => Some(Pattern::SilentShout),
            _ => None,
        }
    }
}

/// Message carried over the bus. Built once by a sender and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    bus_identifier: String,
    message_identifier: u64,
    action: Action,
    direction: Direction,
    response_mode: ResponseMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    datum: Option<JsonValue>,
}

/// Result of examining a raw inbound value.
#[derive(Debug, Clone, PartialEq)]
pub enum Inspection {
    /// Not ours; ignore it.
    Foreign,
    /// Carries our bus identifier but is not a legal envelope.
    Malformed {
        /// Action, when one could be read.
        action: Option<String>,
        /// What was wrong.
        reason: String,
    },
    /// Well-formed envelope.
    Valid(Envelope),
}

impl Envelope {
    /// Construct an envelope for the given pattern.
    pub fn new(pattern: Pattern, action: Action, datum: Option<JsonValue>) -> Self {
        Self {
            bus_identifier: BUS_IDENTIFIER.to_owned(),
            message_identifier: NEXT_MESSAGE_ID.fetch_add(1, Ordering::Relaxed) + 1,
            action,
            direction: pattern.direction(),
            response_mode: pattern.response_mode(),
            datum,
        }
    }

    /// Examine a raw value received from the host transport.
    pub fn inspect(raw: &JsonValue) -> Inspection {
        let bus = raw.get("busIdentifier").and_then(JsonValue::as_str);
        if bus != Some(BUS_IDENTIFIER) {
            return Inspection::Foreign;
        }
        let action = raw
            .get("action")
            .and_then(JsonValue::as_str)
            .map(str::to_owned);

        let envelope = match Envelope::deserialize(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                return Inspection::Malformed {
                    action,
                    reason: err.to_string(),
                }
            }
        };

        if !envelope.direction.is_outbound() {
            return Inspection::Malformed {
                action,
                reason: format!("'{}' is not an outbound direction", envelope.direction.as_str()),
            };
        }
        if envelope.pattern().is_none() {
            return Inspection::Malformed {
                action,
                reason: format!(
                    "direction '{}' cannot pair with response mode '{}'",
                    envelope.direction.as_str(),
                    envelope.response_mode.as_str()
                ),
            };
        }
        Inspection::Valid(envelope)
    }

    /// Per-process correlation number, for logs only.
    pub fn message_identifier(&self) -> u64 {
        self.message_identifier
    }

    /// Action name.
    pub fn action(&self) -> &Action {
        &self.action
    }

    /// Outbound direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Declared response discipline.
    pub fn response_mode(&self) -> ResponseMode {
        self.response_mode
    }

    /// Pattern, when direction and mode pair legally. Always `Some` for envelopes built by [`Envelope::new`].
    pub fn pattern(&self) -> Option<Pattern> {
        Pattern::from_parts(self.direction, self.response_mode)
    }

    /// Optional payload.
    pub fn datum(&self) -> Option<&JsonValue> {
        self.datum.as_ref()
    }
}

/// Body of a reply claiming (or acknowledging) the reply slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ReplyBody {
    /// Data returned by the winning listener.
    Value(JsonValue),
    /// The listener performed the action and intentionally returns nothing.
    Done,
    /// Explicit "no value" so the sender's pending call resolves.
    Nothing,
}

/// Reply as carried back over the host transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    bus_identifier: String,
    direction: Direction,
    body: ReplyBody,
}

/// What a sender receives when some context claimed the reply slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Data returned by the winning listener.
    Value(JsonValue),
    /// Some context finished the action without returning data.
    Done,
}

impl Response {
    /// Returned data, if any.
    pub fn into_value(self) -> Option<JsonValue> {
        match self {
            Response::Value(value) => Some(value),
            Response::Done => None,
        }
    }

    /// Whether this is the "handler done" sentinel.
    pub fn is_done(&self) -> bool {
        matches!(self, Response::Done)
    }
}

impl Reply {
    /// Reply to an envelope sent in `outbound` direction.
    pub fn new(outbound: Direction, body: ReplyBody) -> Self {
        Self {
            bus_identifier: BUS_IDENTIFIER.to_owned(),
            direction: outbound.reply(),
            body,
        }
    }

    /// Inbound direction tag.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Reply body.
    pub fn body(&self) -> &ReplyBody {
        &self.body
    }

    /// Parse a raw reply. Foreign values yield `Ok(None)`; malformed ones carrying
    /// our identifier are a protocol violation.
    pub fn parse(raw: JsonValue, action: &Action) -> Result<Option<Reply>> {
        let bus = raw.get("busIdentifier").and_then(JsonValue::as_str);
        if bus != Some(BUS_IDENTIFIER) {
            return Ok(None);
        }
        serde_json::from_value::<Reply>(raw)
            .map(Some)
            .map_err(|err| BusError::ProtocolViolation {
                action: action.to_string(),
                reason: format!("malformed reply: {}", err),
            })
    }

    /// Map the wire body onto what the sender observes.
    pub fn into_response(self) -> Option<Response> {
        match self.body {
            ReplyBody::Value(value) => Some(Response::Value(value)),
            ReplyBody::Done => Some(Response::Done),
            ReplyBody::Nothing => None,
        }
    }
}
