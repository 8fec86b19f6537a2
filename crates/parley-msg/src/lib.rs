//! ---
//! parley_section: "02-cross-context-messaging"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Cross-context message bus, arbitration and broadcaster."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
//! Message bus for isolated extension contexts.
//!
//! Every context (the long-lived background, popups, options pages, content
//! scripts) registers a forwarding listener on a host transport that fans each
//! outbound call out to every other context while accepting a single reply.
//! The [`arbitrator`] decides, per listener, whether that listener may claim
//! the reply slot; the [`Broadcaster`] layers named events on top.
#![warn(missing_docs)]

pub mod action;
pub mod arbitrator;
pub mod broadcaster;
pub mod bus;
pub mod clone;
pub mod envelope;
pub mod getter;
pub mod host;
pub mod identity;
pub mod logging;
pub mod provider;

/// Shared result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Failures surfaced by the message bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A listener or sender broke the declared response discipline.
    #[error("protocol violation on '{action}': {reason}")]
    ProtocolViolation {
        /// Action carried by the offending envelope.
        action: String,
        /// What was wrong.
        reason: String,
    },
    /// Host transport failure other than "no receiving end".
    #[error("transport error: {0}")]
    Transport(#[from] host::HostError),
    /// Payload could not be cloned across the context boundary.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The same handler was registered twice for one channel.
    #[error("handler already registered on '{channel}'")]
    DuplicateListener {
        /// Event name or low-level channel the handler was registered against.
        channel: String,
    },
    /// The process identity was already established for another kind.
    #[error("context identity already established as '{established}', refusing {requested}")]
    IdentityConflict {
        /// Identifier assigned at startup.
        established: String,
        /// Kind requested by the conflicting call.
        requested: ContextKind,
    },
    /// A long-lived sibling context never became reachable.
    #[error("sibling context '{context}' unavailable after {attempts} attempt(s)")]
    SiblingUnavailable {
        /// Context that was being located.
        context: String,
        /// Number of probes performed.
        attempts: u32,
    },
    /// Action string outside the `domain:subsystem:verb` vocabulary form.
    #[error("invalid action name: {0}")]
    InvalidAction(String),
    /// Listener registration attempted outside a tokio runtime.
    #[error("no tokio runtime available to dispatch listeners")]
    RuntimeUnavailable,
}

pub use action::Action;
pub use arbitrator::{admit, arbitrate, Decision, HandlerOutcome};
pub use broadcaster::{Broadcaster, EventHandler, KillSwitch};
pub use bus::Bus;
pub use clone::structured_clone;
pub use envelope::{
    Direction, Envelope, Inspection, Pattern, Reply, ReplyBody, Response, ResponseMode,
    BUS_IDENTIFIER,
};
pub use getter::{BackgroundLocator, ProviderGetter, SiblingLocator};
pub use host::{HostError, HostListener, HostListenerId, HostTransport, InMemoryHost, ReplySlot};
pub use identity::{ContextId, ContextIdentity, ContextKind};
pub use logging::{context_span, log_envelope, BusMetricsExporter, Flow};
pub use provider::{Listener, OnMessage, ProviderStats, TransportProvider};
