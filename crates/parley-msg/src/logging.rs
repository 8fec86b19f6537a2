//! ---
//! parley_section: "02-cross-context-messaging"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Cross-context message bus, arbitration and broadcaster."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use tracing::{debug, info_span, Span};

use crate::envelope::{Envelope, BUS_IDENTIFIER};
use crate::identity::ContextId;

/// Which way an envelope is moving, relative to the logging context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Envelope handed to the host transport.
    Outbound,
    /// Envelope received by a local listener.
    Inbound,
}

/// Span wrapping every listener turn run on behalf of `context`.
///
/// JSON subscribers built with `with_current_span` attach these fields to
/// each record emitted while the turn is running.
pub fn context_span(context: &ContextId) -> Span {
    info_span!("context", context = %context, bus = BUS_IDENTIFIER)
}

/// Emit a structured log entry for envelope activity.
pub fn log_envelope(flow: Flow, envelope: &Envelope, context: &ContextId) {
    debug!(
        context = %context,
        message_id = envelope.message_identifier(),
        action = %envelope.action(),
        direction = envelope.direction().as_str(),
        response_mode = envelope.response_mode().as_str(),
        has_datum = envelope.datum().is_some(),
        flow = ?flow,
        "bus activity"
    );
}

/// Prometheus metric handles for bus activity.
pub struct BusMetricsExporter {
    sent: IntCounter,
    received: IntCounter,
    claimed: IntCounter,
    absent: IntCounter,
    violations: IntCounter,
    foreign: IntCounter,
    latency: Histogram,
}

impl BusMetricsExporter {
    /// Register bus metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounter::with_opts(Opts::new(
            "bus_envelopes_sent_total",
            "Envelopes handed to the host transport",
        ))?;
        let received = IntCounter::with_opts(Opts::new(
            "bus_envelopes_received_total",
            "Envelopes dispatched to local listeners",
        ))?;
        let claimed = IntCounter::with_opts(Opts::new(
            "bus_replies_claimed_total",
            "Listener turns that claimed the reply slot",
        ))?;
        let absent = IntCounter::with_opts(Opts::new(
            "bus_replies_absent_total",
            "Sends that resolved without any value",
        ))?;
        let violations = IntCounter::with_opts(Opts::new(
            "bus_protocol_violations_total",
            "Response discipline violations detected",
        ))?;
        let foreign = IntCounter::with_opts(Opts::new(
            "bus_foreign_messages_total",
            "Inbound values not addressed to this bus",
        ))?;
        let latency = Histogram::with_opts(HistogramOpts::new(
            "bus_send_latency_seconds",
            "Time between send and resolution of the single reply",
        ))?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(claimed.clone()))?;
        registry.register(Box::new(absent.clone()))?;
        registry.register(Box::new(violations.clone()))?;
        registry.register(Box::new(foreign.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            sent,
            received,
            claimed,
            absent,
            violations,
            foreign,
            latency,
        })
    }

    /// Record a sent envelope.
    pub fn observe_sent(&self) {
        self.sent.inc();
    }

    /// Record an envelope dispatched to a local listener.
    pub fn observe_received(&self) {
        self.received.inc();
    }

    /// Record a listener turn that won the reply slot.
    pub fn observe_claimed(&self) {
        self.claimed.inc();
    }

    /// Record a send that resolved with no value.
    pub fn observe_absent(&self) {
        self.absent.inc();
    }

    /// Record a discipline violation.
    pub fn observe_violation(&self) {
        self.violations.inc();
    }

    /// Record an inbound value that was not ours.
    pub fn observe_foreign(&self) {
        self.foreign.inc();
    }

    /// Record send latency.
    pub fn observe_latency(&self, duration: Duration) {
        self.latency.observe(duration.as_secs_f64());
    }
}
