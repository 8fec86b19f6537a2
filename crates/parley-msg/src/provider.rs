//! ---
//! parley_section: "02-cross-context-messaging"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Cross-context message bus, arbitration and broadcaster."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use tokio::runtime::Handle;
use tracing::{debug, error, trace, warn, Instrument};

use crate::arbitrator::{admit, arbitrate, HandlerOutcome};
use crate::clone::structured_clone;
use crate::envelope::{Envelope, Inspection, Reply, ReplyBody, Response};
use crate::host::{HostListener, HostListenerId, HostTransport, ReplySlot};
use crate::identity::ContextId;
use crate::logging::{context_span, log_envelope, BusMetricsExporter, Flow};
use crate::{BusError, Result};

static NEXT_LISTENER_KEY: AtomicU64 = AtomicU64::new(0);

type HandlerFn = dyn Fn(Envelope, ContextId) -> BoxFuture<'static, HandlerOutcome> + Send + Sync;

/// Logical listener registered against a provider.
///
/// Identity is the listener value itself: clones share it, while two
/// listeners built from the same closure do not.
#[derive(Clone)]
pub struct Listener {
    key: u64,
    handler: Arc<HandlerFn>,
}

impl Listener {
    /// Wrap an async handler receiving each envelope and the sender's identity.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Envelope, ContextId) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        Self {
            key: NEXT_LISTENER_KEY.fetch_add(1, Ordering::Relaxed) + 1,
            handler: Arc::new(move |envelope, sender| handler(envelope, sender).boxed()),
        }
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("key", &self.key).finish()
    }
}

/// Snapshot of provider activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProviderStats {
    /// Envelopes handed to the host.
    pub sent: u64,
    /// Envelopes dispatched to local listeners.
    pub received: u64,
    /// Local listener turns that won the reply slot.
    pub claimed: u64,
    /// Sends that resolved with no value.
    pub absent: u64,
    /// Discipline violations detected on either side.
    pub violations: u64,
    /// Inbound values that were not ours.
    pub foreign: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    claimed: AtomicU64,
    absent: AtomicU64,
    violations: AtomicU64,
    foreign: AtomicU64,
}

struct Observer {
    context: ContextId,
    counters: Counters,
    metrics: Option<Arc<BusMetricsExporter>>,
}

impl Observer {
    fn sent(&self) {
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_sent();
        }
    }

    fn received(&self) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_received();
        }
    }

    fn claimed(&self) {
        self.counters.claimed.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_claimed();
        }
    }

    fn absent(&self) {
        self.counters.absent.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_absent();
        }
    }

    fn violation(&self) {
        self.counters.violations.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_violation();
        }
    }

    fn foreign(&self) {
        self.counters.foreign.fetch_add(1, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.observe_foreign();
        }
    }

    fn latency(&self, elapsed: Duration) {
        if let Some(metrics) = &self.metrics {
            metrics.observe_latency(elapsed);
        }
    }

    fn snapshot(&self) -> ProviderStats {
        ProviderStats {
            sent: self.counters.sent.load(Ordering::Relaxed),
            received: self.counters.received.load(Ordering::Relaxed),
            claimed: self.counters.claimed.load(Ordering::Relaxed),
            absent: self.counters.absent.load(Ordering::Relaxed),
            violations: self.counters.violations.load(Ordering::Relaxed),
            foreign: self.counters.foreign.load(Ordering::Relaxed),
        }
    }
}

/// One context's view of the host transport.
///
/// Keeps the table from logical [`Listener`]s to the host-level adapters
/// actually registered, since the host only knows the adapters.
pub struct TransportProvider {
    host: Arc<dyn HostTransport>,
    observer: Arc<Observer>,
    adapters: Mutex<HashMap<u64, HostListenerId>>,
}

impl fmt::Debug for TransportProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportProvider")
            .field("context", self.context())
            .field("transport", &self.host.name())
            .field("listeners", &self.adapters.lock().len())
            .finish()
    }
}

impl TransportProvider {
    /// Create a provider for `context` without metrics export.
    pub fn new(context: ContextId, host: Arc<dyn HostTransport>) -> Self {
        Self::build(context, host, None)
    }

    /// Create a provider that also feeds the given prometheus exporter.
    pub fn with_metrics(
        context: ContextId,
        host: Arc<dyn HostTransport>,
        metrics: Arc<BusMetricsExporter>,
    ) -> Self {
        Self::build(context, host, Some(metrics))
    }

    fn build(
        context: ContextId,
        host: Arc<dyn HostTransport>,
        metrics: Option<Arc<BusMetricsExporter>>,
    ) -> Self {
        Self {
            host,
            observer: Arc::new(Observer {
                context,
                counters: Counters::default(),
                metrics,
            }),
            adapters: Mutex::new(HashMap::new()),
        }
    }

    /// Context this provider speaks for.
    pub fn context(&self) -> &ContextId {
        &self.observer.context
    }

    /// Underlying host transport.
    pub fn host(&self) -> &Arc<dyn HostTransport> {
        &self.host
    }

    /// Inbound event source.
    pub fn on_message(&self) -> OnMessage<'_> {
        OnMessage { provider: self }
    }

    /// Activity counters.
    pub fn stats(&self) -> ProviderStats {
        self.observer.snapshot()
    }

    /// Send an envelope to every other context and return the winning reply.
    ///
    /// `Ok(None)` means no context claimed the reply slot, including the case
    /// where no other context listens at all.
    pub async fn send_message(&self, envelope: &Envelope) -> Result<Option<Response>> {
        let outbound = structured_clone(envelope)?;
        log_envelope(Flow::Outbound, envelope, self.context());
        self.observer.sent();

        let started = Instant::now();
        let result = self.host.send_message(self.context(), outbound).await;
        self.observer.latency(started.elapsed());

        let raw = match result {
            Ok(raw) => raw,
            Err(err) if err.is_no_receiving_end() => {
                debug!(
                    context = %self.context(),
                    action = %envelope.action(),
                    "no receiving end; resolving without value"
                );
                None
            }
            Err(err) => {
                warn!(
                    context = %self.context(),
                    action = %envelope.action(),
                    transport = self.host.name(),
                    error = %err,
                    "host transport failed"
                );
                return Err(err.into());
            }
        };

        let response = match raw {
            None => None,
            Some(raw) => match Reply::parse(raw, envelope.action()) {
                Ok(Some(reply)) => admit(envelope, reply).map_err(|err| {
                    self.observer.violation();
                    err
                })?,
                Ok(None) => {
                    warn!(action = %envelope.action(), "ignoring reply not produced by this bus");
                    None
                }
                Err(err) => {
                    self.observer.violation();
                    return Err(err);
                }
            },
        };

        if response.is_none() {
            self.observer.absent();
        }
        Ok(response)
    }

    fn adapt(&self, listener: &Listener, runtime: Handle) -> HostListener {
        let handler = Arc::clone(&listener.handler);
        let observer = Arc::clone(&self.observer);
        Arc::new(
            move |raw: &JsonValue, sender: &ContextId, slot: ReplySlot| -> bool {
                match Envelope::inspect(raw) {
                    Inspection::Foreign => {
                        observer.foreign();
                        trace!(context = %observer.context, "ignoring foreign message");
                    }
                    Inspection::Malformed { action, reason } => {
                        observer.violation();
                        error!(
                            context = %observer.context,
                            sender = %sender,
                            action = action.as_deref().unwrap_or("<unknown>"),
                            reason = %reason,
                            "malformed envelope carrying bus identifier"
                        );
                    }
                    Inspection::Valid(envelope) => {
                        let span = context_span(&observer.context);
                        runtime.spawn(
                            dispatch(
                                Arc::clone(&handler),
                                envelope,
                                sender.clone(),
                                slot,
                                Arc::clone(&observer),
                            )
                            .instrument(span),
                        );
                    }
                }
                // Some hosts close the slot for every context when one listener
                // declines synchronously, so always announce a possible reply.
                true
            },
        )
    }
}

async fn dispatch(
    handler: Arc<HandlerFn>,
    envelope: Envelope,
    sender: ContextId,
    slot: ReplySlot,
    observer: Arc<Observer>,
) {
    observer.received();
    log_envelope(Flow::Inbound, &envelope, &observer.context);

    let outcome = handler(envelope.clone(), sender.clone()).await;
    trace!(
        message_id = envelope.message_identifier(),
        handled = outcome.is_defined(),
        "listener turn finished"
    );
    let decision = match arbitrate(&envelope, outcome) {
        Ok(decision) => decision,
        Err(err) => {
            observer.violation();
            error!(
                context = %observer.context,
                sender = %sender,
                message_id = envelope.message_identifier(),
                error = %err,
                "listener broke response discipline; no reply sent"
            );
            drop(slot);
            return;
        }
    };
    trace!(
        context = %observer.context,
        message_id = envelope.message_identifier(),
        decision = decision.as_str(),
        "arbitrated"
    );

    let Some(reply) = decision.into_reply(envelope.direction()) else {
        return;
    };
    if !slot.is_open() {
        trace!(
            message_id = envelope.message_identifier(),
            "reply slot already taken; dropping reply"
        );
        return;
    }
    let claims = !matches!(reply.body(), ReplyBody::Nothing);
    let raw = match structured_clone(&reply) {
        Ok(raw) => raw,
        Err(err) => {
            error!(context = %observer.context, error = %err, "reply could not cross the boundary");
            return;
        }
    };
    if slot.send(raw) && claims {
        observer.claimed();
    }
}

/// Event source for inbound envelopes of one provider.
pub struct OnMessage<'a> {
    provider: &'a TransportProvider,
}

impl OnMessage<'_> {
    /// Register a listener. Must be called inside a tokio runtime, which is
    /// where the listener's turns will run.
    pub fn add_listener(&self, listener: &Listener) -> Result<()> {
        let runtime = Handle::try_current().map_err(|_| BusError::RuntimeUnavailable)?;
        let mut adapters = self.provider.adapters.lock();
        if adapters.contains_key(&listener.key) {
            return Err(BusError::DuplicateListener {
                channel: format!("{}/onMessage", self.provider.context()),
            });
        }
        let adapter = self.provider.adapt(listener, runtime);
        let id = self
            .provider
            .host
            .add_listener(self.provider.context(), adapter)?;
        adapters.insert(listener.key, id);
        Ok(())
    }

    /// Remove a listener. Returns whether it was registered.
    ///
    /// Turns already dispatched to the listener still run to completion.
    pub fn remove_listener(&self, listener: &Listener) -> bool {
        let Some(id) = self.provider.adapters.lock().remove(&listener.key) else {
            return false;
        };
        self.provider
            .host
            .remove_listener(self.provider.context(), id)
    }

    /// Whether the listener is registered with the host.
    pub fn has_listener(&self, listener: &Listener) -> bool {
        let id = self.provider.adapters.lock().get(&listener.key).copied();
        id.map(|id| self.provider.host.has_listener(self.provider.context(), id))
            .unwrap_or(false)
    }

    /// Number of listeners this provider tracks.
    pub fn len(&self) -> usize {
        self.provider.adapters.lock().len()
    }

    /// Whether no listener is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
