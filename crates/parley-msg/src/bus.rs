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
use std::sync::Arc;

use parking_lot::Mutex;
use parley_common::LocateConfig;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::envelope::{Envelope, Pattern, Response};
use crate::getter::{BackgroundLocator, ProviderGetter};
use crate::host::HostTransport;
use crate::identity::{ContextId, ContextKind};
use crate::logging::BusMetricsExporter;
use crate::provider::{Listener, TransportProvider};
use crate::{Action, BusError, Result};

/// One context's bus: listeners register locally, sends go to everyone else.
///
/// Named-event subscriptions live here rather than in each broadcaster, so
/// every broadcaster sharing a bus sees the same `(event, handler)` table.
pub struct Bus {
    local: Arc<TransportProvider>,
    remote: ProviderGetter,
    subscriptions: Mutex<HashMap<(Action, u64), Listener>>,
}

impl Bus {
    /// Compose a bus from an explicit local provider and send endpoint.
    pub fn new(local: Arc<TransportProvider>, remote: ProviderGetter) -> Self {
        Self {
            local,
            remote,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Wire `context` onto `host`, choosing how the send endpoint is resolved.
    ///
    /// The background is always reachable from itself; every other kind waits
    /// for the background to be open before its first send.
    pub fn connect(
        host: Arc<dyn HostTransport>,
        context: ContextId,
        locate: LocateConfig,
        metrics: Option<Arc<BusMetricsExporter>>,
    ) -> Self {
        let local = Arc::new(match metrics {
            Some(metrics) => TransportProvider::with_metrics(context, host, metrics),
            None => TransportProvider::new(context, host),
        });
        let remote = match local.context().kind() {
            ContextKind::Background => ProviderGetter::resolved(Arc::clone(&local)),
            ContextKind::Popup | ContextKind::Options | ContextKind::Content => {
                ProviderGetter::deferred(Arc::new(BackgroundLocator::new(
                    Arc::clone(&local),
                    locate,
                )))
            }
        };
        debug!(context = %local.context(), deferred = !remote.is_resolved(), "bus connected");
        Self::new(local, remote)
    }

    /// Identity of the owning context.
    pub fn context(&self) -> &ContextId {
        self.local.context()
    }

    /// Local provider receiving inbound envelopes.
    pub fn local(&self) -> &Arc<TransportProvider> {
        &self.local
    }

    /// Send endpoint getter.
    pub fn remote(&self) -> &ProviderGetter {
        &self.remote
    }

    /// Register a listener on the local provider.
    pub fn listen(&self, listener: &Listener) -> Result<()> {
        self.local.on_message().add_listener(listener)
    }

    /// Unregister a listener. Returns whether it was registered.
    pub fn unlisten(&self, listener: &Listener) -> bool {
        self.local.on_message().remove_listener(listener)
    }

    /// Register `listener` as the subscription of handler `key` to `event`.
    pub(crate) fn subscribe(&self, event: &Action, key: u64, listener: Listener) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock();
        let entry = (event.clone(), key);
        if subscriptions.contains_key(&entry) {
            return Err(BusError::DuplicateListener {
                channel: event.to_string(),
            });
        }
        self.listen(&listener)?;
        subscriptions.insert(entry, listener);
        Ok(())
    }

    /// Drop the subscription of handler `key` to `event`. Returns whether the
    /// host still held its listener.
    pub(crate) fn unsubscribe(&self, event: &Action, key: u64) -> bool {
        let removed = self.subscriptions.lock().remove(&(event.clone(), key));
        match removed {
            Some(listener) => self.unlisten(&listener),
            None => false,
        }
    }

    pub(crate) fn is_subscribed(&self, event: &Action, key: u64) -> bool {
        self.subscriptions.lock().contains_key(&(event.clone(), key))
    }

    /// Number of live event subscriptions on this bus.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Send an envelope built from `pattern` and return the winning reply.
    pub async fn send(
        &self,
        pattern: Pattern,
        action: &Action,
        datum: Option<JsonValue>,
    ) -> Result<Option<Response>> {
        let envelope = Envelope::new(pattern, action.clone(), datum);
        let endpoint = self.remote.get().await?;
        endpoint.send_message(&envelope).await
    }

    /// Fire-and-forget.
    pub async fn trigger(&self, action: &Action, datum: Option<JsonValue>) -> Result<()> {
        self.send(Pattern::Trigger, action, datum).await.map(|_| ())
    }

    /// Ask for exactly one meaningful reply. `Ok(None)` if nobody answered.
    pub async fn request(
        &self,
        action: &Action,
        datum: Option<JsonValue>,
    ) -> Result<Option<Response>> {
        self.send(Pattern::Request, action, datum).await
    }

    /// Broadcast to every listener. With `acknowledged`, returns whether some
    /// context confirmed completion; otherwise always `false`.
    pub async fn shout(
        &self,
        action: &Action,
        datum: Option<JsonValue>,
        acknowledged: bool,
    ) -> Result<bool> {
        let pattern = if acknowledged {
            Pattern::AcknowledgedShout
        } else {
            Pattern::SilentShout
        };
        let response = self.send(pattern, action, datum).await?;
        Ok(matches!(response, Some(Response::Done)))
    }
}
