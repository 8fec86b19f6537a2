//! ---
//! parley_section: "02-cross-context-messaging"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Cross-context message bus, arbitration and broadcaster."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
//! Named-event publish/subscribe over the bus.
//!
//! Handlers subscribe to one event name each and receive the event's payload
//! (or `null`). Publishing returns every non-null reply that made it back;
//! with request semantics that is at most one.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};

use crate::arbitrator::HandlerOutcome;
use crate::bus::Bus;
use crate::envelope::{Envelope, Pattern, Response};
use crate::clone::structured_clone;
use crate::provider::Listener;
use crate::{Action, Result};

static NEXT_HANDLER_KEY: AtomicU64 = AtomicU64::new(0);

type EventFn = dyn Fn(JsonValue) -> BoxFuture<'static, HandlerOutcome> + Send + Sync;

/// Async handler for one named event.
///
/// Clones share identity, so registering a clone for the same event is
/// rejected as a duplicate.
#[derive(Clone)]
pub struct EventHandler {
    key: u64,
    handler: Arc<EventFn>,
}

impl EventHandler {
    /// Wrap an async handler receiving the event payload.
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerOutcome> + Send + 'static,
    {
        Self {
            key: NEXT_HANDLER_KEY.fetch_add(1, Ordering::Relaxed) + 1,
            handler: Arc::new(move |payload| handler(payload).boxed()),
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandler").field("key", &self.key).finish()
    }
}

/// Unregisters one handler. Only the first [`KillSwitch::kill`] has an effect.
///
/// Dropping the switch leaves the handler registered.
pub struct KillSwitch {
    bus: Arc<Bus>,
    event: Action,
    key: u64,
    armed: AtomicBool,
}

impl KillSwitch {
    /// Unregister the handler. Returns `false` when already killed.
    pub fn kill(&self) -> bool {
        if !self.armed.swap(false, Ordering::AcqRel) {
            return false;
        }
        let removed = self.bus.unsubscribe(&self.event, self.key);
        debug!(context = %self.bus.context(), event = %self.event, removed, "event handler killed");
        removed
    }

    /// Whether [`KillSwitch::kill`] has not been called yet.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for KillSwitch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KillSwitch")
            .field("event", &self.event)
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// Pub/sub facade for one context.
///
/// Cheap to build; any number may share one bus, and subscriptions made
/// through one are visible to all of them.
pub struct Broadcaster {
    bus: Arc<Bus>,
}

impl Broadcaster {
    /// Publish and subscribe through `bus`.
    pub fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }

    /// Underlying bus.
    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Subscribe `handler` to `event`.
    ///
    /// The handler only runs for envelopes carrying `event`; for every other
    /// action it reports no opinion so some other context may answer.
    pub fn register_listening_action(
        &self,
        event: &str,
        handler: &EventHandler,
    ) -> Result<KillSwitch> {
        let action = Action::new(event)?;

        let callback = Arc::clone(&handler.handler);
        let wanted = action.clone();
        let listener = Listener::new(move |envelope: Envelope, _sender| {
            let callback = Arc::clone(&callback);
            let payload = (envelope.action() == &wanted)
                .then(|| envelope.datum().cloned().unwrap_or(JsonValue::Null));
            async move {
                match payload {
                    Some(payload) => callback(payload).await,
                    None => HandlerOutcome::Absent,
                }
            }
        });
        self.bus.subscribe(&action, handler.key, listener)?;

        debug!(context = %self.bus.context(), event, "event handler registered");
        Ok(KillSwitch {
            bus: Arc::clone(&self.bus),
            event: action,
            key: handler.key,
            armed: AtomicBool::new(true),
        })
    }

    /// Whether `handler` is currently subscribed to `event`.
    pub fn is_registered(&self, event: &str, handler: &EventHandler) -> bool {
        let Ok(action) = Action::new(event) else {
            return false;
        };
        self.bus.is_subscribed(&action, handler.key)
    }

    /// Number of live subscriptions across all events on the shared bus.
    pub fn handler_count(&self) -> usize {
        self.bus.subscription_count()
    }

    /// Publish `event` to every other context, expecting at most one answer.
    pub async fn broadcast_event<T: Serialize + ?Sized>(
        &self,
        event: &str,
        data: &T,
    ) -> Result<Vec<Response>> {
        self.broadcast_event_with(Pattern::Request, event, data)
            .await
    }

    /// Publish `event` with an explicit interaction pattern.
    pub async fn broadcast_event_with<T: Serialize + ?Sized>(
        &self,
        pattern: Pattern,
        event: &str,
        data: &T,
    ) -> Result<Vec<Response>> {
        let action = Action::new(event)?;
        let datum = structured_clone(data)?;
        let datum = (!datum.is_null()).then_some(datum);

        let replies: Vec<Response> = self
            .bus
            .send(pattern, &action, datum)
            .await?
            .into_iter()
            .filter(|reply| !matches!(reply, Response::Value(JsonValue::Null)))
            .collect();
        info!(
            context = %self.bus.context(),
            event,
            replies = replies.len(),
            "event broadcast"
        );
        Ok(replies)
    }
}
