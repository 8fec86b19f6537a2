//! ---
//! parley_section: "02-cross-context-messaging"
//! parley_subsection: "module"
//! parley_type: "source"
//! parley_scope: "code"
//! parley_description: "Cross-context message bus, arbitration and broadcaster."
//! parley_version: "v0.0.0-prealpha"
//! parley_owner: "tbd"
//! ---
//! Host transport primitives.
//!
//! The extension host offers two things: a per-context registry of inbound
//! listeners and a "send, await at most one reply" call that reaches every
//! listener in every *other* context. [`HostTransport`] captures that
//! capability; [`InMemoryHost`] implements it for a set of contexts living in
//! one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use parley_common::HostFlavor;
use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::identity::ContextId;

/// Failures reported by the host transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// No listener in any other context exists.
    #[error("Could not establish connection. Receiving end does not exist.")]
    NoReceivingEnd,
    /// The calling context is gone or the channel broke.
    #[error("disconnected: {0}")]
    Disconnected(String),
    /// The context was never opened on this host.
    #[error("unknown context '{0}'")]
    UnknownContext(String),
}

impl HostError {
    /// Whether this is the expected "nobody handled it" outcome.
    pub fn is_no_receiving_end(&self) -> bool {
        matches!(self, HostError::NoReceivingEnd)
    }
}

/// Opaque handle of a listener registered with the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostListenerId(u64);

/// Raw host-level listener.
///
/// Receives the shared inbound value, the sender's identity and this
/// listener's reply slot. Returning `true` tells the host a reply may still
/// follow asynchronously.
pub type HostListener = Arc<dyn Fn(&JsonValue, &ContextId, ReplySlot) -> bool + Send + Sync>;

struct SlotState {
    tx: Mutex<Option<mpsc::Sender<JsonValue>>>,
    claimed: Arc<AtomicBool>,
}

/// One listener's right to answer a single call. Dropping it unused declines.
pub struct ReplySlot {
    state: Arc<SlotState>,
}

impl ReplySlot {
    /// Offer a reply. Returns `true` when this reply won the call's single slot.
    pub fn send(self, reply: JsonValue) -> bool {
        let Some(tx) = self.state.tx.lock().take() else {
            return false;
        };
        if self
            .state
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        tx.try_send(reply).is_ok()
    }

    /// Whether the slot can still accept a reply.
    pub fn is_open(&self) -> bool {
        self.state.tx.lock().is_some() && !self.state.claimed.load(Ordering::Acquire)
    }
}

/// Capability offered by the extension host platform.
#[async_trait]
pub trait HostTransport: Send + Sync {
    /// Register an inbound listener for `context`.
    fn add_listener(
        &self,
        context: &ContextId,
        listener: HostListener,
    ) -> Result<HostListenerId, HostError>;

    /// Remove a listener; returns whether it was registered.
    fn remove_listener(&self, context: &ContextId, id: HostListenerId) -> bool;

    /// Whether the listener is currently registered.
    fn has_listener(&self, context: &ContextId, id: HostListenerId) -> bool;

    /// Deliver `message` to every other context and await at most one reply.
    async fn send_message(
        &self,
        from: &ContextId,
        message: JsonValue,
    ) -> Result<Option<JsonValue>, HostError>;

    /// Whether `context` is currently running.
    fn is_open(&self, context: &ContextId) -> bool;

    /// Human-readable transport name for logging.
    fn name(&self) -> &'static str;
}

#[derive(Default)]
struct Registry {
    contexts: HashMap<ContextId, Vec<(HostListenerId, HostListener)>>,
}

/// Host transport connecting contexts that live in the same process.
pub struct InMemoryHost {
    flavor: HostFlavor,
    registry: RwLock<Registry>,
    next_listener: AtomicU64,
}

impl InMemoryHost {
    /// Create a host with the given decline behaviour.
    pub fn new(flavor: HostFlavor) -> Self {
        Self {
            flavor,
            registry: RwLock::new(Registry::default()),
            next_listener: AtomicU64::new(0),
        }
    }

    /// Host behaviour configured at construction.
    pub fn flavor(&self) -> HostFlavor {
        self.flavor
    }

    /// Start a context. Opening an already open context is a no-op.
    pub fn open_context(&self, context: &ContextId) {
        let mut guard = self.registry.write();
        guard.contexts.entry(context.clone()).or_default();
        debug!(context = %context, "context opened");
    }

    /// Tear a context down together with all of its listeners.
    pub fn close_context(&self, context: &ContextId) -> bool {
        let removed = self.registry.write().contexts.remove(context);
        if let Some(listeners) = &removed {
            debug!(context = %context, listeners = listeners.len(), "context closed");
        }
        removed.is_some()
    }

    /// Number of listeners registered by `context`.
    pub fn listener_count(&self, context: &ContextId) -> usize {
        self.registry
            .read()
            .contexts
            .get(context)
            .map(Vec::len)
            .unwrap_or_default()
    }
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new(HostFlavor::default())
    }
}

#[async_trait]
impl HostTransport for InMemoryHost {
    fn add_listener(
        &self,
        context: &ContextId,
        listener: HostListener,
    ) -> Result<HostListenerId, HostError> {
        let mut guard = self.registry.write();
        let listeners = guard
            .contexts
            .get_mut(context)
            .ok_or_else(|| HostError::UnknownContext(context.to_string()))?;
        let id = HostListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed) + 1);
        listeners.push((id, listener));
        Ok(id)
    }

    fn remove_listener(&self, context: &ContextId, id: HostListenerId) -> bool {
        let mut guard = self.registry.write();
        let Some(listeners) = guard.contexts.get_mut(context) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    fn has_listener(&self, context: &ContextId, id: HostListenerId) -> bool {
        self.registry
            .read()
            .contexts
            .get(context)
            .map(|listeners| listeners.iter().any(|(existing, _)| *existing == id))
            .unwrap_or(false)
    }

    async fn send_message(
        &self,
        from: &ContextId,
        message: JsonValue,
    ) -> Result<Option<JsonValue>, HostError> {
        let targets: Vec<HostListener> = {
            let guard = self.registry.read();
            if !guard.contexts.contains_key(from) {
                return Err(HostError::Disconnected(format!(
                    "context '{}' is closed",
                    from
                )));
            }
            guard
                .contexts
                .iter()
                .filter(|(context, _)| *context != from)
                .flat_map(|(_, listeners)| listeners.iter().map(|(_, l)| Arc::clone(l)))
                .collect()
        };
        if targets.is_empty() {
            return Err(HostError::NoReceivingEnd);
        }

        let (tx, mut rx) = mpsc::channel(targets.len());
        let claimed = Arc::new(AtomicBool::new(false));
        let mut foreclosed = false;

        for listener in &targets {
            let state = Arc::new(SlotState {
                tx: Mutex::new(Some(tx.clone())),
                claimed: Arc::clone(&claimed),
            });
            let slot = ReplySlot {
                state: Arc::clone(&state),
            };
            let keep_open = listener(&message, from, slot);
            if !keep_open {
                // A synchronous decline closes this listener's slot.
                state.tx.lock().take();
                if self.flavor == HostFlavor::Strict {
                    foreclosed = true;
                }
            }
        }
        drop(tx);

        if foreclosed {
            claimed.store(true, Ordering::Release);
            let early = rx.try_recv().ok();
            trace!(from = %from, replied = early.is_some(), "reply slot foreclosed by synchronous decline");
            return Ok(early);
        }
        Ok(rx.recv().await)
    }

    fn is_open(&self, context: &ContextId) -> bool {
        self.registry.read().contexts.contains_key(context)
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ContextKind;
    use serde_json::json;

    fn answering(value: JsonValue) -> HostListener {
        Arc::new(move |_msg: &JsonValue, _from: &ContextId, slot: ReplySlot| {
            slot.send(value.clone());
            true
        })
    }

    fn declining() -> HostListener {
        Arc::new(|_msg: &JsonValue, _from: &ContextId, _slot: ReplySlot| false)
    }

    #[tokio::test]
    async fn no_listener_elsewhere_is_no_receiving_end() {
        let host = InMemoryHost::default();
        let popup = ContextId::generate(ContextKind::Popup);
        host.open_context(&popup);
        host.add_listener(&popup, answering(json!(1))).expect("add");

        let err = host
            .send_message(&popup, json!({}))
            .await
            .expect_err("own listeners are not targets");
        assert!(err.is_no_receiving_end());
    }

    #[tokio::test]
    async fn first_reply_wins() {
        let host = InMemoryHost::default();
        let popup = ContextId::generate(ContextKind::Popup);
        let background = ContextId::background();
        host.open_context(&popup);
        host.open_context(&background);
        host.add_listener(&background, answering(json!("first"))).expect("add");
        host.add_listener(&background, answering(json!("second"))).expect("add");

        let reply = host.send_message(&popup, json!({})).await.expect("send");
        assert_eq!(reply, Some(json!("first")));
    }

    #[tokio::test]
    async fn resolves_empty_when_everyone_declines() {
        let host = InMemoryHost::default();
        let popup = ContextId::generate(ContextKind::Popup);
        let background = ContextId::background();
        host.open_context(&popup);
        host.open_context(&background);
        host.add_listener(&background, declining()).expect("add");
        host.add_listener(
            &background,
            Arc::new(|_m: &JsonValue, _f: &ContextId, slot: ReplySlot| {
                drop(slot);
                true
            }),
        )
        .expect("add");

        let reply = host.send_message(&popup, json!({})).await.expect("send");
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn strict_host_forecloses_on_synchronous_decline() {
        let host = InMemoryHost::new(HostFlavor::Strict);
        assert_eq!(host.flavor(), HostFlavor::Strict);
        let popup = ContextId::generate(ContextKind::Popup);
        let background = ContextId::background();
        host.open_context(&popup);
        host.open_context(&background);
        host.add_listener(&background, declining()).expect("add");
        host.add_listener(
            &background,
            Arc::new(|_m: &JsonValue, _f: &ContextId, slot: ReplySlot| {
                tokio::spawn(async move {
                    slot.send(json!("late"));
                });
                true
            }),
        )
        .expect("add");

        let reply = host.send_message(&popup, json!({})).await.expect("send");
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn lenient_host_waits_for_asynchronous_reply() {
        let host = InMemoryHost::new(HostFlavor::Lenient);
        let popup = ContextId::generate(ContextKind::Popup);
        let background = ContextId::background();
        host.open_context(&popup);
        host.open_context(&background);
        host.add_listener(&background, declining()).expect("add");
        host.add_listener(
            &background,
            Arc::new(|_m: &JsonValue, _f: &ContextId, slot: ReplySlot| {
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    slot.send(json!("late"));
                });
                true
            }),
        )
        .expect("add");

        let reply = host.send_message(&popup, json!({})).await.expect("send");
        assert_eq!(reply, Some(json!("late")));
    }

    #[tokio::test]
    async fn closing_a_context_drops_its_listeners() {
        let host = InMemoryHost::default();
        let popup = ContextId::generate(ContextKind::Popup);
        let background = ContextId::background();
        host.open_context(&popup);
        host.open_context(&background);
        let id = host.add_listener(&background, answering(json!(1))).expect("add");
        assert!(host.has_listener(&background, id));

        assert!(host.close_context(&background));
        assert!(!host.has_listener(&background, id));
        assert!(!host.is_open(&background));
        let err = host
            .send_message(&popup, json!({}))
            .await
            .expect_err("nobody left");
        assert!(err.is_no_receiving_end());

        let err = host
            .send_message(&background, json!({}))
            .await
            .expect_err("closed sender");
        assert!(matches!(err, HostError::Disconnected(_)));
    }

    #[test]
    fn listeners_need_an_open_context() {
        let host = InMemoryHost::default();
        let err = host
            .add_listener(&ContextId::background(), answering(json!(1)))
            .expect_err("context not open");
        assert!(matches!(err, HostError::UnknownContext(_)));
    }
}
