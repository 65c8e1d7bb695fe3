//! Event normalization and fan-out.
//!
//! Wire-level event names use the server's vocabulary (dotted names plus a
//! few legacy aliases); consumers subscribe by canonical name. Unknown wire
//! names pass through unchanged so new server event types reach listeners
//! without a client release.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use opswire_proto::RawEnvelope;

/// Wildcard topic: listeners registered here see every normalized event.
pub const WILDCARD: &str = "*";

static CANONICAL_NAMES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("order.created", "order_created"),
        ("order.updated", "order_updated"),
        ("order.status.changed", "order_status_changed"),
        ("order.deleted", "order_deleted"),
        // aliases still emitted by older backends
        ("order_status", "order_status_changed"),
        ("new_message", "message_created"),
        ("chat.message.created", "message_created"),
        ("chat.conversation.updated", "conversation_updated"),
    ])
});

/// Canonical name for a wire-level event name, with identity fallback.
pub fn canonical_event(raw: &str) -> &str {
    CANONICAL_NAMES.get(raw).copied().unwrap_or(raw)
}

/// A normalized event. Immutable once constructed; listeners receive a
/// shared reference and route any state changes through the stores.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub canonical_type: String,
    pub raw_type: String,
    pub entity_id: Option<String>,
    pub payload: Map<String, Value>,
    pub received_at: Instant,
}

impl EventEnvelope {
    pub fn from_wire(raw: RawEnvelope) -> Self {
        let canonical_type = canonical_event(&raw.frame_type).to_string();
        let entity_id = raw
            .entity_id
            .clone()
            .or_else(|| extract_entity_id(&raw.payload));
        Self {
            canonical_type,
            raw_type: raw.frame_type,
            entity_id,
            payload: raw.payload,
            received_at: Instant::now(),
        }
    }
}

fn extract_entity_id(payload: &Map<String, Value>) -> Option<String> {
    for key in ["entity_id", "order_id", "conversation_id", "id"] {
        if let Some(id) = payload.get(key).and_then(Value::as_str) {
            return Some(id.to_string());
        }
    }
    None
}

type EventCallback = Arc<dyn Fn(&EventEnvelope) + Send + Sync>;

struct Listener {
    id: u64,
    active: Arc<AtomicBool>,
    callback: EventCallback,
}

#[derive(Default)]
struct Registry {
    exact: HashMap<String, Vec<Listener>>,
    wildcard: Vec<Listener>,
}

/// Synchronous fan-out dispatcher with exact-topic and wildcard listeners.
#[derive(Default)]
pub struct EventBus {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. The returned handle removes exactly this
    /// registration; dropping it without `dispose` leaves the listener in
    /// place.
    pub fn subscribe(
        self: &Arc<Self>,
        event: &str,
        callback: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let listener = Listener {
            id,
            active: active.clone(),
            callback: Arc::new(callback),
        };

        let key = if event == WILDCARD {
            let mut registry = self.registry.write();
            registry.wildcard.push(listener);
            None
        } else {
            let mut registry = self.registry.write();
            registry
                .exact
                .entry(event.to_string())
                .or_default()
                .push(listener);
            Some(event.to_string())
        };

        Subscription {
            bus: Arc::downgrade(self),
            key,
            id,
            active,
        }
    }

    /// Invoke exact-topic listeners, then wildcard listeners, each group in
    /// registration order. The registry lock is released before callbacks
    /// run, so listeners may subscribe or dispose from inside a callback. A
    /// panicking listener is logged and does not stop dispatch.
    pub fn publish(&self, envelope: &EventEnvelope) {
        let callbacks: Vec<(u64, Arc<AtomicBool>, EventCallback)> = {
            let registry = self.registry.read();
            let exact = registry
                .exact
                .get(&envelope.canonical_type)
                .into_iter()
                .flatten();
            exact
                .chain(registry.wildcard.iter())
                .map(|l| (l.id, l.active.clone(), l.callback.clone()))
                .collect()
        };

        for (id, active, callback) in callbacks {
            if !active.load(Ordering::Acquire) {
                continue;
            }
            if catch_unwind(AssertUnwindSafe(|| callback(envelope))).is_err() {
                tracing::warn!(
                    event = %envelope.canonical_type,
                    listener = id,
                    "listener panicked during dispatch"
                );
            }
        }
    }

    fn remove(&self, key: Option<&str>, id: u64) {
        let mut registry = self.registry.write();
        match key {
            Some(event) => {
                if let Some(listeners) = registry.exact.get_mut(event) {
                    listeners.retain(|l| l.id != id);
                    if listeners.is_empty() {
                        registry.exact.remove(event);
                    }
                }
            }
            None => registry.wildcard.retain(|l| l.id != id),
        }
    }

    #[cfg(test)]
    fn listener_count(&self) -> usize {
        let registry = self.registry.read();
        registry.exact.values().map(Vec::len).sum::<usize>() + registry.wildcard.len()
    }
}

/// Capability handle returned by [`EventBus::subscribe`].
pub struct Subscription {
    bus: Weak<EventBus>,
    key: Option<String>,
    id: u64,
    active: Arc<AtomicBool>,
}

impl Subscription {
    /// Remove the registration. Safe to call any number of times.
    pub fn dispose(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(self.key.as_deref(), self.id);
        }
    }
}
