//! Per-scope aggregate: one explicitly constructed, explicitly destroyed
//! object owning the push connection, dispatcher, override store and
//! refresh coordinator for a logical dashboard view.

use std::sync::Arc;

use tokio::sync::watch;

use crate::api::{ApiError, EntityApi};
use crate::config::ScopeConfig;
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::events::{EventBus, EventEnvelope, Subscription};
use crate::overrides::OverrideStore;
use crate::refresh::{RefetchFn, RefreshCoordinator, RefreshError, RefreshPriority};

/// Canonical events whose arrival means our entity list may be out of
/// date. Bursts coalesce in the refresh coordinator.
const REFRESH_EVENTS: &[&str] = &[
    "order_updated",
    "order_status_changed",
    "order_deleted",
    "conversation_updated",
    "message_created",
];

/// Brand-new entities should appear without waiting for the coalesce
/// window.
const IMMEDIATE_EVENTS: &[&str] = &["order_created"];

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("mutation rejected for {entity_id}: {source}")]
    Rejected {
        entity_id: String,
        #[source]
        source: ApiError,
    },
}

pub struct RealtimeScope {
    bus: Arc<EventBus>,
    overrides: Arc<OverrideStore>,
    refresh: RefreshCoordinator,
    connection: ConnectionManager,
    api: Arc<dyn EntityApi>,
    // Held so the push-to-refresh wiring stays registered for the scope's
    // lifetime.
    _internal_subs: Vec<Subscription>,
}

impl RealtimeScope {
    pub fn new(config: ScopeConfig, api: Arc<dyn EntityApi>) -> Self {
        let config = Arc::new(config);
        let bus = Arc::new(EventBus::new());
        let overrides = Arc::new(OverrideStore::new(config.override_stale_after));

        let refetch: RefetchFn = {
            let api = api.clone();
            let overrides = overrides.clone();
            Arc::new(move || {
                let api = api.clone();
                let overrides = overrides.clone();
                Box::pin(async move {
                    let snapshot = api
                        .fetch_all()
                        .await
                        .map_err(|err| RefreshError(err.to_string()))?;
                    overrides.reconcile(&snapshot);
                    Ok(())
                })
            })
        };
        let refresh = RefreshCoordinator::new(config.refresh.clone(), refetch);

        let mut internal_subs = Vec::new();
        for event in REFRESH_EVENTS {
            let requester = refresh.requester();
            internal_subs.push(bus.subscribe(event, move |_| {
                requester.request(RefreshPriority::Normal);
            }));
        }
        for event in IMMEDIATE_EVENTS {
            let requester = refresh.requester();
            internal_subs.push(bus.subscribe(event, move |_| {
                requester.request(RefreshPriority::Immediate);
            }));
        }

        let connection = ConnectionManager::spawn(config, bus.clone());

        Self {
            bus,
            overrides,
            refresh,
            connection,
            api,
            _internal_subs: internal_subs,
        }
    }

    pub fn connect(&self) {
        self.connection.connect();
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn reconnect(&self) {
        self.connection.reconnect();
    }

    pub fn set_token(&self, token: Option<String>) {
        self.connection.set_token(token);
    }

    pub fn subscribe_conversation(&self, conversation_id: impl Into<String>) {
        self.connection.subscribe_conversation(conversation_id);
    }

    pub fn notify_visible(&self) {
        self.connection.notify_visible();
    }

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.status()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    /// Register a listener for a canonical event name (or [`crate::WILDCARD`]).
    pub fn subscribe(
        &self,
        event: &str,
        callback: impl Fn(&EventEnvelope) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.subscribe(event, callback)
    }

    /// The merged view consumers render: override first, authoritative
    /// otherwise.
    pub fn effective_status(&self, entity_id: &str, authoritative: &str) -> String {
        self.overrides.effective_status(entity_id, authoritative)
    }

    pub fn overrides(&self) -> &OverrideStore {
        &self.overrides
    }

    pub fn request_refresh(&self, priority: RefreshPriority) {
        self.refresh.request(priority);
    }

    /// Outcome of the most recent refetch, for an error toast or banner.
    pub fn refresh_error(&self) -> watch::Receiver<Option<String>> {
        self.refresh.last_error()
    }

    /// Optimistic mutation entry point: park an override, ask the server,
    /// then confirm or roll back. A rejection reaches the caller so the UI
    /// can show its own recovery affordance; nothing retries automatically.
    pub async fn apply_user_mutation(
        &self,
        entity_id: &str,
        new_status: &str,
        current_status: &str,
    ) -> Result<(), MutationError> {
        self.overrides
            .begin_override(entity_id, new_status, current_status);
        match self.api.set_status(entity_id, new_status).await {
            Ok(()) => {
                self.overrides.confirm_override(entity_id);
                Ok(())
            }
            Err(source) => {
                self.overrides.rollback_override(entity_id);
                Err(MutationError::Rejected {
                    entity_id: entity_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Destroy the scope: aborts the connection actor and the refresh
    /// coordinator, cancelling their timers.
    pub async fn shutdown(self) {
        self.connection.shutdown().await;
        self.refresh.shutdown().await;
    }
}
