//! Real-time state reconciliation engine for the operations dashboard.
//!
//! One [`scope::RealtimeScope`] per logical view (a single account, or the
//! all-accounts dashboard) owns a push connection, an event dispatcher, an
//! optimistic override store, and a refresh coordinator. Consumers render
//! through [`overrides::OverrideStore::effective_status`] and react to
//! [`events::EventBus`] subscriptions plus the connection-state watch.

pub mod api;
mod channel;
pub mod config;
pub mod connection;
pub mod events;
pub mod overrides;
pub mod refresh;
pub mod scope;
pub mod telemetry;

pub use api::{ApiError, EntityApi, RestApi};
pub use config::{BackoffConfig, PushScope, RefreshConfig, ScopeConfig, ScopeConfigBuilder};
pub use connection::{ConnectionManager, ConnectionState, ConnectionStatus};
pub use events::{EventBus, EventEnvelope, Subscription, WILDCARD};
pub use overrides::{OverrideEntry, OverridePhase, OverrideStore};
pub use refresh::{RefreshCoordinator, RefreshPriority};
pub use scope::{MutationError, RealtimeScope};

pub use opswire_proto as proto;
