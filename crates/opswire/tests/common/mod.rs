#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use opswire::api::{ApiError, EntityApi};
use opswire::config::{BackoffConfig, ScopeConfigBuilder};
use opswire::proto::EntitySnapshot;

/// One accepted push connection, handed to the test to script.
pub struct PushConn {
    pub token: String,
    pub socket: WebSocket,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(conns): State<mpsc::UnboundedSender<PushConn>>,
) -> impl IntoResponse {
    let token = params.get("token").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| async move {
        let _ = conns.send(PushConn { token, socket });
    })
}

/// Fake push endpoint. Accepted sockets are delivered on the returned
/// receiver; the test drives each one directly.
pub async fn start_push_server() -> Result<(SocketAddr, mpsc::UnboundedReceiver<PushConn>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let rx = start_push_server_on(listener);
    Ok((addr, rx))
}

/// Serve the fake push endpoint on an already-bound listener.
pub fn start_push_server_on(listener: TcpListener) -> mpsc::UnboundedReceiver<PushConn> {
    let (tx, rx) = mpsc::unbounded_channel();
    let app = Router::new()
        .route("/push/firehose", get(ws_handler))
        .with_state(tx);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    rx
}

/// Builder preconfigured with short timings suitable for tests.
pub fn test_config(addr: SocketAddr) -> ScopeConfigBuilder {
    ScopeConfigBuilder::new()
        .server_url(format!("127.0.0.1:{}", addr.port()))
        .token("secret-token")
        .connect_timeout(Duration::from_secs(2))
        .heartbeat_interval(Duration::from_millis(200))
        .backoff(BackoffConfig {
            base_delay: Duration::from_millis(50),
            multiplier: 2.0,
            cap_delay: Duration::from_millis(200),
            max_attempts: 10,
        })
}

pub async fn expect_conn(conns: &mut mpsc::UnboundedReceiver<PushConn>) -> Result<PushConn> {
    tokio::time::timeout(Duration::from_secs(5), conns.recv())
        .await
        .context("timed out waiting for a push connection")?
        .context("push server dropped")
}

/// Next text frame as JSON, answering heartbeat pings along the way so the
/// client's liveness check stays happy.
pub async fn next_frame(socket: &mut WebSocket) -> Result<serde_json::Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.recv())
            .await
            .context("timed out waiting for a frame")?
            .context("socket closed")??;
        if let Message::Text(text) = message {
            let value: serde_json::Value = serde_json::from_str(&text)?;
            if value["type"] == "ping" {
                send_json(socket, &serde_json::json!({"type": "pong"})).await?;
                continue;
            }
            return Ok(value);
        }
    }
}

/// Like [`next_frame`] but returns pings instead of answering them.
pub async fn next_raw_frame(socket: &mut WebSocket) -> Result<serde_json::Value> {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.recv())
            .await
            .context("timed out waiting for a frame")?
            .context("socket closed")??;
        if let Message::Text(text) = message {
            return Ok(serde_json::from_str(&text)?);
        }
    }
}

pub async fn send_json(socket: &mut WebSocket, value: &serde_json::Value) -> Result<()> {
    socket
        .send(Message::Text(serde_json::to_string(value)?))
        .await?;
    Ok(())
}

/// In-memory REST collaborator. `set_status` succeeds or fails on command
/// but never updates the snapshot by itself, so tests control server lag
/// explicitly through [`FakeApi::set_entity`].
pub struct FakeApi {
    entities: Mutex<Vec<(String, String)>>,
    fail_mutations: AtomicBool,
    fetch_calls: AtomicUsize,
}

impl FakeApi {
    pub fn with_entities(entries: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            entities: Mutex::new(
                entries
                    .iter()
                    .map(|(id, status)| (id.to_string(), status.to_string()))
                    .collect(),
            ),
            fail_mutations: AtomicBool::new(false),
            fetch_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_entity(&self, id: &str, status: &str) {
        let mut entities = self.entities.lock();
        if let Some(entry) = entities.iter_mut().find(|(eid, _)| eid == id) {
            entry.1 = status.to_string();
        } else {
            entities.push((id.to_string(), status.to_string()));
        }
    }

    pub fn remove_entity(&self, id: &str) {
        self.entities.lock().retain(|(eid, _)| eid != id);
    }

    pub fn fail_mutations(&self, fail: bool) {
        self.fail_mutations.store(fail, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EntityApi for FakeApi {
    async fn fetch_all(&self) -> Result<Vec<EntitySnapshot>, ApiError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .entities
            .lock()
            .iter()
            .map(|(id, status)| EntitySnapshot {
                id: id.clone(),
                status: status.clone(),
            })
            .collect())
    }

    async fn set_status(&self, _entity_id: &str, _status: &str) -> Result<(), ApiError> {
        if self.fail_mutations.load(Ordering::SeqCst) {
            return Err(ApiError::Rejected(500));
        }
        Ok(())
    }
}
