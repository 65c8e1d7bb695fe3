//! Push-connection lifecycle manager.
//!
//! One actor task per scope owns the websocket and drives the state
//! machine: `Disconnected -> Connecting -> Connected`, with `Reconnecting`
//! between failed dials and `FatallyFailed` once the retry ceiling is hit.
//! Consumers command it through [`ConnectionManager`] and observe state
//! through a `watch` channel; lifecycle errors are state, not panics.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};

use opswire_proto::{reserved, ClientFrame, RawEnvelope};

use crate::channel::{ChannelEvent, EventChannel};
use crate::config::{BackoffConfig, ScopeConfig};
use crate::events::{EventBus, EventEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    FatallyFailed,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Observable connection state plus retry bookkeeping for the UI.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Consecutive failed dials since the last successful connection.
    pub attempt: u32,
    pub last_error: Option<String>,
}

/// Reconnection delay schedule: `min(base * multiplier^attempt, cap)`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    cap: Duration,
}

impl Backoff {
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self {
            base: config.base_delay,
            multiplier: config.multiplier,
            cap: config.cap_delay,
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(millis.min(self.cap.as_millis() as f64) as u64)
    }
}

enum Command {
    Connect,
    Disconnect,
    Reconnect,
    SetToken(Option<String>),
    SubscribeConversation(String),
    WindowVisible,
}

/// Handle to the connection actor. Dropping it tears the actor down.
pub struct ConnectionManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    status_rx: watch::Receiver<ConnectionStatus>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn spawn(config: Arc<ScopeConfig>, bus: Arc<EventBus>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            attempt: 0,
            last_error: None,
        });
        let actor = ConnectionActor {
            backoff: Backoff::from_config(&config.backoff),
            token: config.token.clone(),
            config,
            bus,
            cmd_rx,
            status_tx,
            topics: Vec::new(),
            attempt: 0,
            wants_connection: false,
        };
        let task = tokio::spawn(actor.run());
        Self {
            cmd_tx,
            status_rx,
            task: Some(task),
        }
    }

    /// Open the push channel. A no-op while no auth token is available:
    /// the manager tolerates being constructed before authentication
    /// completes.
    pub fn connect(&self) {
        let _ = self.cmd_tx.send(Command::Connect);
    }

    /// Tear down intentionally: cancels heartbeat/backoff timers and closes
    /// the channel with a normal code. No retry follows.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }

    /// User-triggered recovery; the only way out of `FatallyFailed`. Resets
    /// the attempt counter.
    pub fn reconnect(&self) {
        let _ = self.cmd_tx.send(Command::Reconnect);
    }

    pub fn set_token(&self, token: Option<String>) {
        let _ = self.cmd_tx.send(Command::SetToken(token));
    }

    /// Scope the push feed to a conversation. Remembered and reissued
    /// after every successful reconnection.
    pub fn subscribe_conversation(&self, conversation_id: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(Command::SubscribeConversation(conversation_id.into()));
    }

    /// The hosting surface regained foreground visibility: skip the rest
    /// of any backoff delay and dial now.
    pub fn notify_visible(&self) {
        let _ = self.cmd_tx.send(Command::WindowVisible);
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.status_rx.borrow().state.is_connected()
    }

    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// What the actor does next. Each step owns its own timers, so leaving a
/// step cancels them by construction.
enum Step {
    Idle,
    Dial,
    Backoff(Duration),
    Fatal(String),
    Stop,
}

struct ConnectionActor {
    config: Arc<ScopeConfig>,
    backoff: Backoff,
    bus: Arc<EventBus>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    status_tx: watch::Sender<ConnectionStatus>,
    token: Option<String>,
    /// Conversation topics to reissue after reconnection, in subscription
    /// order.
    topics: Vec<String>,
    attempt: u32,
    /// A connect was requested and has not been intentionally ended.
    /// Gates visibility-driven redials.
    wants_connection: bool,
}

impl ConnectionActor {
    async fn run(mut self) {
        let mut step = Step::Idle;
        loop {
            step = match step {
                Step::Idle => self.idle().await,
                Step::Dial => self.dial().await,
                Step::Backoff(delay) => self.backoff_wait(delay).await,
                Step::Fatal(reason) => self.fatal(reason).await,
                Step::Stop => break,
            };
        }
    }

    async fn idle(&mut self) -> Step {
        loop {
            let Some(cmd) = self.cmd_rx.recv().await else {
                return Step::Stop;
            };
            match cmd {
                Command::Connect | Command::Reconnect => {
                    if self.token.is_none() {
                        tracing::debug!("connect requested before auth token is available");
                        continue;
                    }
                    self.wants_connection = true;
                    self.attempt = 0;
                    return Step::Dial;
                }
                Command::Disconnect => {
                    self.wants_connection = false;
                }
                Command::SetToken(token) => self.token = token,
                Command::SubscribeConversation(id) => {
                    self.remember_topic(id);
                }
                Command::WindowVisible => {
                    if self.wants_connection && self.token.is_some() {
                        self.attempt = 0;
                        return Step::Dial;
                    }
                }
            }
        }
    }

    async fn dial(&mut self) -> Step {
        let Some(token) = self.token.clone() else {
            self.publish(ConnectionState::Disconnected, None);
            return Step::Idle;
        };
        let url = match self.config.build_ws_url(&token) {
            Ok(url) => url,
            Err(err) => return Step::Fatal(format!("invalid push endpoint: {err}")),
        };

        self.publish_keep_error(ConnectionState::Connecting);
        tracing::debug!(attempt = self.attempt, "dialing push endpoint");

        match timeout(self.config.connect_timeout, EventChannel::connect(url.as_str())).await {
            Ok(Ok(channel)) => {
                self.attempt = 0;
                self.publish(ConnectionState::Connected, None);
                tracing::info!("push channel connected");
                self.online(channel).await
            }
            Ok(Err(err)) => self.schedule_retry(err.to_string()),
            Err(_) => self.schedule_retry(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout
            )),
        }
    }

    async fn online(&mut self, mut channel: EventChannel) -> Step {
        for topic in self.topics.clone() {
            let frame = ClientFrame::SubscribeConversation {
                conversation_id: topic,
            };
            if channel.send_json(&frame).is_err() {
                return self.lost(channel, "channel closed during resubscribe".to_string());
            }
        }

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately on creation; the first heartbeat
        // should wait a full period
        heartbeat.reset();
        let mut awaiting_pong = false;
        let mut missed_pongs: u8 = 0;

        loop {
            tokio::select! {
                event = channel.next() => match event {
                    Some(ChannelEvent::Frame(text)) => {
                        self.handle_frame(&text, &channel, &mut awaiting_pong, &mut missed_pongs);
                    }
                    Some(ChannelEvent::Closed { normal: true }) => {
                        tracing::info!("push channel closed by server");
                        self.wants_connection = false;
                        self.attempt = 0;
                        self.publish(ConnectionState::Disconnected, None);
                        return Step::Idle;
                    }
                    Some(ChannelEvent::Closed { normal: false }) | None => {
                        return self.lost(channel, "push channel closed unexpectedly".to_string());
                    }
                },
                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        missed_pongs += 1;
                    } else {
                        missed_pongs = 0;
                    }
                    if missed_pongs >= 2 {
                        return self.lost(channel, "heartbeat timed out twice".to_string());
                    }
                    if channel.send_json(&ClientFrame::Ping).is_err() {
                        return self.lost(channel, "failed to send heartbeat".to_string());
                    }
                    awaiting_pong = true;
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None => {
                        channel.close().await;
                        return Step::Stop;
                    }
                    Some(Command::Disconnect) => {
                        self.wants_connection = false;
                        self.attempt = 0;
                        channel.close().await;
                        self.publish(ConnectionState::Disconnected, None);
                        return Step::Idle;
                    }
                    Some(Command::Reconnect) => {
                        channel.close().await;
                        self.attempt = 0;
                        return Step::Dial;
                    }
                    Some(Command::Connect) | Some(Command::WindowVisible) => {}
                    Some(Command::SetToken(token)) => self.token = token,
                    Some(Command::SubscribeConversation(id)) => {
                        if self.remember_topic(id.clone()) {
                            let frame = ClientFrame::SubscribeConversation {
                                conversation_id: id,
                            };
                            let _ = channel.send_json(&frame);
                        }
                    }
                },
            }
        }
    }

    async fn backoff_wait(&mut self, delay: Duration) -> Step {
        let retry = sleep(delay);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                _ = &mut retry => return Step::Dial,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return Step::Stop,
                    Some(Command::Disconnect) => {
                        self.wants_connection = false;
                        self.attempt = 0;
                        self.publish(ConnectionState::Disconnected, None);
                        return Step::Idle;
                    }
                    Some(Command::Reconnect) | Some(Command::WindowVisible) => {
                        self.attempt = 0;
                        return Step::Dial;
                    }
                    Some(Command::Connect) => {}
                    Some(Command::SetToken(token)) => self.token = token,
                    Some(Command::SubscribeConversation(id)) => {
                        self.remember_topic(id);
                    }
                },
            }
        }
    }

    async fn fatal(&mut self, reason: String) -> Step {
        tracing::error!(error = %reason, "push connection failed permanently");
        self.publish(ConnectionState::FatallyFailed, Some(reason));
        loop {
            match self.cmd_rx.recv().await {
                None => return Step::Stop,
                Some(Command::Reconnect) => {
                    self.attempt = 0;
                    return Step::Dial;
                }
                Some(Command::Disconnect) => {
                    self.wants_connection = false;
                    self.attempt = 0;
                    self.publish(ConnectionState::Disconnected, None);
                    return Step::Idle;
                }
                Some(Command::SetToken(token)) => self.token = token,
                Some(Command::SubscribeConversation(id)) => {
                    self.remember_topic(id);
                }
                // only an explicit reconnect recovers a fatal failure
                Some(Command::Connect) | Some(Command::WindowVisible) => {}
            }
        }
    }

    fn lost(&mut self, channel: EventChannel, reason: String) -> Step {
        drop(channel);
        self.schedule_retry(reason)
    }

    fn schedule_retry(&mut self, reason: String) -> Step {
        self.attempt += 1;
        tracing::warn!(attempt = self.attempt, error = %reason, "push connection lost");
        if self.attempt > self.config.backoff.max_attempts {
            return Step::Fatal(format!(
                "giving up after {} attempts: {reason}",
                self.attempt - 1
            ));
        }
        let delay = self.backoff.delay(self.attempt - 1);
        self.publish(ConnectionState::Reconnecting, Some(reason));
        Step::Backoff(delay)
    }

    fn handle_frame(
        &self,
        text: &str,
        channel: &EventChannel,
        awaiting_pong: &mut bool,
        missed_pongs: &mut u8,
    ) {
        let raw: RawEnvelope = match serde_json::from_str(text) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "dropping malformed push frame");
                return;
            }
        };
        match raw.frame_type.as_str() {
            // liveness only; never forwarded to consumers
            reserved::PONG => {
                *awaiting_pong = false;
                *missed_pongs = 0;
            }
            reserved::PING => {
                let _ = channel.send_json(&ClientFrame::Pong);
            }
            reserved::CONNECTION_ESTABLISHED => {
                tracing::debug!("push endpoint acknowledged connection");
            }
            _ => {
                let envelope = EventEnvelope::from_wire(raw);
                self.bus.publish(&envelope);
            }
        }
    }

    fn remember_topic(&mut self, conversation_id: String) -> bool {
        if self.topics.iter().any(|t| t == &conversation_id) {
            return false;
        }
        self.topics.push(conversation_id);
        true
    }

    fn publish(&self, state: ConnectionState, error: Option<String>) {
        let attempt = self.attempt;
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.attempt = attempt;
            status.last_error = error;
        });
    }

    /// Transition state while preserving the last error, so the UI can
    /// keep showing why we are reconnecting.
    fn publish_keep_error(&self, state: ConnectionState) {
        let attempt = self.attempt;
        self.status_tx.send_modify(|status| {
            status.state = state;
            status.attempt = attempt;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScopeConfigBuilder;

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let backoff = Backoff::from_config(&BackoffConfig::default());
        let delays: Vec<Duration> = (0..12).map(|attempt| backoff.delay(attempt)).collect();

        assert_eq!(delays[0], Duration::from_millis(1000));
        assert_eq!(delays[1], Duration::from_millis(2000));
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(30_000)));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn connect_without_token_stays_disconnected() {
        let config = ScopeConfigBuilder::new()
            .server_url("127.0.0.1:1")
            .build()
            .unwrap();
        let bus = Arc::new(EventBus::new());
        let manager = ConnectionManager::spawn(Arc::new(config), bus);

        manager.connect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            manager.status().borrow().state,
            ConnectionState::Disconnected
        );

        manager.shutdown().await;
    }
}
