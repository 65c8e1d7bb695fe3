use std::time::Duration;

use url::Url;

/// Which slice of the push feed a scope observes. The server exposes one
/// endpoint per account plus a firehose for the all-accounts dashboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushScope {
    Account(String),
    AllAccounts,
}

impl PushScope {
    fn path(&self) -> String {
        match self {
            PushScope::Account(account_id) => format!("push/accounts/{account_id}"),
            PushScope::AllAccounts => "push/firehose".to_string(),
        }
    }
}

/// Reconnection backoff parameters: `delay = min(base * multiplier^attempt, cap)`.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub cap_delay: Duration,
    /// Consecutive failed dials tolerated before the connection is
    /// declared fatally failed.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            cap_delay: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

/// Refresh coordinator windows.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Normal-priority requests arriving within this window collapse into
    /// one refetch.
    pub coalesce_window: Duration,
    /// No two refetches ever execute closer together than this.
    pub min_spacing: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            coalesce_window: Duration::from_secs(1),
            min_spacing: Duration::from_secs(3),
        }
    }
}

/// Configuration for one realtime scope.
#[derive(Debug, Clone)]
pub struct ScopeConfig {
    /// Push server base URL. A bare `host:port` is accepted; the scheme is
    /// inferred (`ws://` for loopback, `wss://` otherwise).
    pub server_url: String,
    /// Opaque auth token. `connect` is a no-op while this is absent.
    pub token: Option<String>,
    pub scope: PushScope,
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffConfig,
    pub refresh: RefreshConfig,
    /// Age past which a confirmed-but-disagreeing override is flagged as
    /// stale. Diagnostic only; the override is never expired by time.
    pub override_stale_after: Option<Duration>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("server URL is required")]
    MissingServerUrl,
    #[error("invalid push endpoint URL: {0}")]
    InvalidUrl(String),
}

impl ScopeConfig {
    /// Build the dial URL for this scope, appending the auth token as a
    /// query pair: `scheme://host/push/...?token=<opaque>`.
    pub fn build_ws_url(&self, token: &str) -> Result<Url, ConfigError> {
        let mut base = self.server_url.clone();
        if !base.starts_with("ws://") && !base.starts_with("wss://") {
            let plaintext = base.contains("localhost") || base.contains("127.0.0.1");
            base = if plaintext {
                format!("ws://{base}")
            } else {
                format!("wss://{base}")
            };
        }

        let mut url = Url::parse(&base).map_err(|err| ConfigError::InvalidUrl(err.to_string()))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| ConfigError::InvalidUrl("URL cannot be a base".to_string()))?;
            segments.pop_if_empty();
            for segment in self.scope.path().split('/') {
                segments.push(segment);
            }
        }
        url.query_pairs_mut().append_pair("token", token);
        Ok(url)
    }
}

/// Builder for [`ScopeConfig`].
pub struct ScopeConfigBuilder {
    server_url: Option<String>,
    token: Option<String>,
    scope: PushScope,
    connect_timeout: Duration,
    heartbeat_interval: Duration,
    backoff: BackoffConfig,
    refresh: RefreshConfig,
    override_stale_after: Option<Duration>,
}

impl ScopeConfigBuilder {
    pub fn new() -> Self {
        Self {
            server_url: None,
            token: None,
            scope: PushScope::AllAccounts,
            connect_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            backoff: BackoffConfig::default(),
            refresh: RefreshConfig::default(),
            override_stale_after: Some(Duration::from_secs(120)),
        }
    }

    pub fn server_url(mut self, url: impl Into<String>) -> Self {
        self.server_url = Some(url.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn scope(mut self, scope: PushScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn refresh(mut self, refresh: RefreshConfig) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn override_stale_after(mut self, threshold: Option<Duration>) -> Self {
        self.override_stale_after = threshold;
        self
    }

    pub fn build(self) -> Result<ScopeConfig, ConfigError> {
        let server_url = self.server_url.ok_or(ConfigError::MissingServerUrl)?;
        Ok(ScopeConfig {
            server_url,
            token: self.token,
            scope: self.scope,
            connect_timeout: self.connect_timeout,
            heartbeat_interval: self.heartbeat_interval,
            backoff: self.backoff,
            refresh: self.refresh,
            override_stale_after: self.override_stale_after,
        })
    }
}

impl Default for ScopeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
