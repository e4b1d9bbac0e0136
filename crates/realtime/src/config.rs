//! Relay configuration.

use crate::audio::AudioSink;
use crate::dispatch::LatencyCallback;
use secrecy::SecretString;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Options for a [`crate::RelayClient`].
#[derive(Clone)]
pub struct RelayConfig {
    /// WebSocket endpoint, `ws://` or `wss://`.
    pub endpoint: String,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Sent as a bearer token on the upgrade request.
    pub auth_token: Option<SecretString>,
    pub audio_sink: Option<Arc<dyn AudioSink>>,
    pub on_latency: Option<LatencyCallback>,
}

impl RelayConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint
            .into()
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        Self {
            endpoint,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            auth_token: None,
            audio_sink: None,
            on_latency: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(SecretString::from(token.into()));
        self
    }

    pub fn with_audio_sink(mut self, sink: Arc<dyn AudioSink>) -> Self {
        self.audio_sink = Some(sink);
        self
    }

    pub fn with_latency_callback(mut self, callback: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.on_latency = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayConfig")
            .field("endpoint", &self.endpoint)
            .field("connect_timeout", &self.connect_timeout)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("audio_sink", &self.audio_sink.is_some())
            .field("on_latency", &self.on_latency.is_some())
            .finish()
    }
}
