//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::codec::Codec;
use crate::token::{ConnectionTokenProvider, SubscriptionTokenProvider};
use crate::transport::TransportEndpoint;

/// Wire protocol selection. JSON ships with the crate; Protobuf requires
/// injecting a codec via [`ClientConfig::codec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Json,
    Protobuf,
}

/// Configuration for the client session.
#[derive(Clone)]
pub struct ClientConfig {
    /// Connection token presented in the connect command.
    pub token: String,
    /// Custom payload attached to the connect command.
    pub data: Option<Value>,
    /// Wire protocol.
    pub protocol: Protocol,
    /// Client name reported to the server.
    pub name: String,
    /// Client version reported to the server.
    pub version: String,
    /// Channels starting with this prefix require a subscription token.
    pub private_channel_prefix: String,
    /// Reconnect backoff floor.
    pub min_reconnect_delay: Duration,
    /// Reconnect backoff ceiling.
    pub max_reconnect_delay: Duration,
    /// Per-command reply timeout, also used for connect waiters.
    pub timeout: Duration,
    /// Client-driven ping period, used when the server does not announce
    /// its own ping interval. Zero disables client pings.
    pub ping_interval: Duration,
    /// How long to wait for any inbound frame after a client ping.
    pub pong_wait_timeout: Duration,
    /// Slack added on top of the announced server ping interval before the
    /// keepalive watchdog fires.
    pub max_server_ping_delay: Duration,
    /// Asynchronous source of connection tokens.
    pub get_connection_token: Option<Arc<dyn ConnectionTokenProvider>>,
    /// Asynchronous source of per-channel subscription tokens.
    pub get_subscription_token: Option<Arc<dyn SubscriptionTokenProvider>>,
    /// Ordered transport endpoints to negotiate across. Filled in by
    /// `Client::new` when empty.
    pub transports: Vec<TransportEndpoint>,
    /// Codec override; defaults to the JSON codec.
    pub codec: Option<Arc<dyn Codec>>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            data: None,
            protocol: Protocol::Json,
            name: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            private_channel_prefix: "$".to_string(),
            min_reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(20),
            timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(25),
            pong_wait_timeout: Duration::from_secs(10),
            max_server_ping_delay: Duration::from_secs(10),
            get_connection_token: None,
            get_subscription_token: None,
            transports: Vec::new(),
            codec: None,
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("protocol", &self.protocol)
            .field("name", &self.name)
            .field("version", &self.version)
            .field("private_channel_prefix", &self.private_channel_prefix)
            .field("min_reconnect_delay", &self.min_reconnect_delay)
            .field("max_reconnect_delay", &self.max_reconnect_delay)
            .field("timeout", &self.timeout)
            .field("ping_interval", &self.ping_interval)
            .field("pong_wait_timeout", &self.pong_wait_timeout)
            .field("max_server_ping_delay", &self.max_server_ping_delay)
            .field("has_connection_token_provider", &self.get_connection_token.is_some())
            .field("has_subscription_token_provider", &self.get_subscription_token.is_some())
            .field("transports", &self.transports.len())
            .finish()
    }
}

/// Per-subscription options.
#[derive(Clone)]
pub struct SubscriptionOptions {
    /// Subscription token; fetched from the provider when empty and the
    /// channel requires one.
    pub token: String,
    /// Custom payload attached to subscribe commands.
    pub data: Option<Value>,
    /// Fetch a fresh token on every connection instead of caching.
    pub token_unique_per_connection: bool,
    /// Resubscribe backoff floor after temporary subscribe errors.
    pub min_resubscribe_delay: Duration,
    /// Resubscribe backoff ceiling.
    pub max_resubscribe_delay: Duration,
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self {
            token: String::new(),
            data: None,
            token_unique_per_connection: false,
            min_resubscribe_delay: Duration::from_millis(500),
            max_resubscribe_delay: Duration::from_secs(20),
        }
    }
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for `history` calls.
#[derive(Debug, Clone, Default)]
pub struct HistoryOptions {
    /// Maximum number of publications to return; 0 means position info only.
    pub limit: i32,
    /// Return publications after this position.
    pub since: Option<crate::protocol::StreamPosition>,
    /// Iterate from the newest publication backwards.
    pub reverse: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.private_channel_prefix, "$");
        assert_eq!(cfg.min_reconnect_delay, Duration::from_millis(500));
        assert_eq!(cfg.max_reconnect_delay, Duration::from_secs(20));
        assert_eq!(cfg.timeout, Duration::from_secs(5));
        assert_eq!(cfg.ping_interval, Duration::from_secs(25));
        assert_eq!(cfg.protocol, Protocol::Json);
        assert!(cfg.get_connection_token.is_none());
        assert!(cfg.transports.is_empty());
    }

    #[test]
    fn test_subscription_options_defaults() {
        let opts = SubscriptionOptions::new();
        assert!(opts.token.is_empty());
        assert!(!opts.token_unique_per_connection);
        assert_eq!(opts.min_resubscribe_delay, Duration::from_millis(500));
    }
}
