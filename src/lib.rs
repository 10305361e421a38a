//! # Centrifuge client
//!
//! A Rust client for Centrifugo / Centrifuge real-time messaging servers.
//!
//! ## Architecture
//!
//! The client is organized in layers:
//!
//! 1. **Protocol** — wire envelope types and the frame codec
//! 2. **Transport** — the connection capability; WebSocket ships behind the
//!    `ws-native` feature, others are injected
//! 3. **Session engine** — a background tokio task owning the connection
//!    state machine, command multiplexing, keepalive and recovery
//! 4. **High-Level Client** — `Client` and per-channel `Subscription`
//!    handles with event streams
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use centrifuge_client::prelude::*;
//!
//! let client = Client::new("wss://example.com/connection/websocket", ClientConfig {
//!     token: "<jwt>".into(),
//!     ..Default::default()
//! });
//! client.connect()?;
//!
//! let sub = client.new_subscription("news", SubscriptionOptions::new())?;
//! sub.subscribe()?;
//! ```

// ── Protocol layer ───────────────────────────────────────────────────────────

/// Wire envelope types: commands, replies, pushes.
pub mod protocol;

/// Frame codec traits and the JSON codec.
pub mod codec;

/// Unified client error types.
pub mod error;

// ── Transport layer ──────────────────────────────────────────────────────────

/// Transport capability and built-in transports.
pub mod transport;

// ── Session engine ───────────────────────────────────────────────────────────

/// Reconnect backoff and timer helpers.
pub mod backoff;

/// Command-ID allocation and the in-flight table.
mod multiplexer;

/// The background session task.
mod session;

// ── High-level client ────────────────────────────────────────────────────────

/// Client configuration.
pub mod config;

/// Token sources.
pub mod token;

/// `Client` — the primary entry point.
pub mod client;

/// Channel subscriptions.
pub mod subscription;

// ── Prelude ──────────────────────────────────────────────────────────────────

pub mod prelude {
    pub use crate::client::{Client, ClientEvent, ClientState};
    pub use crate::codec::{Codec, CommandEncoder, Frame, JsonCodec, ReplyDecoder};
    pub use crate::config::{ClientConfig, HistoryOptions, Protocol, SubscriptionOptions};
    pub use crate::error::{ClientError, CloseReason, ServerError};
    pub use crate::protocol::{ClientInfo, Publication, StreamPosition};
    pub use crate::subscription::{Subscription, SubscriptionEvent, SubscriptionState};
    pub use crate::token::{ConnectionTokenProvider, SubscriptionTokenProvider};
    #[cfg(feature = "http")]
    pub use crate::token::TokenEndpoint;
    pub use crate::transport::{Transport, TransportEndpoint, TransportEvent};
}
