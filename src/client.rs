//! High-level client — the primary entry point.
//!
//! `Client` is a cheap cloneable handle over the background session task
//! (see `session.rs`). Calls that need a reply are async and resolve when
//! the session delivers the correlated reply; lifecycle methods are plain
//! sends into the instruction channel.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use futures_util::stream::Stream;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{ClientConfig, HistoryOptions, SubscriptionOptions};
use crate::error::{ClientError, CloseReason};
use crate::protocol::{
    ClientInfo, HistoryResult, PresenceResult, PresenceStatsResult, Publication, PublishResult,
    RpcResult, StreamPosition,
};
use crate::session::{Instruction, Session};
use crate::subscription::{SubEntry, Subscription};

/// Connection lifecycle states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    /// Terminal; a closed client never reconnects.
    Closed = 3,
}

impl From<u8> for ClientState {
    fn from(value: u8) -> Self {
        match value {
            1 => ClientState::Connecting,
            2 => ClientState::Connected,
            3 => ClientState::Closed,
            _ => ClientState::Disconnected,
        }
    }
}

/// Events emitted on the client.
///
/// `Subscribed`, `Unsubscribed`, `Publication`, `Join` and `Leave` here
/// concern server-side subscriptions; client-side subscriptions emit on
/// their own [`Subscription`] handles.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    State { state: ClientState, prev_state: ClientState },
    Connected { client: String, transport: String, data: Option<Value> },
    Disconnected { code: u32, reason: String, reconnect: bool },
    Closed { reason: CloseReason },
    /// An async message pushed outside any channel.
    Message { data: Value },
    Subscribed {
        channel: String,
        recovered: bool,
        position: Option<StreamPosition>,
        data: Option<Value>,
    },
    Unsubscribed { channel: String },
    Publication { channel: String, publication: Publication },
    Join { channel: String, info: ClientInfo },
    Leave { channel: String, info: ClientInfo },
}

/// Client for a Centrifuge server.
///
/// Construction spawns the session task immediately, but nothing touches
/// the network until [`Client::connect`]. Must be created inside a tokio
/// runtime.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    cmd_tx: mpsc::UnboundedSender<Instruction>,
    state: Arc<AtomicU8>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ClientEvent>>,
    subs: Arc<StdMutex<HashMap<String, Subscription>>>,
    task: JoinHandle<()>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl Client {
    /// Create a client for `endpoint`. When the config carries no explicit
    /// transport list the built-in WebSocket transport is used.
    #[allow(unused_mut)]
    pub fn new(endpoint: &str, mut config: ClientConfig) -> Self {
        #[cfg(feature = "ws-native")]
        if config.transports.is_empty() {
            config
                .transports
                .push(crate::transport::TransportEndpoint::websocket(endpoint));
        }
        #[cfg(not(feature = "ws-native"))]
        let _ = endpoint;

        let state = Arc::new(AtomicU8::new(ClientState::Disconnected as u8));
        let subs = Arc::new(StdMutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let session = Session::new(
            config,
            state.clone(),
            cmd_tx.clone(),
            cmd_rx,
            event_tx,
            subs.clone(),
        );
        let task = tokio::spawn(session.run());

        Self {
            inner: Arc::new(ClientInner {
                cmd_tx,
                state,
                event_rx: tokio::sync::Mutex::new(event_rx),
                subs,
                task,
            }),
        }
    }

    pub fn state(&self) -> ClientState {
        ClientState::from(self.inner.state.load(Ordering::SeqCst))
    }

    /// Start connecting. A no-op while connecting or connected.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.send_instruction(Instruction::Connect)
    }

    /// Go to `Disconnected` and stay there until the next `connect()`.
    /// A no-op while disconnected, apart from clearing a pending
    /// reconnect timer.
    pub fn disconnect(&self) -> Result<(), ClientError> {
        self.send_instruction(Instruction::Disconnect)
    }

    /// Close the client for good. Terminal and idempotent.
    pub fn close(&self) -> Result<(), ClientError> {
        self.send_instruction(Instruction::Close)
    }

    /// Send an async message to the server (no reply).
    pub async fn send(&self, data: Value) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_instruction(Instruction::Send { data, tx })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Call a server-side RPC method.
    pub async fn rpc(&self, method: &str, data: Value) -> Result<RpcResult, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_instruction(Instruction::Rpc { method: method.to_string(), data, tx })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Publish data into a channel.
    pub async fn publish(&self, channel: &str, data: Value) -> Result<PublishResult, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_instruction(Instruction::Publish { channel: channel.to_string(), data, tx })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Fetch publication history for a channel.
    pub async fn history(
        &self,
        channel: &str,
        options: HistoryOptions,
    ) -> Result<HistoryResult, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_instruction(Instruction::History {
            channel: channel.to_string(),
            options,
            tx,
        })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Fetch presence information for a channel.
    pub async fn presence(&self, channel: &str) -> Result<PresenceResult, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_instruction(Instruction::Presence { channel: channel.to_string(), tx })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Fetch presence counters for a channel.
    pub async fn presence_stats(
        &self,
        channel: &str,
    ) -> Result<PresenceStatsResult, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.send_instruction(Instruction::PresenceStats { channel: channel.to_string(), tx })?;
        rx.await.map_err(|_| ClientError::Shutdown)?
    }

    /// Start collecting commands instead of writing them.
    pub fn start_batching(&self) -> Result<(), ClientError> {
        self.send_instruction(Instruction::StartBatching)
    }

    /// Flush collected commands as a single frame.
    pub fn stop_batching(&self) -> Result<(), ClientError> {
        self.send_instruction(Instruction::StopBatching)
    }

    /// Create and register a subscription. At most one subscription per
    /// channel may exist.
    pub fn new_subscription(
        &self,
        channel: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription, ClientError> {
        let mut map = self.inner.subs.lock().unwrap();
        if map.contains_key(channel) {
            return Err(ClientError::DuplicateSubscription(channel.to_string()));
        }
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let entry = SubEntry::new(options, event_tx);
        let subscription = Subscription::new(
            channel.to_string(),
            self.inner.cmd_tx.clone(),
            entry.state.clone(),
            event_rx,
        );
        map.insert(channel.to_string(), subscription.clone());
        drop(map);

        if self
            .send_instruction(Instruction::Register {
                channel: channel.to_string(),
                entry: Box::new(entry),
            })
            .is_err()
        {
            self.inner.subs.lock().unwrap().remove(channel);
            return Err(ClientError::Shutdown);
        }
        Ok(subscription)
    }

    /// Look up a registered subscription by channel.
    pub fn get_subscription(&self, channel: &str) -> Option<Subscription> {
        self.inner.subs.lock().unwrap().get(channel).cloned()
    }

    /// Stream of client events in emission order.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = ClientEvent> + Send + '_>> {
        Box::pin(futures_util::stream::unfold(&self.inner.event_rx, |rx| async move {
            let mut guard = rx.lock().await;
            guard.recv().await.map(|event| (event, rx))
        }))
    }

    fn send_instruction(&self, instruction: Instruction) -> Result<(), ClientError> {
        self.inner.cmd_tx.send(instruction).map_err(|_| ClientError::Shutdown)
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> Client {
        let config = ClientConfig::default();
        Client::new("ws://localhost:1/connection", config)
    }

    #[tokio::test]
    async fn test_initial_state_is_disconnected() {
        let client = test_client();
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let client = test_client();
        let _sub = client.new_subscription("news", SubscriptionOptions::new()).unwrap();
        let err = client.new_subscription("news", SubscriptionOptions::new()).unwrap_err();
        assert_eq!(err, ClientError::DuplicateSubscription("news".into()));
    }

    #[tokio::test]
    async fn test_get_subscription_round_trip() {
        let client = test_client();
        assert!(client.get_subscription("news").is_none());
        let sub = client.new_subscription("news", SubscriptionOptions::new()).unwrap();
        let looked_up = client.get_subscription("news").unwrap();
        assert_eq!(looked_up.channel(), sub.channel());
    }

    #[tokio::test]
    async fn test_client_state_from_u8() {
        assert_eq!(ClientState::from(0), ClientState::Disconnected);
        assert_eq!(ClientState::from(1), ClientState::Connecting);
        assert_eq!(ClientState::from(2), ClientState::Connected);
        assert_eq!(ClientState::from(3), ClientState::Closed);
    }
}
