//! Client-side subscriptions — public handle and per-channel bookkeeping.
//!
//! A [`Subscription`] is a cheap cloneable handle. The state machine itself
//! lives in the session task, which owns one [`SubEntry`] per channel; the
//! handle shares the state atom and receives events over a channel.

use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use futures_util::stream::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::backoff::Backoff;
use crate::config::SubscriptionOptions;
use crate::error::ClientError;
use crate::protocol::{ClientInfo, Publication, StreamPosition};
use crate::session::Instruction;

/// Subscription lifecycle states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Unsubscribed = 0,
    Subscribing = 1,
    Subscribed = 2,
}

impl From<u8> for SubscriptionState {
    fn from(value: u8) -> Self {
        match value {
            1 => SubscriptionState::Subscribing,
            2 => SubscriptionState::Subscribed,
            _ => SubscriptionState::Unsubscribed,
        }
    }
}

/// Events emitted on a subscription.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// The subscribe handshake completed.
    Subscribed {
        recovered: bool,
        position: Option<StreamPosition>,
        data: Option<Value>,
    },
    /// Subscribe or sub-refresh trouble; a permanent error also moves the
    /// subscription to `Unsubscribed`.
    Error(ClientError),
    Unsubscribed,
    Publication(Publication),
    Join(ClientInfo),
    Leave(ClientInfo),
}

/// Handle to a channel subscription.
///
/// Obtained from `Client::new_subscription`; persists across reconnects
/// until closed or the client is closed.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionShared>,
}

struct SubscriptionShared {
    channel: String,
    cmd_tx: mpsc::UnboundedSender<Instruction>,
    state: Arc<AtomicU8>,
    event_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<SubscriptionEvent>>,
}

impl Subscription {
    pub(crate) fn new(
        channel: String,
        cmd_tx: mpsc::UnboundedSender<Instruction>,
        state: Arc<AtomicU8>,
        event_rx: mpsc::UnboundedReceiver<SubscriptionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(SubscriptionShared {
                channel,
                cmd_tx,
                state,
                event_rx: tokio::sync::Mutex::new(event_rx),
            }),
        }
    }

    pub fn channel(&self) -> &str {
        &self.inner.channel
    }

    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from(self.inner.state.load(Ordering::SeqCst))
    }

    /// Start subscribing. A no-op when already subscribed or subscribing.
    pub fn subscribe(&self) -> Result<(), ClientError> {
        self.send(Instruction::Subscribe { channel: self.inner.channel.clone() })
    }

    /// Leave the channel. A no-op when already unsubscribed.
    pub fn unsubscribe(&self) -> Result<(), ClientError> {
        self.send(Instruction::Unsubscribe { channel: self.inner.channel.clone() })
    }

    /// Unsubscribe and remove this subscription from the client registry.
    pub fn close(&self) -> Result<(), ClientError> {
        self.send(Instruction::CloseSubscription { channel: self.inner.channel.clone() })
    }

    /// Stream of subscription events.
    ///
    /// The stream borrows the handle; events arrive in the order the
    /// session emitted them.
    pub fn events(&self) -> Pin<Box<dyn Stream<Item = SubscriptionEvent> + Send + '_>> {
        Box::pin(futures_util::stream::unfold(&self.inner.event_rx, |rx| async move {
            let mut guard = rx.lock().await;
            guard.recv().await.map(|event| (event, rx))
        }))
    }

    fn send(&self, instruction: Instruction) -> Result<(), ClientError> {
        self.inner.cmd_tx.send(instruction).map_err(|_| ClientError::Shutdown)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.inner.channel)
            .field("state", &self.state())
            .finish()
    }
}

// ─── Session-side entry ──────────────────────────────────────────────────────

/// Per-channel record owned by the session task.
pub(crate) struct SubEntry {
    pub options: SubscriptionOptions,
    pub state: Arc<AtomicU8>,
    pub event_tx: mpsc::UnboundedSender<SubscriptionEvent>,
    /// Cached subscription token.
    pub token: String,
    /// Include `{recover, offset, epoch}` in the next subscribe request.
    pub recover: bool,
    /// Last known stream position for this channel.
    pub position: Option<StreamPosition>,
    /// When to issue the next sub-refresh.
    pub refresh_at: Option<Instant>,
    /// When to retry a subscribe that failed with a temporary error.
    pub resubscribe_at: Option<Instant>,
    pub resubscribe_backoff: Backoff,
    /// A token fetch is in flight; its completion re-drives subscribe.
    pub fetching_token: bool,
}

impl SubEntry {
    pub fn new(options: SubscriptionOptions, event_tx: mpsc::UnboundedSender<SubscriptionEvent>) -> Self {
        let backoff = Backoff::new(options.min_resubscribe_delay, options.max_resubscribe_delay);
        let token = options.token.clone();
        Self {
            options,
            state: Arc::new(AtomicU8::new(SubscriptionState::Unsubscribed as u8)),
            event_tx,
            token,
            recover: false,
            position: None,
            refresh_at: None,
            resubscribe_at: None,
            resubscribe_backoff: backoff,
            fetching_token: false,
        }
    }

    pub fn state(&self) -> SubscriptionState {
        SubscriptionState::from(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: SubscriptionState) -> SubscriptionState {
        SubscriptionState::from(self.state.swap(state as u8, Ordering::SeqCst))
    }

    pub fn emit(&self, event: SubscriptionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Record a publication's position before the event goes out.
    pub fn track_publication(&mut self, publication: &Publication) {
        if publication.offset > 0 {
            let epoch = self.position.as_ref().map(|p| p.epoch.clone()).unwrap_or_default();
            self.position = Some(StreamPosition { offset: publication.offset, epoch });
        }
    }

    /// Clear timers when the session leaves `Connected`.
    pub fn cancel_timers(&mut self) {
        self.refresh_at = None;
        self.resubscribe_at = None;
        self.fetching_token = false;
    }
}

/// Whether a channel requires a subscription token.
pub(crate) fn is_private_channel(channel: &str, prefix: &str) -> bool {
    !prefix.is_empty() && channel.starts_with(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_u8() {
        assert_eq!(SubscriptionState::from(0), SubscriptionState::Unsubscribed);
        assert_eq!(SubscriptionState::from(1), SubscriptionState::Subscribing);
        assert_eq!(SubscriptionState::from(2), SubscriptionState::Subscribed);
        assert_eq!(SubscriptionState::from(99), SubscriptionState::Unsubscribed);
    }

    #[test]
    fn test_private_channel_prefix() {
        assert!(is_private_channel("$chat", "$"));
        assert!(!is_private_channel("chat", "$"));
        assert!(!is_private_channel("chat", ""));
    }

    #[test]
    fn test_entry_tracks_publication_offsets() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut entry = SubEntry::new(SubscriptionOptions::new(), tx);
        entry.position = Some(StreamPosition { offset: 10, epoch: "e".into() });

        let publication = Publication { offset: 11, ..Default::default() };
        entry.track_publication(&publication);
        let pos = entry.position.as_ref().unwrap();
        assert_eq!(pos.offset, 11);
        assert_eq!(pos.epoch, "e");

        // Publications without an offset leave the position alone.
        entry.track_publication(&Publication::default());
        assert_eq!(entry.position.as_ref().unwrap().offset, 11);
    }

    #[test]
    fn test_entry_state_swap_reports_previous() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let entry = SubEntry::new(SubscriptionOptions::new(), tx);
        let prev = entry.set_state(SubscriptionState::Subscribing);
        assert_eq!(prev, SubscriptionState::Unsubscribed);
        assert_eq!(entry.state(), SubscriptionState::Subscribing);
    }
}
