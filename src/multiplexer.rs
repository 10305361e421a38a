//! Command multiplexer — ID allocation and the in-flight table.
//!
//! Every command expecting a reply gets a strictly increasing id and an
//! in-flight record with a deadline. Records leave the table exactly once:
//! on reply, on timeout, or when the session drains the table on
//! disconnect. Registration is decoupled from sending so the connect
//! command of an emulation transport can be registered before the
//! transport ever opens.

use std::collections::BTreeMap;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::ClientError;
use crate::protocol::{
    HistoryResult, PresenceResult, PresenceStatsResult, PublishResult, Reply, RpcResult,
};

pub type ResultTx<T> = oneshot::Sender<Result<T, ClientError>>;

/// Who is waiting for a reply.
///
/// User responders carry the caller's oneshot; internal responders are
/// handled by the session state machine itself.
pub enum Responder {
    Connect,
    Subscribe { channel: String },
    Refresh,
    SubRefresh { channel: String },
    Publish(ResultTx<PublishResult>),
    Rpc(ResultTx<RpcResult>),
    History(ResultTx<HistoryResult>),
    Presence(ResultTx<PresenceResult>),
    PresenceStats(ResultTx<PresenceStatsResult>),
}

/// Internal responders the session must react to after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InternalKind {
    Connect,
    Subscribe(String),
    Refresh,
    SubRefresh(String),
}

impl Responder {
    /// Reject the waiter. User responders consume the error; internal
    /// responders hand it back so the state machine can react.
    pub fn fail(self, err: ClientError) -> Option<InternalKind> {
        match self {
            Responder::Connect => Some(InternalKind::Connect),
            Responder::Subscribe { channel } => Some(InternalKind::Subscribe(channel)),
            Responder::Refresh => Some(InternalKind::Refresh),
            Responder::SubRefresh { channel } => Some(InternalKind::SubRefresh(channel)),
            Responder::Publish(tx) => {
                let _ = tx.send(Err(err));
                None
            }
            Responder::Rpc(tx) => {
                let _ = tx.send(Err(err));
                None
            }
            Responder::History(tx) => {
                let _ = tx.send(Err(err));
                None
            }
            Responder::Presence(tx) => {
                let _ = tx.send(Err(err));
                None
            }
            Responder::PresenceStats(tx) => {
                let _ = tx.send(Err(err));
                None
            }
        }
    }

    /// Resolve a user responder from a decoded reply, extracting the
    /// matching result member. Internal responders are returned unchanged
    /// for the session to process.
    pub fn resolve(self, reply: &Reply) -> Option<InternalKind> {
        match self {
            Responder::Publish(tx) => {
                let _ = tx.send(Ok(reply.publish.clone().unwrap_or_default()));
                None
            }
            Responder::Rpc(tx) => {
                let _ = tx.send(Ok(reply.rpc.clone().unwrap_or_default()));
                None
            }
            Responder::History(tx) => {
                let _ = tx.send(Ok(reply.history.clone().unwrap_or_default()));
                None
            }
            Responder::Presence(tx) => {
                let _ = tx.send(Ok(reply.presence.clone().unwrap_or_default()));
                None
            }
            Responder::PresenceStats(tx) => {
                let _ = tx.send(Ok(reply.presence_stats.clone().unwrap_or_default()));
                None
            }
            Responder::Connect => Some(InternalKind::Connect),
            Responder::Subscribe { channel } => Some(InternalKind::Subscribe(channel)),
            Responder::Refresh => Some(InternalKind::Refresh),
            Responder::SubRefresh { channel } => Some(InternalKind::SubRefresh(channel)),
        }
    }
}

struct InFlight {
    responder: Responder,
    deadline: Instant,
}

/// The in-flight table. Owned by the session task, touched only from it.
pub struct Multiplexer {
    next_id: u32,
    inflight: BTreeMap<u32, InFlight>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self { next_id: 0, inflight: BTreeMap::new() }
    }

    /// Allocate the next command id. Ids are strictly increasing within a
    /// session and never reused after a reply or timeout.
    pub fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    /// Register a waiter for `id`. Registration does not send anything —
    /// the caller writes the frame (or, for emulation connects, lets the
    /// transport deliver the reply out-of-band).
    pub fn register(&mut self, id: u32, responder: Responder, deadline: Instant) {
        self.inflight.insert(id, InFlight { responder, deadline });
    }

    /// Take the waiter for a reply id.
    pub fn take(&mut self, id: u32) -> Option<Responder> {
        self.inflight.remove(&id).map(|r| r.responder)
    }

    /// Remove and return every record whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<(u32, Responder)> {
        let due: Vec<u32> = self
            .inflight
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        due.into_iter()
            .filter_map(|id| self.inflight.remove(&id).map(|r| (id, r.responder)))
            .collect()
    }

    /// Earliest deadline across all in-flight records.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inflight.values().map(|r| r.deadline).min()
    }

    /// Empty the table, returning every record. Used when the session
    /// leaves `Connected` so each waiter is rejected exactly once.
    pub fn drain(&mut self) -> Vec<(u32, Responder)> {
        std::mem::take(&mut self.inflight)
            .into_iter()
            .map(|(id, r)| (id, r.responder))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ids_strictly_increasing() {
        let mut mux = Multiplexer::new();
        let mut prev = 0;
        for _ in 0..100 {
            let id = mux.next_id();
            assert!(id > prev);
            prev = id;
        }
    }

    #[tokio::test]
    async fn test_register_take_roundtrip() {
        let mut mux = Multiplexer::new();
        let (tx, mut rx) = oneshot::channel();
        let id = mux.next_id();
        mux.register(id, Responder::Publish(tx), Instant::now() + Duration::from_secs(5));
        assert_eq!(mux.len(), 1);

        let responder = mux.take(id).unwrap();
        let reply = Reply { id, publish: Some(PublishResult {}), ..Default::default() };
        assert!(responder.resolve(&reply).is_none());
        assert!(mux.is_empty());
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_take_unknown_id_is_none() {
        let mut mux = Multiplexer::new();
        assert!(mux.take(42).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_removes_only_due_records() {
        let mut mux = Multiplexer::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        let id1 = mux.next_id();
        let id2 = mux.next_id();
        let now = Instant::now();
        mux.register(id1, Responder::Rpc(tx1), now + Duration::from_secs(1));
        mux.register(id2, Responder::Rpc(tx2), now + Duration::from_secs(10));

        assert_eq!(mux.next_deadline(), Some(now + Duration::from_secs(1)));

        let expired = mux.expire(now + Duration::from_secs(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, id1);
        for (_, responder) in expired {
            assert!(responder.fail(ClientError::Timeout).is_none());
        }
        assert_eq!(rx1.try_recv().unwrap(), Err(ClientError::Timeout));
        assert!(rx2.try_recv().is_err()); // still pending
        assert_eq!(mux.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_rejects_each_waiter_exactly_once() {
        let mut mux = Multiplexer::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        let deadline = Instant::now() + Duration::from_secs(5);
        let id1 = mux.next_id();
        mux.register(id1, Responder::Publish(tx1), deadline);
        let id2 = mux.next_id();
        mux.register(id2, Responder::History(tx2), deadline);

        let drained = mux.drain();
        assert_eq!(drained.len(), 2);
        assert!(mux.is_empty());
        for (_, responder) in drained {
            responder.fail(ClientError::Disconnected);
        }
        assert_eq!(rx1.try_recv().unwrap(), Err(ClientError::Disconnected));
        assert_eq!(rx2.try_recv().unwrap(), Err(ClientError::Disconnected));
    }

    #[test]
    fn test_internal_responder_fail_reports_kind() {
        let kind = Responder::Subscribe { channel: "news".into() }
            .fail(ClientError::Disconnected)
            .unwrap();
        assert_eq!(kind, InternalKind::Subscribe("news".into()));
        assert_eq!(Responder::Connect.fail(ClientError::Timeout), Some(InternalKind::Connect));
    }

    #[test]
    fn test_ids_not_reused_after_take() {
        let mut mux = Multiplexer::new();
        let id1 = mux.next_id();
        mux.register(id1, Responder::Connect, Instant::now() + Duration::from_secs(1));
        mux.take(id1);
        let id2 = mux.next_id();
        assert!(id2 > id1);
    }
}
