//! Session engine — the background task owning all client state.
//!
//! One tokio task owns the connection state machine, the in-flight command
//! table, the subscription registry and every timer. The public API talks
//! to it over an instruction channel; transports report I/O through an
//! event channel. Each instruction, transport event or timer fire is
//! handled to completion before the next one, so inbound replies and
//! pushes reach the application in wire order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::backoff::{clamp_timer, jittered, Backoff};
use crate::client::{ClientEvent, ClientState};
use crate::codec::{Codec, Frame, JsonCodec};
use crate::config::{ClientConfig, HistoryOptions, Protocol};
use crate::error::{ClientError, CloseReason, ServerError};
use crate::multiplexer::{InternalKind, Multiplexer, Responder, ResultTx};
use crate::protocol::{
    self, Command, ConnectRequest, ConnectResult, ErrorObject, HistoryRequest, HistoryResult,
    PresenceRequest, PresenceResult, PresenceStatsRequest, PresenceStatsResult, PublishRequest,
    PublishResult, Push, RefreshRequest, RefreshResult, Reply, RpcRequest, RpcResult, SendRequest,
    StreamPosition, SubRefreshRequest, SubRefreshResult, SubscribeRequest, SubscribeResult,
    UnsubscribeRequest,
};
use crate::subscription::{
    is_private_channel, SubEntry, Subscription, SubscriptionEvent, SubscriptionState,
};
use crate::transport::{Transport, TransportEvent};

/// Local disconnect code for a user-initiated disconnect.
const DISCONNECT_CLIENT: u32 = 0;
/// Local disconnect code for an undecodable inbound frame.
const DISCONNECT_BAD_PROTOCOL: u32 = 2;
/// Local disconnect code when the transport dies without a close event.
const DISCONNECT_TRANSPORT_CLOSED: u32 = 4;

/// Base and spread of the token-refresh retry delay.
const REFRESH_RETRY_BASE: Duration = Duration::from_secs(5);
const REFRESH_RETRY_SPREAD: Duration = Duration::from_secs(5);

/// Instructions from the public API (and from spawned token fetches) to
/// the session task.
pub(crate) enum Instruction {
    Connect,
    Disconnect,
    Close,
    Publish { channel: String, data: Value, tx: ResultTx<PublishResult> },
    Rpc { method: String, data: Value, tx: ResultTx<RpcResult> },
    History { channel: String, options: HistoryOptions, tx: ResultTx<HistoryResult> },
    Presence { channel: String, tx: ResultTx<PresenceResult> },
    PresenceStats { channel: String, tx: ResultTx<PresenceStatsResult> },
    Send { data: Value, tx: ResultTx<()> },
    StartBatching,
    StopBatching,
    Register { channel: String, entry: Box<SubEntry> },
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    CloseSubscription { channel: String },
    /// A spawned connection-token fetch finished.
    ConnectTokenReady { seq: u64, result: Result<String, ClientError> },
    /// A spawned refresh-token fetch finished.
    RefreshTokenReady { client: String, result: Result<String, ClientError> },
    /// A spawned subscription-token fetch finished.
    SubTokenReady { channel: String, client: String, result: Result<String, ClientError> },
}

/// A user command parked until the session reaches `Connected`.
struct Waiter {
    deadline: Instant,
    instruction: Instruction,
}

/// Per-channel record for a subscription managed by the server.
struct ServerSub {
    offset: u64,
    epoch: String,
    recoverable: bool,
}

pub(crate) struct Session {
    cfg: ClientConfig,
    codec: Arc<dyn Codec>,
    state: Arc<AtomicU8>,
    cmd_tx: mpsc::UnboundedSender<Instruction>,
    cmd_rx: mpsc::UnboundedReceiver<Instruction>,
    events: mpsc::UnboundedSender<ClientEvent>,
    handles: Arc<StdMutex<HashMap<String, Subscription>>>,

    mux: Multiplexer,
    subs: HashMap<String, SubEntry>,
    server_subs: HashMap<String, ServerSub>,
    waiters: Vec<Waiter>,
    batch: Option<Vec<Command>>,

    transport: Option<Box<dyn Transport>>,
    transport_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    transport_name: &'static str,
    transport_open: bool,
    /// Any transport ever opened during this engine's lifetime. While
    /// false the engine is still probing endpoints: close-before-open
    /// advances the endpoint index and retries with zero delay.
    ever_opened: bool,
    endpoint_index: usize,
    pending_connect: Option<Command>,

    reconnect_backoff: Backoff,
    reconnect_at: Option<Instant>,
    connect_seq: u64,
    connect_token_fetching: bool,
    refresh_required: bool,
    refresh_at: Option<Instant>,
    refresh_fetching: bool,

    client_id: String,
    session_id: String,
    node: String,

    server_ping: Option<Duration>,
    server_pong: bool,
    ping_watchdog_at: Option<Instant>,
    client_ping_at: Option<Instant>,
    pong_deadline: Option<Instant>,

    last_disconnect_code: Option<u32>,
    close_reason: Option<CloseReason>,
}

impl Session {
    pub(crate) fn new(
        cfg: ClientConfig,
        state: Arc<AtomicU8>,
        cmd_tx: mpsc::UnboundedSender<Instruction>,
        cmd_rx: mpsc::UnboundedReceiver<Instruction>,
        events: mpsc::UnboundedSender<ClientEvent>,
        handles: Arc<StdMutex<HashMap<String, Subscription>>>,
    ) -> Self {
        let codec: Arc<dyn Codec> =
            cfg.codec.clone().unwrap_or_else(|| Arc::new(JsonCodec) as Arc<dyn Codec>);
        let reconnect_backoff = Backoff::new(cfg.min_reconnect_delay, cfg.max_reconnect_delay);
        Self {
            cfg,
            codec,
            state,
            cmd_tx,
            cmd_rx,
            events,
            handles,
            mux: Multiplexer::new(),
            subs: HashMap::new(),
            server_subs: HashMap::new(),
            waiters: Vec::new(),
            batch: None,
            transport: None,
            transport_rx: None,
            transport_name: "none",
            transport_open: false,
            ever_opened: false,
            endpoint_index: 0,
            pending_connect: None,
            reconnect_backoff,
            reconnect_at: None,
            connect_seq: 0,
            connect_token_fetching: false,
            refresh_required: false,
            refresh_at: None,
            refresh_fetching: false,
            client_id: String::new(),
            session_id: String::new(),
            node: String::new(),
            server_ping: None,
            server_pong: false,
            ping_watchdog_at: None,
            client_ping_at: None,
            pong_deadline: None,
            last_disconnect_code: None,
            close_reason: None,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                event = recv_transport(&mut self.transport_rx) => {
                    match event {
                        Some(event) => self.handle_transport_event(event),
                        None => self.handle_transport_channel_gone(),
                    }
                }
                instruction = self.cmd_rx.recv() => {
                    match instruction {
                        Some(instruction) => self.handle_instruction(instruction),
                        // Client dropped.
                        None => break,
                    }
                }
                _ = tokio::time::sleep_until(
                    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))
                ), if deadline.is_some() => {
                    self.handle_timers();
                }
            }
        }
        self.teardown_transport();
    }

    // ── State ────────────────────────────────────────────────────────────

    fn state(&self) -> ClientState {
        ClientState::from(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&mut self, new: ClientState) {
        let current = self.state();
        if current == new || current == ClientState::Closed {
            return;
        }
        self.state.store(new as u8, Ordering::SeqCst);
        self.emit(ClientEvent::State { state: new, prev_state: current });
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn emit_disconnect(&mut self, code: u32, reason: &str, reconnect: bool) {
        if self.last_disconnect_code == Some(code) {
            return;
        }
        self.last_disconnect_code = Some(code);
        self.emit(ClientEvent::Disconnected { code, reason: reason.to_string(), reconnect });
    }

    // ── Deadlines ────────────────────────────────────────────────────────

    fn next_deadline(&self) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        let mut consider = |d: Option<Instant>| {
            if let Some(d) = d {
                next = Some(match next {
                    Some(n) => n.min(d),
                    None => d,
                });
            }
        };
        consider(self.reconnect_at);
        consider(self.refresh_at);
        consider(self.ping_watchdog_at);
        consider(self.client_ping_at);
        consider(self.pong_deadline);
        consider(self.mux.next_deadline());
        consider(self.waiters.iter().map(|w| w.deadline).min());
        for entry in self.subs.values() {
            consider(entry.refresh_at);
            consider(entry.resubscribe_at);
        }
        next
    }

    fn handle_timers(&mut self) {
        let now = Instant::now();

        // In-flight command timeouts.
        for (id, responder) in self.mux.expire(now) {
            tracing::debug!(id, "in-flight command timed out");
            if let Some(kind) = responder.fail(ClientError::Timeout) {
                self.on_internal_failure(kind, ClientError::Timeout);
            }
        }

        // Gated commands that never saw `Connected`.
        let mut parked = std::mem::take(&mut self.waiters);
        parked.retain_mut(|w| {
            if w.deadline <= now {
                let instruction = std::mem::replace(&mut w.instruction, Instruction::Connect);
                fail_instruction(instruction, ClientError::Timeout);
                false
            } else {
                true
            }
        });
        self.waiters = parked;

        if self.reconnect_at.is_some_and(|d| d <= now) {
            self.reconnect_at = None;
            if self.state() == ClientState::Connecting {
                self.connect_cycle();
            }
        }

        if self.refresh_at.is_some_and(|d| d <= now) {
            self.refresh_at = None;
            self.start_refresh();
        }

        if self.ping_watchdog_at.is_some_and(|d| d <= now) {
            self.ping_watchdog_at = None;
            tracing::info!("no server ping in time, reconnecting");
            self.lose_connection(protocol::DISCONNECT_NO_PING, "no ping");
            return;
        }

        if self.client_ping_at.is_some_and(|d| d <= now) {
            self.client_ping_at = None;
            if self.state() == ClientState::Connected {
                if let Err(e) = self.write_commands(&[Command::pong()]) {
                    tracing::warn!(error = %e, "failed to send ping");
                }
                self.pong_deadline = Some(now + self.cfg.pong_wait_timeout);
            }
        }

        if self.pong_deadline.is_some_and(|d| d <= now) {
            self.pong_deadline = None;
            tracing::info!("no pong in time, reconnecting");
            self.lose_connection(protocol::DISCONNECT_NO_PING, "no ping");
            return;
        }

        // Subscription timers.
        let due_refresh: Vec<String> = self
            .subs
            .iter()
            .filter(|(_, e)| e.refresh_at.is_some_and(|d| d <= now))
            .map(|(c, _)| c.clone())
            .collect();
        for channel in due_refresh {
            if let Some(entry) = self.subs.get_mut(&channel) {
                entry.refresh_at = None;
            }
            self.start_sub_token_fetch(&channel);
        }

        let due_resub: Vec<String> = self
            .subs
            .iter()
            .filter(|(_, e)| e.resubscribe_at.is_some_and(|d| d <= now))
            .map(|(c, _)| c.clone())
            .collect();
        for channel in due_resub {
            if let Some(entry) = self.subs.get_mut(&channel) {
                entry.resubscribe_at = None;
            }
            if self.state() == ClientState::Connected {
                self.issue_subscribe(&channel);
            }
        }
    }

    // ── Instructions ─────────────────────────────────────────────────────

    fn handle_instruction(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::Connect => self.start_connect(),
            Instruction::Disconnect => self.perform_disconnect(),
            Instruction::Close => self.perform_close(CloseReason::Client, None),
            Instruction::StartBatching => {
                if self.batch.is_none() {
                    self.batch = Some(Vec::new());
                }
            }
            Instruction::StopBatching => self.flush_batch(),
            Instruction::Register { channel, entry } => {
                self.subs.insert(channel, *entry);
            }
            Instruction::Subscribe { channel } => self.subscribe_channel(&channel),
            Instruction::Unsubscribe { channel } => self.unsubscribe_channel(&channel),
            Instruction::CloseSubscription { channel } => {
                self.unsubscribe_channel(&channel);
                self.subs.remove(&channel);
                if let Ok(mut handles) = self.handles.lock() {
                    handles.remove(&channel);
                }
            }
            Instruction::ConnectTokenReady { seq, result } => self.on_connect_token(seq, result),
            Instruction::RefreshTokenReady { client, result } => {
                self.on_refresh_token(&client, result)
            }
            Instruction::SubTokenReady { channel, client, result } => {
                self.on_sub_token(&channel, &client, result)
            }
            gated => self.gate_or_issue(gated),
        }
    }

    /// Commands requiring connectivity either go out now or park on a
    /// single-shot waiter resolved at the next `Connected`.
    fn gate_or_issue(&mut self, instruction: Instruction) {
        match self.state() {
            ClientState::Connected => self.issue_user_command(instruction),
            ClientState::Closed => {
                let reason = self.close_reason.unwrap_or(CloseReason::Client);
                fail_instruction(instruction, ClientError::Closed(reason));
            }
            _ => {
                self.waiters
                    .push(Waiter { deadline: Instant::now() + self.cfg.timeout, instruction });
            }
        }
    }

    fn issue_user_command(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::Publish { channel, data, tx } => {
                self.submit(Responder::Publish(tx), |id| Command {
                    id,
                    publish: Some(PublishRequest { channel, data }),
                    ..Default::default()
                });
            }
            Instruction::Rpc { method, data, tx } => {
                self.submit(Responder::Rpc(tx), |id| Command {
                    id,
                    rpc: Some(RpcRequest { method, data }),
                    ..Default::default()
                });
            }
            Instruction::History { channel, options, tx } => {
                self.submit(Responder::History(tx), |id| Command {
                    id,
                    history: Some(HistoryRequest {
                        channel,
                        limit: options.limit,
                        since: options.since,
                        reverse: options.reverse,
                    }),
                    ..Default::default()
                });
            }
            Instruction::Presence { channel, tx } => {
                self.submit(Responder::Presence(tx), |id| Command {
                    id,
                    presence: Some(PresenceRequest { channel }),
                    ..Default::default()
                });
            }
            Instruction::PresenceStats { channel, tx } => {
                self.submit(Responder::PresenceStats(tx), |id| Command {
                    id,
                    presence_stats: Some(PresenceStatsRequest { channel }),
                    ..Default::default()
                });
            }
            Instruction::Send { data, tx } => {
                // Fire-and-forget: no id, no record, best effort.
                let cmd =
                    Command { send: Some(SendRequest { data }), ..Default::default() };
                let _ = tx.send(self.enqueue_command(cmd));
            }
            _ => {}
        }
    }

    /// Register an in-flight record and write (or batch) the command.
    fn submit(&mut self, responder: Responder, make: impl FnOnce(u32) -> Command) {
        let id = self.mux.next_id();
        let cmd = make(id);
        self.mux.register(id, responder, Instant::now() + self.cfg.timeout);
        if let Err(err) = self.enqueue_command(cmd) {
            if let Some(responder) = self.mux.take(id) {
                if let Some(kind) = responder.fail(err.clone()) {
                    self.on_internal_failure(kind, err);
                }
            }
        }
    }

    // ── Writing ──────────────────────────────────────────────────────────

    fn write_commands(&mut self, commands: &[Command]) -> Result<(), ClientError> {
        let frame = self.codec.encode(commands)?;
        match self.transport.as_mut() {
            Some(transport) => transport.send(frame, &self.session_id, &self.node),
            None => Err(ClientError::TransportWrite("no transport".into())),
        }
    }

    fn enqueue_command(&mut self, cmd: Command) -> Result<(), ClientError> {
        if let Some(batch) = &mut self.batch {
            batch.push(cmd);
            Ok(())
        } else {
            self.write_commands(std::slice::from_ref(&cmd))
        }
    }

    fn flush_batch(&mut self) {
        if let Some(commands) = self.batch.take() {
            if commands.is_empty() {
                return;
            }
            if let Err(e) = self.write_commands(&commands) {
                tracing::warn!(error = %e, count = commands.len(), "batch flush failed");
            }
        }
    }

    // ── Connect lifecycle ────────────────────────────────────────────────

    fn start_connect(&mut self) {
        if self.state() != ClientState::Disconnected {
            return;
        }
        self.set_state(ClientState::Connecting);
        self.connect_cycle();
    }

    /// One connect attempt: acquire a token if needed, then dial the next
    /// transport endpoint.
    fn connect_cycle(&mut self) {
        self.connect_seq += 1;

        if self.cfg.protocol == Protocol::Protobuf && self.cfg.codec.is_none() {
            tracing::warn!("protobuf protocol selected but no codec injected");
            self.perform_close(CloseReason::ConnectFailed, None);
            return;
        }

        let needs_token = self.refresh_required
            || (self.cfg.token.is_empty() && self.cfg.get_connection_token.is_some());
        if needs_token {
            match self.cfg.get_connection_token.clone() {
                Some(provider) => {
                    if self.connect_token_fetching {
                        return;
                    }
                    self.connect_token_fetching = true;
                    let seq = self.connect_seq;
                    let tx = self.cmd_tx.clone();
                    tokio::spawn(async move {
                        let result = provider.connection_token().await;
                        let _ = tx.send(Instruction::ConnectTokenReady { seq, result });
                    });
                    return;
                }
                None => {
                    // Token expired and there is no way to renew it.
                    self.perform_close(CloseReason::Unauthorized, None);
                    return;
                }
            }
        }

        self.init_transport();
    }

    fn on_connect_token(&mut self, seq: u64, result: Result<String, ClientError>) {
        self.connect_token_fetching = false;
        if self.state() != ClientState::Connecting || seq != self.connect_seq {
            return;
        }
        match result {
            Ok(token) if token.is_empty() => {
                self.perform_close(CloseReason::Unauthorized, None);
            }
            Ok(token) => {
                self.cfg.token = token;
                self.refresh_required = false;
                self.init_transport();
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection token fetch failed, retrying");
                self.reconnect_at = Some(Instant::now() + self.reconnect_backoff.next_delay());
            }
        }
    }

    fn init_transport(&mut self) {
        let total = self.cfg.transports.len();
        if total == 0 {
            tracing::warn!("no transport endpoints configured");
            self.perform_close(CloseReason::ConnectFailed, None);
            return;
        }

        let mut transport = None;
        for _ in 0..total {
            let endpoint = &self.cfg.transports[self.endpoint_index % total];
            let candidate = endpoint.build();
            if candidate.supported() {
                transport = Some(candidate);
                break;
            }
            tracing::debug!(endpoint = %endpoint.endpoint, "transport unsupported, skipping");
            self.endpoint_index += 1;
        }
        let mut transport = match transport {
            Some(t) => t,
            None => {
                self.perform_close(CloseReason::ConnectFailed, None);
                return;
            }
        };

        let (sink, rx) = mpsc::unbounded_channel();
        self.transport_rx = Some(rx);
        self.transport_open = false;
        self.transport_name = transport.name();

        let (id, cmd) = self.build_connect_command();
        // Register before the transport opens: emulation transports deliver
        // the connect reply out-of-band.
        self.mux.register(id, Responder::Connect, Instant::now() + self.cfg.timeout);

        let init = if transport.emulation() {
            match self.codec.encode(std::slice::from_ref(&cmd)) {
                Ok(frame) => {
                    self.pending_connect = None;
                    transport.initialize(self.cfg.protocol, sink, Some(frame))
                }
                Err(e) => Err(e),
            }
        } else {
            self.pending_connect = Some(cmd);
            transport.initialize(self.cfg.protocol, sink, None)
        };

        match init {
            Ok(()) => {
                tracing::debug!(transport = self.transport_name, "transport initializing");
                self.transport = Some(transport);
            }
            Err(e) => {
                tracing::warn!(error = %e, "transport initialize failed");
                self.mux.take(id);
                self.transport_rx = None;
                self.pending_connect = None;
                self.endpoint_index += 1;
                self.schedule_reconnect(!self.ever_opened);
            }
        }
    }

    fn build_connect_command(&mut self) -> (u32, Command) {
        let mut subs = HashMap::new();
        for (channel, server_sub) in &self.server_subs {
            if server_sub.recoverable {
                subs.insert(
                    channel.clone(),
                    SubscribeRequest {
                        recover: true,
                        offset: server_sub.offset,
                        epoch: server_sub.epoch.clone(),
                        ..Default::default()
                    },
                );
            }
        }
        let request = ConnectRequest {
            token: self.cfg.token.clone(),
            data: self.cfg.data.clone(),
            name: self.cfg.name.clone(),
            version: self.cfg.version.clone(),
            subs,
        };
        let id = self.mux.next_id();
        (id, Command { id, connect: Some(request), ..Default::default() })
    }

    fn schedule_reconnect(&mut self, immediate: bool) {
        let delay =
            if immediate { Duration::ZERO } else { self.reconnect_backoff.next_delay() };
        tracing::debug!(?delay, "reconnect scheduled");
        self.reconnect_at = Some(Instant::now() + delay);
    }

    // ── Transport events ─────────────────────────────────────────────────

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Open => {
                self.transport_open = true;
                self.ever_opened = true;
                tracing::debug!(transport = self.transport_name, "transport open");
                if let Some(cmd) = self.pending_connect.take() {
                    if let Err(e) = self.write_commands(std::slice::from_ref(&cmd)) {
                        tracing::warn!(error = %e, "failed to write connect command");
                    }
                }
            }
            TransportEvent::Message(frame) => self.on_frame(frame),
            TransportEvent::Error(message) => {
                tracing::debug!(%message, "transport error");
            }
            TransportEvent::Closed { code, reason } => self.on_transport_closed(code, &reason),
        }
    }

    fn handle_transport_channel_gone(&mut self) {
        self.transport_rx = None;
        self.on_transport_closed(DISCONNECT_TRANSPORT_CLOSED, "transport closed");
    }

    fn on_transport_closed(&mut self, code: u32, reason: &str) {
        let was_open = self.transport_open;
        match self.state() {
            ClientState::Connected => {
                if protocol::disconnect_code_reconnects(code) {
                    self.lose_connection(code, reason);
                } else {
                    self.perform_close(CloseReason::Server, Some((code, reason.to_string())));
                }
            }
            ClientState::Connecting => {
                self.teardown_transport();
                for (_, responder) in self.mux.drain() {
                    responder.fail(ClientError::Disconnected);
                }
                if !was_open {
                    // Handshake probing: try the next endpoint, silently.
                    self.endpoint_index += 1;
                    self.schedule_reconnect(!self.ever_opened);
                } else if protocol::disconnect_code_reconnects(code) {
                    self.schedule_reconnect(false);
                } else {
                    self.perform_close(CloseReason::Server, Some((code, reason.to_string())));
                }
            }
            _ => {}
        }
    }

    /// Leave `Connected` and schedule a reconnect.
    fn lose_connection(&mut self, code: u32, reason: &str) {
        if self.state() != ClientState::Connected {
            return;
        }
        if code == protocol::ERROR_TOKEN_EXPIRED {
            self.refresh_required = true;
        }
        self.teardown_transport();
        self.leave_connected();
        self.set_state(ClientState::Connecting);
        self.emit_disconnect(code, reason, true);
        self.schedule_reconnect(false);
    }

    /// Cleanup shared by every transition out of `Connected`: reject every
    /// in-flight command exactly once, clear keepalive and refresh timers,
    /// demote subscribed channels back to `Subscribing`.
    fn leave_connected(&mut self) {
        for (_, responder) in self.mux.drain() {
            // Internal waiters are re-driven by the next connect.
            responder.fail(ClientError::Disconnected);
        }
        self.batch = None;
        self.refresh_at = None;
        self.refresh_fetching = false;
        self.server_ping = None;
        self.server_pong = false;
        self.ping_watchdog_at = None;
        self.client_ping_at = None;
        self.pong_deadline = None;
        for entry in self.subs.values_mut() {
            entry.cancel_timers();
            if entry.state() == SubscriptionState::Subscribed {
                entry.set_state(SubscriptionState::Subscribing);
                entry.recover = entry.position.is_some();
            }
        }
    }

    fn teardown_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.transport_rx = None;
        self.transport_open = false;
        self.pending_connect = None;
    }

    fn perform_disconnect(&mut self) {
        match self.state() {
            ClientState::Disconnected => {
                // Still clears a pending reconnect timer.
                self.reconnect_at = None;
            }
            ClientState::Connecting => {
                self.reconnect_at = None;
                self.teardown_transport();
                for (_, responder) in self.mux.drain() {
                    responder.fail(ClientError::Disconnected);
                }
                self.set_state(ClientState::Disconnected);
            }
            ClientState::Connected => {
                self.teardown_transport();
                self.leave_connected();
                self.set_state(ClientState::Disconnected);
                self.emit_disconnect(DISCONNECT_CLIENT, "client", false);
            }
            ClientState::Closed => {}
        }
    }

    fn perform_close(&mut self, reason: CloseReason, disconnect: Option<(u32, String)>) {
        if self.state() == ClientState::Closed {
            return;
        }
        let was_connected = self.state() == ClientState::Connected;
        self.reconnect_at = None;
        self.teardown_transport();

        for (_, responder) in self.mux.drain() {
            responder.fail(ClientError::Disconnected);
        }
        for waiter in std::mem::take(&mut self.waiters) {
            fail_instruction(waiter.instruction, ClientError::Closed(reason));
        }

        self.refresh_at = None;
        self.refresh_fetching = false;
        self.ping_watchdog_at = None;
        self.client_ping_at = None;
        self.pong_deadline = None;

        if was_connected {
            let (code, text) =
                disconnect.unwrap_or((DISCONNECT_CLIENT, reason.as_str().to_string()));
            self.emit_disconnect(code, &text, false);
        }

        // Client subscriptions do not survive a close.
        for entry in self.subs.values_mut() {
            entry.cancel_timers();
            let prev = entry.set_state(SubscriptionState::Unsubscribed);
            if prev != SubscriptionState::Unsubscribed {
                entry.emit(SubscriptionEvent::Unsubscribed);
            }
        }
        self.subs.clear();
        if let Ok(mut handles) = self.handles.lock() {
            handles.clear();
        }

        if !reason.preserves_positions() {
            self.server_subs.clear();
        }

        self.close_reason = Some(reason);
        tracing::info!(reason = %reason, "client closed");
        self.set_state(ClientState::Closed);
        self.emit(ClientEvent::Closed { reason });
    }

    // ── Inbound dispatch ─────────────────────────────────────────────────

    fn on_frame(&mut self, frame: Frame) {
        // Any inbound frame proves the connection is alive.
        let now = Instant::now();
        if let Some(interval) = self.server_ping {
            self.ping_watchdog_at = Some(now + interval + self.cfg.max_server_ping_delay);
        } else if self.state() == ClientState::Connected
            && !self.cfg.ping_interval.is_zero()
        {
            self.pong_deadline = None;
            self.client_ping_at = Some(now + self.cfg.ping_interval);
        }

        let replies = match self.codec.decode(&frame) {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode inbound frame");
                if self.state() == ClientState::Connected {
                    self.lose_connection(DISCONNECT_BAD_PROTOCOL, "decode error");
                }
                return;
            }
        };

        // Replies and pushes dispatch strictly in decoded order.
        for reply in replies {
            self.dispatch_reply(reply);
        }
    }

    fn dispatch_reply(&mut self, reply: Reply) {
        if reply.id != 0 {
            let responder = match self.mux.take(reply.id) {
                Some(responder) => responder,
                None => {
                    tracing::debug!(id = reply.id, "reply for unknown command id");
                    return;
                }
            };
            if let Some(err) = reply.error.clone() {
                let server_err = ServerError {
                    code: err.code,
                    message: err.message.clone(),
                    temporary: err.temporary,
                };
                if let Some(kind) = responder.fail(ClientError::Server(server_err)) {
                    self.on_internal_error(kind, err);
                }
            } else if let Some(kind) = responder.resolve(&reply) {
                match kind {
                    InternalKind::Connect => {
                        self.on_connect_reply(reply.connect.unwrap_or_default())
                    }
                    InternalKind::Subscribe(channel) => {
                        self.on_subscribe_reply(&channel, reply.subscribe.unwrap_or_default())
                    }
                    InternalKind::Refresh => {
                        self.on_refresh_reply(reply.refresh.unwrap_or_default())
                    }
                    InternalKind::SubRefresh(channel) => {
                        self.on_sub_refresh_reply(&channel, reply.sub_refresh.unwrap_or_default())
                    }
                }
            }
            return;
        }

        if let Some(push) = reply.push {
            self.dispatch_push(push);
            return;
        }

        // Empty reply: server ping.
        if self.server_pong {
            if let Err(e) = self.write_commands(&[Command::pong()]) {
                tracing::debug!(error = %e, "failed to answer server ping");
            }
        }
    }

    fn dispatch_push(&mut self, push: Push) {
        let channel = push.channel.clone();
        if let Some(publication) = push.publication {
            if let Some(entry) = self.subs.get_mut(&channel) {
                if entry.state() == SubscriptionState::Subscribed {
                    entry.track_publication(&publication);
                    entry.emit(SubscriptionEvent::Publication(publication));
                }
            } else if self.server_subs.contains_key(&channel) {
                if publication.offset > 0 {
                    if let Some(server_sub) = self.server_subs.get_mut(&channel) {
                        server_sub.offset = publication.offset;
                    }
                }
                self.emit(ClientEvent::Publication { channel, publication });
            }
        } else if let Some(join) = push.join {
            if let Some(entry) = self.subs.get(&channel) {
                entry.emit(SubscriptionEvent::Join(join.info));
            } else if self.server_subs.contains_key(&channel) {
                self.emit(ClientEvent::Join { channel, info: join.info });
            }
        } else if let Some(leave) = push.leave {
            if let Some(entry) = self.subs.get(&channel) {
                entry.emit(SubscriptionEvent::Leave(leave.info));
            } else if self.server_subs.contains_key(&channel) {
                self.emit(ClientEvent::Leave { channel, info: leave.info });
            }
        } else if let Some(unsubscribe) = push.unsubscribe {
            tracing::debug!(%channel, code = unsubscribe.code, "server unsubscribe");
            if let Some(entry) = self.subs.get_mut(&channel) {
                entry.cancel_timers();
                entry.recover = false;
                let prev = entry.set_state(SubscriptionState::Unsubscribed);
                if prev != SubscriptionState::Unsubscribed {
                    entry.emit(SubscriptionEvent::Unsubscribed);
                }
            } else if self.server_subs.remove(&channel).is_some() {
                self.emit(ClientEvent::Unsubscribed { channel });
            }
        } else if let Some(message) = push.message {
            self.emit(ClientEvent::Message { data: message.data });
        } else if let Some(subscribe) = push.subscribe {
            let position = (subscribe.positioned || subscribe.recoverable).then(|| {
                StreamPosition { offset: subscribe.offset, epoch: subscribe.epoch.clone() }
            });
            self.server_subs.insert(
                channel.clone(),
                ServerSub {
                    offset: subscribe.offset,
                    epoch: subscribe.epoch,
                    recoverable: subscribe.recoverable,
                },
            );
            self.emit(ClientEvent::Subscribed {
                channel,
                recovered: false,
                position,
                data: subscribe.data,
            });
        } else if let Some(disconnect) = push.disconnect {
            let code = disconnect.code;
            let reason = disconnect.reason;
            tracing::info!(code, %reason, "server disconnect");
            if protocol::disconnect_code_reconnects(code) {
                self.lose_connection(code, &reason);
            } else {
                self.perform_close(CloseReason::Server, Some((code, reason)));
            }
        }
    }

    // ── Connect replies ──────────────────────────────────────────────────

    fn on_connect_reply(&mut self, result: ConnectResult) {
        if self.state() != ClientState::Connecting {
            return;
        }
        self.client_id = result.client.clone();
        self.session_id = result.session.clone();
        self.node = result.node.clone();
        self.reconnect_backoff.reset();
        self.last_disconnect_code = None;
        self.refresh_required = false;

        tracing::info!(client = %self.client_id, transport = self.transport_name, "connected");
        self.set_state(ClientState::Connected);

        // Bulk resubscription flushes as a single frame.
        let resubscribe: Vec<String> = self
            .subs
            .iter()
            .filter(|(_, e)| e.state() == SubscriptionState::Subscribing)
            .map(|(c, _)| c.clone())
            .collect();
        if !resubscribe.is_empty() {
            let nested = self.batch.is_some();
            if !nested {
                self.batch = Some(Vec::new());
            }
            for channel in resubscribe {
                self.issue_subscribe(&channel);
            }
            if !nested {
                self.flush_batch();
            }
        }

        self.emit(ClientEvent::Connected {
            client: result.client.clone(),
            transport: self.transport_name.to_string(),
            data: result.data.clone(),
        });

        // Release gated commands.
        for waiter in std::mem::take(&mut self.waiters) {
            self.handle_instruction(waiter.instruction);
        }

        // Keepalive: prefer the server-announced ping.
        let now = Instant::now();
        if result.ping > 0 {
            let interval = Duration::from_secs(result.ping as u64);
            self.server_ping = Some(interval);
            self.server_pong = result.pong;
            self.ping_watchdog_at = Some(now + interval + self.cfg.max_server_ping_delay);
        } else if !self.cfg.ping_interval.is_zero() {
            self.client_ping_at = Some(now + self.cfg.ping_interval);
        }

        if result.expires && self.cfg.get_connection_token.is_some() {
            self.refresh_at =
                Some(now + clamp_timer(Duration::from_secs(result.ttl as u64)));
        }

        self.apply_server_subs(result.subs);
    }

    fn apply_server_subs(&mut self, announced: HashMap<String, SubscribeResult>) {
        let removed: Vec<String> = self
            .server_subs
            .keys()
            .filter(|channel| !announced.contains_key(*channel))
            .cloned()
            .collect();
        for channel in removed {
            self.server_subs.remove(&channel);
            self.emit(ClientEvent::Unsubscribed { channel });
        }

        for (channel, sub) in announced {
            let position = (sub.positioned || sub.recoverable)
                .then(|| StreamPosition { offset: sub.offset, epoch: sub.epoch.clone() });
            self.emit(ClientEvent::Subscribed {
                channel: channel.clone(),
                recovered: sub.recovered,
                position,
                data: sub.data.clone(),
            });
            let mut offset = sub.offset;
            for publication in sub.publications {
                if publication.offset > 0 {
                    offset = publication.offset;
                }
                self.emit(ClientEvent::Publication {
                    channel: channel.clone(),
                    publication,
                });
            }
            self.server_subs.insert(
                channel,
                ServerSub { offset, epoch: sub.epoch, recoverable: sub.recoverable },
            );
        }
    }

    fn on_connect_error(&mut self, err: ErrorObject) {
        if self.state() != ClientState::Connecting {
            return;
        }
        if err.code == protocol::ERROR_UNRECOVERABLE_POSITION {
            self.perform_close(CloseReason::UnrecoverablePosition, None);
            return;
        }
        if protocol::connect_error_retries(&err) {
            if err.code == protocol::ERROR_TOKEN_EXPIRED {
                self.refresh_required = true;
            }
            tracing::info!(code = err.code, message = %err.message, "connect failed, retrying");
            self.teardown_transport();
            self.schedule_reconnect(false);
        } else {
            tracing::warn!(code = err.code, message = %err.message, "connect failed permanently");
            self.perform_close(CloseReason::ConnectFailed, None);
        }
    }

    // ── Internal failure routing ─────────────────────────────────────────

    /// Reply-level server errors for internally-tracked commands.
    fn on_internal_error(&mut self, kind: InternalKind, err: ErrorObject) {
        match kind {
            InternalKind::Connect => self.on_connect_error(err),
            InternalKind::Subscribe(channel) => self.on_subscribe_error(&channel, err),
            InternalKind::Refresh => self.on_refresh_error(err),
            InternalKind::SubRefresh(channel) => self.on_sub_refresh_error(&channel, err),
        }
    }

    /// Local failures (timeout, transport write) for internally-tracked
    /// commands.
    fn on_internal_failure(&mut self, kind: InternalKind, err: ClientError) {
        match kind {
            InternalKind::Connect => {
                if self.state() == ClientState::Connecting {
                    tracing::info!(error = %err, "connect attempt failed, retrying");
                    self.teardown_transport();
                    self.schedule_reconnect(false);
                }
            }
            InternalKind::Subscribe(channel) => {
                self.on_subscribe_failure(&channel, err, true);
            }
            InternalKind::Refresh => {
                if self.state() == ClientState::Connected {
                    self.refresh_at =
                        Some(Instant::now() + jittered(REFRESH_RETRY_BASE, REFRESH_RETRY_SPREAD));
                }
            }
            InternalKind::SubRefresh(channel) => {
                if let Some(entry) = self.subs.get_mut(&channel) {
                    entry.refresh_at =
                        Some(Instant::now() + jittered(REFRESH_RETRY_BASE, REFRESH_RETRY_SPREAD));
                }
            }
        }
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    fn subscribe_channel(&mut self, channel: &str) {
        let entry = match self.subs.get_mut(channel) {
            Some(entry) => entry,
            None => return,
        };
        if entry.state() != SubscriptionState::Unsubscribed {
            return;
        }
        entry.set_state(SubscriptionState::Subscribing);
        if self.state() == ClientState::Connected {
            self.issue_subscribe(channel);
        }
    }

    fn issue_subscribe(&mut self, channel: &str) {
        let prefix = self.cfg.private_channel_prefix.clone();
        let has_provider = self.cfg.get_subscription_token.is_some();

        let (token, data, recover_fields, already_fetching) = {
            let entry = match self.subs.get_mut(channel) {
                Some(entry) if entry.state() == SubscriptionState::Subscribing => entry,
                _ => return,
            };
            let recover_fields = if entry.recover {
                entry.position.clone()
            } else {
                None
            };
            (entry.token.clone(), entry.options.data.clone(), recover_fields, entry.fetching_token)
        };
        if already_fetching {
            return;
        }

        if is_private_channel(channel, &prefix) && token.is_empty() {
            if has_provider {
                self.start_sub_token_fetch(channel);
            } else {
                self.fail_subscription(
                    channel,
                    ClientError::Token("subscription token required".into()),
                );
            }
            return;
        }

        let mut request = SubscribeRequest {
            channel: channel.to_string(),
            token,
            data,
            ..Default::default()
        };
        if let Some(position) = recover_fields {
            request.recover = true;
            request.offset = position.offset;
            request.epoch = position.epoch;
        }
        let channel_owned = channel.to_string();
        self.submit(Responder::Subscribe { channel: channel_owned }, |id| Command {
            id,
            subscribe: Some(request),
            ..Default::default()
        });
    }

    fn start_sub_token_fetch(&mut self, channel: &str) {
        let provider = match self.cfg.get_subscription_token.clone() {
            Some(provider) => provider,
            None => return,
        };
        let entry = match self.subs.get_mut(channel) {
            Some(entry) => entry,
            None => return,
        };
        if entry.fetching_token {
            return;
        }
        entry.fetching_token = true;
        let tx = self.cmd_tx.clone();
        let client = self.client_id.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let result = provider.subscription_token(&channel).await;
            let _ = tx.send(Instruction::SubTokenReady { channel, client, result });
        });
    }

    fn on_sub_token(&mut self, channel: &str, client: &str, result: Result<String, ClientError>) {
        {
            let entry = match self.subs.get_mut(channel) {
                Some(entry) => entry,
                None => return,
            };
            entry.fetching_token = false;
        }
        // A reconnect happened while the fetch was in flight; the new
        // connection re-drives subscribe on its own.
        if self.state() != ClientState::Connected || client != self.client_id {
            return;
        }

        match result {
            Ok(token) if token.is_empty() => {
                self.fail_subscription(channel, ClientError::Token("empty subscription token".into()));
            }
            Ok(token) => {
                let state = {
                    let entry = match self.subs.get_mut(channel) {
                        Some(entry) => entry,
                        None => return,
                    };
                    entry.token = token;
                    entry.state()
                };
                match state {
                    SubscriptionState::Subscribing => self.issue_subscribe(channel),
                    SubscriptionState::Subscribed => self.issue_sub_refresh(channel),
                    SubscriptionState::Unsubscribed => {}
                }
            }
            Err(err) => {
                tracing::warn!(%channel, error = %err, "subscription token fetch failed");
                let entry = match self.subs.get_mut(channel) {
                    Some(entry) => entry,
                    None => return,
                };
                match entry.state() {
                    SubscriptionState::Subscribing => {
                        entry.emit(SubscriptionEvent::Error(err));
                        let delay = entry.resubscribe_backoff.next_delay();
                        entry.resubscribe_at = Some(Instant::now() + delay);
                    }
                    SubscriptionState::Subscribed => {
                        entry.refresh_at = Some(
                            Instant::now() + jittered(REFRESH_RETRY_BASE, REFRESH_RETRY_SPREAD),
                        );
                    }
                    SubscriptionState::Unsubscribed => {}
                }
            }
        }
    }

    fn on_subscribe_reply(&mut self, channel: &str, result: SubscribeResult) {
        if self.state() != ClientState::Connected {
            return;
        }
        let now = Instant::now();
        let entry = match self.subs.get_mut(channel) {
            Some(entry) if entry.state() == SubscriptionState::Subscribing => entry,
            _ => return,
        };
        entry.set_state(SubscriptionState::Subscribed);
        entry.resubscribe_backoff.reset();
        entry.recover = false;
        let position = (result.positioned || result.recoverable)
            .then(|| StreamPosition { offset: result.offset, epoch: result.epoch.clone() });
        entry.position = position.clone();
        if result.expires {
            entry.refresh_at = Some(now + clamp_timer(Duration::from_secs(result.ttl as u64)));
        }
        if entry.options.token_unique_per_connection {
            entry.token.clear();
        }

        // Recovered publications replay before the subscribe notification;
        // each one advances the stored position.
        for publication in &result.publications {
            entry.track_publication(publication);
            entry.emit(SubscriptionEvent::Publication(publication.clone()));
        }
        entry.emit(SubscriptionEvent::Subscribed {
            recovered: result.recovered,
            position,
            data: result.data,
        });
        tracing::debug!(%channel, recovered = result.recovered, "subscribed");
    }

    fn on_subscribe_error(&mut self, channel: &str, err: ErrorObject) {
        if err.code == protocol::ERROR_TOKEN_EXPIRED {
            let has_provider = self.cfg.get_subscription_token.is_some();
            let mut retry = false;
            if let Some(entry) = self.subs.get_mut(channel) {
                entry.token.clear();
                retry = has_provider && entry.state() == SubscriptionState::Subscribing;
            }
            if retry {
                self.issue_subscribe(channel);
            } else {
                self.fail_subscription(
                    channel,
                    ClientError::Token("subscription token expired".into()),
                );
            }
            return;
        }
        let server_err =
            ServerError { code: err.code, message: err.message, temporary: err.temporary };
        self.on_subscribe_failure(channel, ClientError::Server(server_err), err.temporary);
    }

    fn on_subscribe_failure(&mut self, channel: &str, err: ClientError, temporary: bool) {
        let connected = self.state() == ClientState::Connected;
        let entry = match self.subs.get_mut(channel) {
            Some(entry) if entry.state() == SubscriptionState::Subscribing => entry,
            _ => return,
        };
        entry.emit(SubscriptionEvent::Error(err));
        if temporary {
            if connected {
                let delay = entry.resubscribe_backoff.next_delay();
                entry.resubscribe_at = Some(Instant::now() + delay);
            }
            // While disconnected the next connect re-drives subscribe.
        } else {
            entry.set_state(SubscriptionState::Unsubscribed);
            entry.cancel_timers();
            entry.emit(SubscriptionEvent::Unsubscribed);
        }
    }

    fn fail_subscription(&mut self, channel: &str, err: ClientError) {
        let entry = match self.subs.get_mut(channel) {
            Some(entry) => entry,
            None => return,
        };
        entry.cancel_timers();
        entry.emit(SubscriptionEvent::Error(err));
        let prev = entry.set_state(SubscriptionState::Unsubscribed);
        if prev != SubscriptionState::Unsubscribed {
            entry.emit(SubscriptionEvent::Unsubscribed);
        }
    }

    fn unsubscribe_channel(&mut self, channel: &str) {
        let was_active = {
            let entry = match self.subs.get_mut(channel) {
                Some(entry) => entry,
                None => return,
            };
            entry.cancel_timers();
            entry.recover = false;
            let prev = entry.set_state(SubscriptionState::Unsubscribed);
            if prev != SubscriptionState::Unsubscribed {
                entry.emit(SubscriptionEvent::Unsubscribed);
            }
            prev != SubscriptionState::Unsubscribed
        };
        if was_active && self.state() == ClientState::Connected {
            // Best-effort notification; no reply expected.
            let cmd = Command {
                unsubscribe: Some(UnsubscribeRequest { channel: channel.to_string() }),
                ..Default::default()
            };
            if let Err(e) = self.enqueue_command(cmd) {
                tracing::debug!(%channel, error = %e, "unsubscribe write failed");
            }
        }
    }

    fn issue_sub_refresh(&mut self, channel: &str) {
        let token = match self.subs.get(channel) {
            Some(entry) if entry.state() == SubscriptionState::Subscribed => entry.token.clone(),
            _ => return,
        };
        let request = SubRefreshRequest { channel: channel.to_string(), token };
        self.submit(Responder::SubRefresh { channel: channel.to_string() }, |id| Command {
            id,
            sub_refresh: Some(request),
            ..Default::default()
        });
    }

    fn on_sub_refresh_reply(&mut self, channel: &str, result: SubRefreshResult) {
        let entry = match self.subs.get_mut(channel) {
            Some(entry) => entry,
            None => return,
        };
        entry.refresh_at = result
            .expires
            .then(|| Instant::now() + clamp_timer(Duration::from_secs(result.ttl as u64)));
        if entry.options.token_unique_per_connection {
            entry.token.clear();
        }
    }

    fn on_sub_refresh_error(&mut self, channel: &str, err: ErrorObject) {
        if err.temporary {
            if let Some(entry) = self.subs.get_mut(channel) {
                entry.refresh_at =
                    Some(Instant::now() + jittered(REFRESH_RETRY_BASE, REFRESH_RETRY_SPREAD));
            }
            return;
        }
        let server_err =
            ServerError { code: err.code, message: err.message, temporary: false };
        self.fail_subscription(channel, ClientError::Server(server_err));
    }

    // ── Connection token refresh ─────────────────────────────────────────

    fn start_refresh(&mut self) {
        if self.state() != ClientState::Connected || self.refresh_fetching {
            return;
        }
        let provider = match self.cfg.get_connection_token.clone() {
            Some(provider) => provider,
            None => return,
        };
        self.refresh_fetching = true;
        let tx = self.cmd_tx.clone();
        let client = self.client_id.clone();
        tokio::spawn(async move {
            let result = provider.connection_token().await;
            let _ = tx.send(Instruction::RefreshTokenReady { client, result });
        });
    }

    fn on_refresh_token(&mut self, client: &str, result: Result<String, ClientError>) {
        self.refresh_fetching = false;
        // Identity changed while the fetch was pending: discard.
        if self.state() != ClientState::Connected || client != self.client_id {
            return;
        }
        match result {
            Ok(token) if token.is_empty() => {
                self.perform_close(CloseReason::Unauthorized, None);
            }
            Ok(token) => {
                self.cfg.token = token.clone();
                self.submit(Responder::Refresh, |id| Command {
                    id,
                    refresh: Some(RefreshRequest { token }),
                    ..Default::default()
                });
            }
            Err(err) => {
                tracing::warn!(error = %err, "refresh token fetch failed, retrying");
                self.refresh_at =
                    Some(Instant::now() + jittered(REFRESH_RETRY_BASE, REFRESH_RETRY_SPREAD));
            }
        }
    }

    fn on_refresh_reply(&mut self, result: RefreshResult) {
        if self.state() != ClientState::Connected {
            return;
        }
        if result.expires {
            self.refresh_at = Some(
                Instant::now() + clamp_timer(Duration::from_secs(result.ttl as u64)),
            );
        }
        tracing::debug!("connection token refreshed");
    }

    fn on_refresh_error(&mut self, err: ErrorObject) {
        if self.state() != ClientState::Connected {
            return;
        }
        if err.temporary {
            self.refresh_at =
                Some(Instant::now() + jittered(REFRESH_RETRY_BASE, REFRESH_RETRY_SPREAD));
        } else {
            tracing::warn!(code = err.code, message = %err.message, "refresh failed permanently");
            self.perform_close(CloseReason::RefreshFailed, None);
        }
    }
}

async fn recv_transport(
    rx: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn fail_instruction(instruction: Instruction, err: ClientError) {
    match instruction {
        Instruction::Publish { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        Instruction::Rpc { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        Instruction::History { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        Instruction::Presence { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        Instruction::PresenceStats { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        Instruction::Send { tx, .. } => {
            let _ = tx.send(Err(err));
        }
        _ => {}
    }
}
