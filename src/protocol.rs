//! Wire envelope types — commands, replies, pushes.
//!
//! One `Command` carries exactly one request member plus an `id` when a
//! reply is expected. A `Reply` carries either a correlated result, an
//! error, or a server push; a completely empty reply is a server ping.
//!
//! Payload data is carried as `serde_json::Value`; the codec layer decides
//! the actual framing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn is_zero(id: &u32) -> bool {
    *id == 0
}

// ─── Stream positions & publications ─────────────────────────────────────────

/// Monotonic log position and generation for one channel. Together they
/// form a recoverable stream position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPosition {
    pub offset: u64,
    pub epoch: String,
}

/// A message published to a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<ClientInfo>,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, String>,
}

fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}

/// Identity of a connection as seen in presence and join/leave events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub client: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chan_info: Option<Value>,
}

// ─── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Known server subscriptions with recovery positions.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub subs: HashMap<String, SubscribeRequest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// Present on standalone subscribe commands, omitted inside the
    /// connect `subs` map where the key is the channel.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub recover: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnsubscribeRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishRequest {
    pub channel: String,
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PresenceStatsRequest {
    pub channel: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub channel: String,
    #[serde(default, skip_serializing_if = "is_zero_i32")]
    pub limit: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<StreamPosition>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reverse: bool,
}

fn is_zero_i32(v: &i32) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RefreshRequest {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubRefreshRequest {
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token: String,
}

// ─── Command envelope ────────────────────────────────────────────────────────

/// Outbound command. Carries exactly one request member; an all-empty
/// command is a pong answering a server ping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribeRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_stats: Option<PresenceStatsRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc: Option<RpcRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send: Option<SendRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<RefreshRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_refresh: Option<SubRefreshRequest>,
}

impl Command {
    /// An empty command frame — the pong answer to a server ping.
    pub fn pong() -> Command {
        Command::default()
    }
}

// ─── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectResult {
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub ttl: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Server-side subscriptions announced at connect.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub subs: HashMap<String, SubscribeResult>,
    /// Server ping interval in seconds; 0 disables server-driven pings.
    #[serde(default)]
    pub ping: u32,
    /// Whether the server expects a pong for each of its pings.
    #[serde(default)]
    pub pong: bool,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub node: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubscribeResult {
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub recoverable: bool,
    #[serde(default)]
    pub epoch: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<Publication>,
    #[serde(default)]
    pub recovered: bool,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub positioned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeResult {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishResult {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceResult {
    #[serde(default)]
    pub presence: HashMap<String, ClientInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceStatsResult {
    #[serde(default)]
    pub num_clients: u32,
    #[serde(default)]
    pub num_users: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryResult {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub publications: Vec<Publication>,
    #[serde(default)]
    pub epoch: String,
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResult {
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefreshResult {
    #[serde(default)]
    pub client: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub ttl: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubRefreshResult {
    #[serde(default)]
    pub expires: bool,
    #[serde(default)]
    pub ttl: u32,
}

// ─── Pushes ──────────────────────────────────────────────────────────────────

/// Server-initiated push, routed by which member is present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Push {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, rename = "pub", skip_serializing_if = "Option::is_none")]
    pub publication: Option<Publication>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinPush>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leave: Option<LeavePush>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribePush>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<MessagePush>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribePush>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnect: Option<DisconnectPush>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinPush {
    #[serde(default)]
    pub info: ClientInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LeavePush {
    #[serde(default)]
    pub info: ClientInfo,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnsubscribePush {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessagePush {
    #[serde(default)]
    pub data: Value,
}

/// Server-side subscription announced after connect.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscribePush {
    #[serde(default)]
    pub recoverable: bool,
    #[serde(default)]
    pub epoch: String,
    #[serde(default)]
    pub offset: u64,
    #[serde(default)]
    pub positioned: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DisconnectPush {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub reason: String,
}

// ─── Reply envelope ──────────────────────────────────────────────────────────

/// Error object carried in a reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    #[serde(default)]
    pub code: u32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub temporary: bool,
}

/// Inbound reply. `id != 0` correlates it to an in-flight command; a
/// `push` member routes by push kind; an entirely empty reply is a
/// server ping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Reply {
    #[serde(default, skip_serializing_if = "is_zero")]
    pub id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push: Option<Push>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect: Option<ConnectResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<SubscribeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsubscribe: Option<UnsubscribeResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_stats: Option<PresenceStatsResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history: Option<HistoryResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc: Option<RpcResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh: Option<RefreshResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_refresh: Option<SubRefreshResult>,
}

impl Reply {
    /// A frame with no correlation id and no push is a server ping.
    pub fn is_ping(&self) -> bool {
        self.id == 0 && self.push.is_none()
    }
}

// ─── Codes ───────────────────────────────────────────────────────────────────

/// Connect error: connection token expired, reconnect with a fresh one.
pub const ERROR_TOKEN_EXPIRED: u32 = 109;
/// Connect error: the client's stream position is unrecoverable.
pub const ERROR_UNRECOVERABLE_POSITION: u32 = 112;
/// Local disconnect code used when the keepalive watchdog fires.
pub const DISCONNECT_NO_PING: u32 = 11;

/// Whether a disconnect code allows reconnecting.
///
/// Codes below 3000 are transport-level; 3000–3499 and 4000–4499 are
/// server-initiated but reconnectable; 3500–3999 and 4500–4999 are
/// server-initiated terminal.
pub fn disconnect_code_reconnects(code: u32) -> bool {
    !((3500..4000).contains(&code) || (4500..5000).contains(&code))
}

/// Whether a connect error allows retrying with backoff.
///
/// Codes below 100 are transport/internal, `temporary` is an explicit
/// server hint, and 109 means the token expired and must be refreshed.
pub fn connect_error_retries(err: &ErrorObject) -> bool {
    err.code < 100 || err.temporary || err.code == ERROR_TOKEN_EXPIRED
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_command_serializes_only_present_member() {
        let cmd = Command {
            id: 1,
            connect: Some(ConnectRequest {
                token: "T".into(),
                name: "rust".into(),
                ..Default::default()
            }),
            ..Default::default()
        };
        let v: Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["id"], 1);
        assert_eq!(v["connect"]["token"], "T");
        assert!(v.get("subscribe").is_none());
        assert!(v.get("publish").is_none());
        assert!(v["connect"].get("subs").is_none());
    }

    #[test]
    fn test_pong_is_empty_object() {
        let v: Value = serde_json::to_value(Command::pong()).unwrap();
        assert_eq!(v, json!({}));
    }

    #[test]
    fn test_empty_reply_is_ping() {
        let reply: Reply = serde_json::from_str("{}").unwrap();
        assert!(reply.is_ping());
        assert_eq!(reply.id, 0);
    }

    #[test]
    fn test_reply_with_push_is_not_ping() {
        let reply: Reply = serde_json::from_value(json!({
            "push": {"channel": "news", "pub": {"data": {"v": 1}, "offset": 3}}
        }))
        .unwrap();
        assert!(!reply.is_ping());
        let push = reply.push.unwrap();
        assert_eq!(push.channel, "news");
        let publication = push.publication.unwrap();
        assert_eq!(publication.offset, 3);
        assert_eq!(publication.data, json!({"v": 1}));
    }

    #[test]
    fn test_connect_reply_deserialization() {
        let reply: Reply = serde_json::from_value(json!({
            "id": 1,
            "connect": {
                "client": "c1", "session": "s", "node": "n",
                "ping": 25, "pong": true,
                "subs": {"news": {"recoverable": true, "epoch": "e", "offset": 10}}
            }
        }))
        .unwrap();
        let connect = reply.connect.unwrap();
        assert_eq!(connect.client, "c1");
        assert_eq!(connect.ping, 25);
        assert!(connect.pong);
        assert!(connect.subs["news"].recoverable);
        assert_eq!(connect.subs["news"].offset, 10);
    }

    #[test]
    fn test_error_reply_deserialization() {
        let reply: Reply = serde_json::from_value(json!({
            "id": 4,
            "error": {"code": 103, "message": "permission denied"}
        }))
        .unwrap();
        let err = reply.error.unwrap();
        assert_eq!(err.code, 103);
        assert!(!err.temporary);
    }

    #[test]
    fn test_subscribe_request_recovery_fields() {
        let req = SubscribeRequest {
            channel: "c".into(),
            recover: true,
            epoch: "e".into(),
            offset: 10,
            ..Default::default()
        };
        let v: Value = serde_json::to_value(&req).unwrap();
        assert_eq!(v, json!({"channel": "c", "recover": true, "epoch": "e", "offset": 10}));
    }

    #[test]
    fn test_disconnect_code_bands() {
        assert!(disconnect_code_reconnects(4)); // transport-level
        assert!(disconnect_code_reconnects(3001));
        assert!(disconnect_code_reconnects(4001));
        assert!(!disconnect_code_reconnects(3500));
        assert!(!disconnect_code_reconnects(3999));
        assert!(!disconnect_code_reconnects(4500));
        assert!(!disconnect_code_reconnects(4999));
    }

    #[test]
    fn test_connect_error_retry_classification() {
        let transport = ErrorObject { code: 10, message: "internal".into(), temporary: false };
        let temp = ErrorObject { code: 100, message: "busy".into(), temporary: true };
        let expired = ErrorObject { code: ERROR_TOKEN_EXPIRED, message: "expired".into(), temporary: false };
        let permanent = ErrorObject { code: 103, message: "denied".into(), temporary: false };
        let unrecoverable =
            ErrorObject { code: ERROR_UNRECOVERABLE_POSITION, message: "gone".into(), temporary: false };
        assert!(connect_error_retries(&transport));
        assert!(connect_error_retries(&temp));
        assert!(connect_error_retries(&expired));
        assert!(!connect_error_retries(&permanent));
        assert!(!connect_error_retries(&unrecoverable));
    }
}
