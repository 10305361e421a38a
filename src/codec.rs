//! Frame codec — commands out, replies in.
//!
//! The session engine is codec-agnostic: it hands a batch of commands to a
//! [`CommandEncoder`] and feeds raw transport frames through a
//! [`ReplyDecoder`], which must yield replies in wire order. The JSON codec
//! ships with the crate; a Protobuf codec can be injected through the same
//! pair of traits.

use crate::error::ClientError;
use crate::protocol::{Command, Reply};

/// Raw transport frame.
pub type Frame = Vec<u8>;

pub trait CommandEncoder: Send + Sync {
    /// Encode a batch of commands into a single frame.
    fn encode(&self, commands: &[Command]) -> Result<Frame, ClientError>;
}

pub trait ReplyDecoder: Send + Sync {
    /// Decode a frame into replies, preserving wire order.
    fn decode(&self, frame: &Frame) -> Result<Vec<Reply>, ClientError>;
}

/// Encoder/decoder pair.
pub trait Codec: CommandEncoder + ReplyDecoder {}

impl<T: CommandEncoder + ReplyDecoder> Codec for T {}

/// Newline-delimited JSON framing: one JSON object per line, an empty
/// object for pings/pongs.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl CommandEncoder for JsonCodec {
    fn encode(&self, commands: &[Command]) -> Result<Frame, ClientError> {
        let mut lines = Vec::with_capacity(commands.len());
        for cmd in commands {
            let line = serde_json::to_string(cmd)
                .map_err(|e| ClientError::Protocol(format!("encode: {e}")))?;
            lines.push(line);
        }
        Ok(lines.join("\n").into_bytes())
    }
}

impl ReplyDecoder for JsonCodec {
    fn decode(&self, frame: &Frame) -> Result<Vec<Reply>, ClientError> {
        let text = std::str::from_utf8(frame)
            .map_err(|e| ClientError::Protocol(format!("frame is not utf-8: {e}")))?;
        let mut replies = Vec::new();
        for line in text.split('\n') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let reply: Reply = serde_json::from_str(line)
                .map_err(|e| ClientError::Protocol(format!("decode: {e} — raw: {line}")))?;
            replies.push(reply);
        }
        Ok(replies)
    }
}
