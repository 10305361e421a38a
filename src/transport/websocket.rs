//! WebSocket transport — `tokio-tungstenite`.
//!
//! `initialize` spawns a pump task that dials the server, reports `Open`,
//! and then shuttles frames both ways until the socket dies or the session
//! closes the transport. Handshake failures surface as a `Closed` event
//! before any `Open`, which is what drives endpoint negotiation upstream.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::codec::Frame;
use crate::config::Protocol;
use crate::error::ClientError;
use crate::transport::{Transport, TransportEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Close code reported when the socket dies without a close frame.
const ABNORMAL_CLOSE: u32 = 1006;

pub struct WebSocketTransport {
    url: String,
    protocol: Protocol,
    out_tx: Option<mpsc::UnboundedSender<Frame>>,
    close_tx: Option<tokio::sync::oneshot::Sender<()>>,
    pump: Option<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            protocol: Protocol::Json,
            out_tx: None,
            close_tx: None,
            pump: None,
        }
    }
}

impl Transport for WebSocketTransport {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn sub_name(&self) -> &'static str {
        match self.protocol {
            Protocol::Json => "json",
            Protocol::Protobuf => "protobuf",
        }
    }

    fn initialize(
        &mut self,
        protocol: Protocol,
        sink: mpsc::UnboundedSender<TransportEvent>,
        _initial_frame: Option<Frame>,
    ) -> Result<(), ClientError> {
        self.protocol = protocol;
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = tokio::sync::oneshot::channel();
        self.out_tx = Some(out_tx);
        self.close_tx = Some(close_tx);
        self.pump = Some(tokio::spawn(pump(self.url.clone(), protocol, sink, out_rx, close_rx)));
        Ok(())
    }

    fn send(&mut self, frame: Frame, _session: &str, _node: &str) -> Result<(), ClientError> {
        match &self.out_tx {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| ClientError::TransportWrite("websocket pump gone".into())),
            None => Err(ClientError::TransportWrite("transport not initialized".into())),
        }
    }

    fn close(&mut self) {
        self.out_tx = None;
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(tx) = self.close_tx.take() {
            let _ = tx.send(());
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

async fn pump(
    url: String,
    protocol: Protocol,
    sink: mpsc::UnboundedSender<TransportEvent>,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
    mut close_rx: tokio::sync::oneshot::Receiver<()>,
) {
    let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url));
    let ws = tokio::select! {
        res = connect => res,
        _ = &mut close_rx => return,
    };

    let (mut ws_sink, mut ws_stream) = match ws {
        Ok(Ok((stream, _))) => stream.split(),
        Ok(Err(e)) => {
            tracing::debug!(%url, error = %e, "websocket handshake failed");
            let _ = sink.send(TransportEvent::Error(e.to_string()));
            let _ = sink.send(TransportEvent::Closed {
                code: ABNORMAL_CLOSE,
                reason: e.to_string(),
            });
            return;
        }
        Err(_) => {
            let _ = sink.send(TransportEvent::Error("connection timeout".into()));
            let _ = sink.send(TransportEvent::Closed {
                code: ABNORMAL_CLOSE,
                reason: "connection timeout".into(),
            });
            return;
        }
    };

    let _ = sink.send(TransportEvent::Open);

    loop {
        tokio::select! {
            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let _ = sink.send(TransportEvent::Message(text.as_bytes().to_vec()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = sink.send(TransportEvent::Message(data.to_vec()));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = extract_close(frame.as_ref());
                        let _ = sink.send(TransportEvent::Closed { code: code as u32, reason });
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let reason = e.to_string();
                        let _ = sink.send(TransportEvent::Error(reason.clone()));
                        let _ = sink.send(TransportEvent::Closed { code: ABNORMAL_CLOSE, reason });
                        return;
                    }
                    None => {
                        let _ = sink.send(TransportEvent::Closed {
                            code: ABNORMAL_CLOSE,
                            reason: "stream ended".into(),
                        });
                        return;
                    }
                }
            }
            frame = out_rx.recv() => {
                match frame {
                    Some(frame) => {
                        let msg = match protocol {
                            Protocol::Json => match String::from_utf8(frame) {
                                Ok(text) => Message::Text(text.into()),
                                Err(e) => {
                                    tracing::warn!(error = %e, "dropping non-utf8 frame on json transport");
                                    continue;
                                }
                            },
                            Protocol::Protobuf => Message::Binary(frame.into()),
                        };
                        if let Err(e) = ws_sink.send(msg).await {
                            let reason = e.to_string();
                            let _ = sink.send(TransportEvent::Error(reason.clone()));
                            let _ = sink.send(TransportEvent::Closed { code: ABNORMAL_CLOSE, reason });
                            return;
                        }
                    }
                    None => {
                        // Sender side dropped without an explicit close.
                        let _ = ws_sink.close().await;
                        return;
                    }
                }
            }
            _ = &mut close_rx => {
                let _ = ws_sink.send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client disconnect".into(),
                }))).await;
                return;
            }
        }
    }
}

fn extract_close(frame: Option<&CloseFrame>) -> (u16, String) {
    match frame {
        Some(f) => (f.code.into(), f.reason.to_string()),
        None => (ABNORMAL_CLOSE as u16, "no close frame".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_before_initialize_fails() {
        let mut t = WebSocketTransport::new("ws://localhost:1/connection");
        let err = t.send(b"{}".to_vec(), "", "").unwrap_err();
        assert!(matches!(err, ClientError::TransportWrite(_)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut t = WebSocketTransport::new("ws://localhost:1/connection");
        t.close();
        t.close();
    }

    #[test]
    fn test_extract_close_with_frame() {
        let frame = CloseFrame { code: CloseCode::Normal, reason: "bye".into() };
        let (code, reason) = extract_close(Some(&frame));
        assert_eq!(code, 1000);
        assert_eq!(reason, "bye");
    }

    #[test]
    fn test_extract_close_without_frame() {
        let (code, reason) = extract_close(None);
        assert_eq!(code, 1006);
        assert_eq!(reason, "no close frame");
    }

    #[tokio::test]
    async fn test_handshake_failure_reports_close_before_open() {
        let mut t = WebSocketTransport::new("ws://127.0.0.1:1/connection");
        let (sink, mut rx) = mpsc::unbounded_channel();
        t.initialize(Protocol::Json, sink, None).unwrap();

        let mut saw_open = false;
        let mut saw_closed = false;
        while let Some(ev) = rx.recv().await {
            match ev {
                TransportEvent::Open => saw_open = true,
                TransportEvent::Closed { .. } => {
                    saw_closed = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(!saw_open);
        assert!(saw_closed);
    }
}
