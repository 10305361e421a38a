//! Transport layer — the capability the session engine drives.
//!
//! A transport owns the raw connection and reports everything back through
//! an event sink; the session engine never touches I/O directly. Concrete
//! transports are injected as endpoint entries, tried in order during
//! connect negotiation.

#[cfg(feature = "ws-native")]
pub mod websocket;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::codec::Frame;
use crate::config::Protocol;
use crate::error::ClientError;

/// Events a transport reports to the session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The connection is open and writable.
    Open,
    /// A raw inbound frame.
    Message(Frame),
    /// A non-fatal transport error; a `Closed` event follows if the
    /// connection is lost.
    Error(String),
    /// The connection is gone. May arrive before `Open` when the handshake
    /// itself failed.
    Closed { code: u32, reason: String },
}

/// A bidirectional (or emulated) connection to the server.
///
/// `initialize` opens the connection and must deliver `Open`, `Message`,
/// `Error` and `Closed` events through the sink. `close` is idempotent.
pub trait Transport: Send {
    /// Whether this transport can work in the current environment.
    fn supported(&self) -> bool {
        true
    }

    /// Transport kind for diagnostics, e.g. `"websocket"`.
    fn name(&self) -> &'static str;

    /// Protocol flavor for diagnostics, e.g. `"json"`.
    fn sub_name(&self) -> &'static str;

    /// True for transports that cannot carry upstream frames over the same
    /// channel and deliver the initial connect reply via the inbound stream.
    fn emulation(&self) -> bool {
        false
    }

    /// Open the connection. For emulation transports `initial_frame` holds
    /// the encoded connect command to deliver out-of-band.
    fn initialize(
        &mut self,
        protocol: Protocol,
        sink: mpsc::UnboundedSender<TransportEvent>,
        initial_frame: Option<Frame>,
    ) -> Result<(), ClientError>;

    /// Best-effort write. `session`/`node` identify the connection for
    /// emulation side-channels; bidirectional transports ignore them.
    fn send(&mut self, frame: Frame, session: &str, node: &str) -> Result<(), ClientError>;

    /// Tear down the connection. Safe to call more than once.
    fn close(&mut self);
}

/// Factory producing a fresh transport for an endpoint. Called once per
/// connection attempt so reconnects always start from a clean transport.
pub type TransportFactory = Arc<dyn Fn(&str) -> Box<dyn Transport> + Send + Sync>;

/// One entry of the transport negotiation list.
#[derive(Clone)]
pub struct TransportEndpoint {
    pub endpoint: String,
    pub factory: TransportFactory,
}

impl TransportEndpoint {
    pub fn new(endpoint: &str, factory: TransportFactory) -> Self {
        Self { endpoint: endpoint.to_string(), factory }
    }

    /// Endpoint backed by the built-in WebSocket transport.
    #[cfg(feature = "ws-native")]
    pub fn websocket(endpoint: &str) -> Self {
        Self::new(
            endpoint,
            Arc::new(|url: &str| {
                Box::new(websocket::WebSocketTransport::new(url)) as Box<dyn Transport>
            }),
        )
    }

    pub fn build(&self) -> Box<dyn Transport> {
        (self.factory)(&self.endpoint)
    }
}

impl std::fmt::Debug for TransportEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEndpoint").field("endpoint", &self.endpoint).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullTransport;

    impl Transport for NullTransport {
        fn name(&self) -> &'static str {
            "null"
        }
        fn sub_name(&self) -> &'static str {
            "json"
        }
        fn initialize(
            &mut self,
            _protocol: Protocol,
            sink: mpsc::UnboundedSender<TransportEvent>,
            _initial_frame: Option<Frame>,
        ) -> Result<(), ClientError> {
            let _ = sink.send(TransportEvent::Open);
            Ok(())
        }
        fn send(&mut self, _frame: Frame, _session: &str, _node: &str) -> Result<(), ClientError> {
            Ok(())
        }
        fn close(&mut self) {}
    }

    #[test]
    fn test_endpoint_builds_fresh_transports() {
        let endpoint = TransportEndpoint::new(
            "ws://localhost/connection",
            Arc::new(|_| Box::new(NullTransport) as Box<dyn Transport>),
        );
        let t = endpoint.build();
        assert_eq!(t.name(), "null");
        assert!(!t.emulation());
        assert!(t.supported());
    }
}
