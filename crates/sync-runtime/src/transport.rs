//! Transport abstraction for push channel sockets.
//!
//! The connection manager only talks to these traits, so tests can script
//! handshakes and frames without a network.

use async_trait::async_trait;
use sync_core::state_machine::{ABNORMAL_CLOSE_CODE, CloseReason};

/// One inbound item from a push socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketFrame {
    /// A text payload.
    Text(String),
    /// The peer closed the socket.
    Closed { code: u16, reason: String },
}

/// Error type for transport operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Handshake or I/O failure worth retrying with backoff.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The remote endpoint is down as a whole.
    #[error("endpoint unavailable: {0}")]
    EndpointUnavailable(String),

    /// Connection closed unexpectedly.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

impl TransportError {
    /// Close reason fed to the connection state machine.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::EndpointUnavailable(detail) => CloseReason::EndpointUnavailable {
                detail: detail.clone(),
            },
            Self::ConnectionClosed => CloseReason::Abnormal {
                code: Some(ABNORMAL_CLOSE_CODE),
                detail: self.to_string(),
            },
            other => CloseReason::abnormal(other.to_string()),
        }
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Write half of an open socket.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> TransportResult<()>;

    /// Send a close frame with `code`.
    async fn close(&mut self, code: u16) -> TransportResult<()>;
}

/// Read half of an open socket.
#[async_trait]
pub trait FrameStream: Send {
    /// Next frame, or `None` when the transport ended without a close frame.
    async fn next_frame(&mut self) -> Option<TransportResult<SocketFrame>>;
}

/// An established socket split into halves.
pub struct ChannelSocket {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl std::fmt::Debug for ChannelSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSocket").finish_non_exhaustive()
    }
}

/// Opens push sockets. Authentication is carried in the URL.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    async fn connect(&self, url: &str) -> TransportResult<ChannelSocket>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_unavailable_maps_to_capped_reason() {
        let err = TransportError::EndpointUnavailable("503".into());
        assert!(matches!(
            err.close_reason(),
            CloseReason::EndpointUnavailable { .. }
        ));
    }

    #[test]
    fn dropped_connection_maps_to_abnormal_close() {
        assert!(matches!(
            TransportError::ConnectionClosed.close_reason(),
            CloseReason::Abnormal {
                code: Some(ABNORMAL_CLOSE_CODE),
                ..
            }
        ));
        assert!(matches!(
            TransportError::ConnectionFailed("reset".into()).close_reason(),
            CloseReason::Abnormal { code: None, .. }
        ));
    }
}
