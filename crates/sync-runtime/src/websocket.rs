//! WebSocket connector built on tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message, Utf8Bytes,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::debug;

use crate::transport::{
    ChannelConnector, ChannelSocket, FrameSink, FrameStream, SocketFrame, TransportError,
    TransportResult,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Handshake statuses that mean the push endpoint is down as a whole.
const UNAVAILABLE_HANDSHAKE_STATUSES: [u16; 5] = [404, 410, 502, 503, 504];

/// Production connector for `ws://` push channels.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ChannelConnector for WebSocketConnector {
    async fn connect(&self, url: &str) -> TransportResult<ChannelSocket> {
        let (ws, response) = connect_async(url).await.map_err(map_handshake_error)?;
        debug!(status = response.status().as_u16(), "push channel handshake complete");

        let (sink, stream) = ws.split();
        Ok(ChannelSocket {
            sink: Box::new(WebSocketSink { sink }),
            stream: Box::new(WebSocketFrames { stream }),
        })
    }
}

struct WebSocketSink {
    sink: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.sink
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self, code: u16) -> TransportResult<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Utf8Bytes::from_static(""),
        };
        self.sink
            .send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;
        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}

struct WebSocketFrames {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WebSocketFrames {
    async fn next_frame(&mut self) -> Option<TransportResult<SocketFrame>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(Ok(SocketFrame::Text(text.as_str().to_owned())));
                }
                Ok(Message::Close(frame)) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (u16::from(CloseCode::Status), String::new()),
                    };
                    return Some(Ok(SocketFrame::Closed { code, reason }));
                }
                Ok(_) => continue,
                Err(err) => return Some(Err(map_stream_error(err))),
            }
        }
    }
}

fn map_handshake_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if UNAVAILABLE_HANDSHAKE_STATUSES.contains(&status) {
                TransportError::EndpointUnavailable(format!("handshake returned HTTP {status}"))
            } else {
                TransportError::ConnectionFailed(format!("handshake returned HTTP {status}"))
            }
        }
        tungstenite::Error::Io(io) if io.kind() == std::io::ErrorKind::ConnectionRefused => {
            TransportError::EndpointUnavailable(io.to_string())
        }
        other => TransportError::ConnectionFailed(other.to_string()),
    }
}

fn map_stream_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::ConnectionClosed
        }
        other => TransportError::ConnectionFailed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_connection_counts_as_unavailable() {
        let err = tungstenite::Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(matches!(
            map_handshake_error(err),
            TransportError::EndpointUnavailable(_)
        ));
    }

    #[test]
    fn other_io_failures_are_retryable() {
        let err = tungstenite::Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionReset));
        assert!(matches!(
            map_handshake_error(err),
            TransportError::ConnectionFailed(_)
        ));
        assert_eq!(
            map_stream_error(tungstenite::Error::ConnectionClosed),
            TransportError::ConnectionClosed
        );
    }

    #[tokio::test]
    async fn unreachable_host_fails_to_connect() {
        let result = WebSocketConnector::new()
            .connect("ws://127.0.0.1:9/notifications/1/")
            .await;
        assert!(result.is_err());
    }
}
