// WebSocket streaming transport.

use crate::{Connection, Connector, Frame, FrameSink, FrameStream, TransportError};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

/// Opens WebSocket connections to a fixed URL.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        debug!("Opening WebSocket to {}", self.url);
        let (stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", self.url, e)))?;
        Ok(split_websocket(stream))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Split an established WebSocket into a frame sink and stream.
pub fn split_websocket<S>(stream: WebSocketStream<S>) -> Connection
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = stream.split();
    Connection {
        sink: Box::new(WebSocketSink { inner: sink }),
        stream: Box::new(WebSocketFrames { inner: stream }),
    }
}

struct WebSocketSink<S> {
    inner: SplitSink<WebSocketStream<S>, WsMessage>,
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn send(&mut self, frame: Frame) -> Result<(), TransportError> {
        let message = match frame {
            Frame::Text(text) => WsMessage::text(text),
            Frame::Binary(data) => WsMessage::binary(data),
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::Protocol(format!("Failed to close WebSocket: {}", e)))
    }
}

struct WebSocketFrames<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

#[async_trait]
impl<S> FrameStream for WebSocketFrames<S>
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.inner.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(Frame::Text(text.to_string()))),
                Ok(WsMessage::Binary(data)) => return Some(Ok(Frame::Binary(data))),
                Ok(WsMessage::Close(reason)) => {
                    debug!("WebSocket closed by peer: {:?}", reason);
                    return None;
                }
                Ok(other) => trace!("Ignoring WebSocket control message {:?}", other),
                Err(e) => {
                    warn!("WebSocket error: {}", e);
                    return Some(Err(TransportError::Io(e.to_string())));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_websocket_echo_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let Connection { mut sink, mut stream } = split_websocket(ws);
            while let Some(Ok(frame)) = stream.next_frame().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let connector = WebSocketConnector::new(format!("ws://{}", addr));
        let Connection { mut sink, mut stream } = connector.connect().await.unwrap();

        sink.send(Frame::text(r#"{"type":"CALL"}"#)).await.unwrap();
        sink.send(Frame::binary(Bytes::from_static(b"\x00\x01"))).await.unwrap();

        assert_eq!(
            stream.next_frame().await.unwrap().unwrap(),
            Frame::text(r#"{"type":"CALL"}"#)
        );
        assert_eq!(
            stream.next_frame().await.unwrap().unwrap(),
            Frame::binary(Bytes::from_static(b"\x00\x01"))
        );

        sink.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = WebSocketConnector::new(format!("ws://{}", addr))
            .connect()
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Connect(_)));
    }
}
