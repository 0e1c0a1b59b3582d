//! Message Channels
//!
//! The transport boundary. A connection is split into a [`MessageSink`]
//! (writes, shared behind the registry's serializing wrapper) and a
//! [`MessageSource`] (reads, owned by the connection's read loop).
//!
//! Two implementations live here: an in-process channel backed by tokio mpsc
//! queues, and the WebSocket adapter used by the server.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};
use tracing::debug;

use crate::network::protocol::{Envelope, ProtocolError};

/// Channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The peer is gone.
    #[error("channel closed")]
    Closed,

    /// An inbound frame could not be decoded. The channel stays usable.
    #[error("undecodable frame: {0}")]
    Decode(#[from] ProtocolError),

    /// An outbound envelope could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// WebSocket transport failure.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

impl ChannelError {
    /// Whether the read loop may keep reading after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ChannelError::Decode(_))
    }
}

/// Write half of a connection.
#[async_trait]
pub trait MessageSink: Send {
    /// Deliver one envelope.
    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError>;

    /// Close the write half. Further sends fail.
    async fn close(&mut self) {}
}

/// Read half of a connection.
#[async_trait]
pub trait MessageSource: Send {
    /// Next envelope, or `Ok(None)` once the peer has closed.
    async fn receive(&mut self) -> Result<Option<Envelope>, ChannelError>;
}

// =============================================================================
// IN-PROCESS CHANNEL
// =============================================================================

/// Sink half of an in-process channel.
pub struct LocalSink {
    tx: Option<mpsc::UnboundedSender<Envelope>>,
}

/// Source half of an in-process channel.
pub struct LocalSource {
    rx: mpsc::UnboundedReceiver<Envelope>,
}

/// The remote end of an in-process channel: what a client would see.
pub struct LocalPeer {
    /// Envelopes the server sent.
    pub inbox: mpsc::UnboundedReceiver<Envelope>,
    /// Envelopes to feed to the server's read loop. Drop to disconnect.
    pub outbox: mpsc::UnboundedSender<Envelope>,
}

impl LocalPeer {
    /// Drain everything received so far.
    pub fn drain(&mut self) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(env) = self.inbox.try_recv() {
            out.push(env);
        }
        out
    }

    /// Drain and keep only envelopes of one type.
    pub fn drain_kind(&mut self, kind: &str) -> Vec<Envelope> {
        self.drain().into_iter().filter(|e| e.kind == kind).collect()
    }
}

/// Create an in-process channel.
pub fn local_channel() -> (LocalSink, LocalSource, LocalPeer) {
    let (to_peer_tx, to_peer_rx) = mpsc::unbounded_channel();
    let (from_peer_tx, from_peer_rx) = mpsc::unbounded_channel();

    (
        LocalSink { tx: Some(to_peer_tx) },
        LocalSource { rx: from_peer_rx },
        LocalPeer {
            inbox: to_peer_rx,
            outbox: from_peer_tx,
        },
    )
}

#[async_trait]
impl MessageSink for LocalSink {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError> {
        match &self.tx {
            Some(tx) => tx.send(envelope.clone()).map_err(|_| ChannelError::Closed),
            None => Err(ChannelError::Closed),
        }
    }

    async fn close(&mut self) {
        self.tx = None;
    }
}

#[async_trait]
impl MessageSource for LocalSource {
    async fn receive(&mut self) -> Result<Option<Envelope>, ChannelError> {
        Ok(self.rx.recv().await)
    }
}

// =============================================================================
// WEBSOCKET ADAPTER
// =============================================================================

/// Sink half of a WebSocket connection. Envelopes go out as JSON text frames.
pub struct WsSink<S> {
    inner: SplitSink<WebSocketStream<S>, Message>,
}

/// Source half of a WebSocket connection.
pub struct WsSource<S> {
    inner: SplitStream<WebSocketStream<S>>,
}

/// Split an upgraded WebSocket into sink and source halves.
pub fn split_websocket<S>(ws: WebSocketStream<S>) -> (WsSink<S>, WsSource<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (sink, stream) = ws.split();
    (WsSink { inner: sink }, WsSource { inner: stream })
}

#[async_trait]
impl<S> MessageSink for WsSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, envelope: &Envelope) -> Result<(), ChannelError> {
        let text = envelope
            .to_json()
            .map_err(|e| ChannelError::Encode(e.to_string()))?;
        self.inner.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

#[async_trait]
impl<S> MessageSource for WsSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn receive(&mut self) -> Result<Option<Envelope>, ChannelError> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(Envelope::from_json(&text)?)),
                Some(Ok(Message::Binary(data))) => return Ok(Some(Envelope::from_bytes(&data)?)),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                // Pings are answered by tungstenite on the next write
                Some(Ok(other)) => {
                    debug!("Ignoring control frame: {:?}", other);
                }
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}
