//! WebSocket transport (tokio-tungstenite)
//!
//! One envelope per message. Text is sent whenever the payload is UTF-8; both
//! text and binary are accepted on receive. Ping/pong are ignored and a close
//! frame ends the stream.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, watch};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tracing::debug;

use super::HANDSHAKE_TIMEOUT;
use crate::domain::{ChannelError, ConnectError, Message};
use crate::ports::{Acceptor, Channel, Connector, Handshake};

type Sink<S> = SplitSink<WebSocketStream<S>, WsMessage>;

pub struct WsChannel<S> {
    sink: Mutex<Option<Sink<S>>>,
    stream: Mutex<SplitStream<WebSocketStream<S>>>,
    closed: watch::Sender<bool>,
    peer: String,
}

impl<S> WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(socket: WebSocketStream<S>, peer: impl Into<String>) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(Some(sink)),
            stream: Mutex::new(stream),
            closed: watch::channel(false).0,
            peer: peer.into(),
        }
    }

    async fn next_payload(stream: &mut SplitStream<WebSocketStream<S>>) -> Result<Option<Message>, ChannelError> {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(WsMessage::Text(text)) => return Ok(Some(text.as_bytes().to_vec())),
                Ok(WsMessage::Binary(data)) => return Ok(Some(data.to_vec())),
                Ok(WsMessage::Close(_)) => return Ok(None),
                Ok(_) => continue,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return Ok(None);
                }
                Err(err) => return Err(ChannelError::Transport(err.to_string())),
            }
        }
        Ok(None)
    }
}

fn to_ws_message(message: Message) -> WsMessage {
    match String::from_utf8(message) {
        Ok(text) => WsMessage::text(text),
        Err(err) => WsMessage::binary(err.into_bytes()),
    }
}

#[async_trait]
impl<S> Channel for WsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, message: Message) -> Result<(), ChannelError> {
        let mut sink = self.sink.lock().await;
        let sink = sink.as_mut().ok_or(ChannelError::Closed)?;
        sink.send(to_ws_message(message))
            .await
            .map_err(|err| ChannelError::Transport(err.to_string()))
    }

    async fn receive(&self) -> Result<Option<Message>, ChannelError> {
        if *self.closed.borrow() {
            return Ok(None);
        }
        let mut closed = self.closed.subscribe();
        let mut stream = self.stream.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Ok(None),
            payload = Self::next_payload(&mut stream) => payload,
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.close().await;
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}

pub struct WsAcceptor {
    listener: TcpListener,
}

impl WsAcceptor {
    pub async fn bind(address: impl ToSocketAddrs) -> Result<Self, ConnectError> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ConnectError> {
        Ok(self.listener.local_addr()?)
    }
}

async fn upgrade(stream: TcpStream, peer: SocketAddr) -> Result<Box<dyn Channel>, ConnectError> {
    let socket = tokio::time::timeout(HANDSHAKE_TIMEOUT, tokio_tungstenite::accept_async(stream))
        .await
        .map_err(|_| ConnectError::Handshake(format!("{peer}: no upgrade within {HANDSHAKE_TIMEOUT:?}")))?
        .map_err(|err| ConnectError::Handshake(format!("{peer}: {err}")))?;
    debug!(peer = %peer, "websocket upgraded");
    Ok(Box::new(WsChannel::new(socket, format!("ws://{peer}"))))
}

#[async_trait]
impl Acceptor for WsAcceptor {
    async fn accept(&self) -> Result<Handshake, ConnectError> {
        let (stream, peer) = self.listener.accept().await?;
        Ok(upgrade(stream, peer).boxed())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    /// `address` may be a full `ws://` URL or a bare `host:port`.
    async fn connect(&self, address: &str) -> Result<Box<dyn Channel>, ConnectError> {
        let url = if address.contains("://") {
            address.to_string()
        } else {
            format!("ws://{address}")
        };
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|err| ConnectError::Transport(err.to_string()))?;
        Ok(Box::new(WsChannel::new(socket, url)))
    }
}
