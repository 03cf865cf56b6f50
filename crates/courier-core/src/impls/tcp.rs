//! TCP tunnel - length-prefixed frames over a raw TCP stream
//!
//! The connecting worker opens with one frame carrying [`PROTOCOL_TAG`]. The
//! acceptor rejects any other first frame, or silence past
//! [`HANDSHAKE_TIMEOUT`](super::HANDSHAKE_TIMEOUT).

use std::net::SocketAddr;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use super::HANDSHAKE_TIMEOUT;
use super::frame::{read_frame, write_frame};
use crate::domain::{ChannelError, ConnectError, Message};
use crate::ports::{Acceptor, Channel, Connector, Handshake};

pub const PROTOCOL_TAG: &[u8] = b"courier/1";

const INBOUND_CAPACITY: usize = 64;

/// Frames are read by a dedicated task, so `receive` can be cancelled (e.g.
/// by a response deadline) without losing a partially read frame.
pub struct TcpChannel {
    inbound: Mutex<mpsc::Receiver<Result<Message, ChannelError>>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: JoinHandle<()>,
    closed: watch::Sender<bool>,
    peer: SocketAddr,
}

impl TcpChannel {
    /// Must be called inside a tokio runtime.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let (tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            inbound: Mutex::new(inbound),
            writer: Mutex::new(Some(writer)),
            reader: tokio::spawn(read_frames(reader, tx)),
            closed: watch::channel(false).0,
            peer,
        }
    }
}

async fn read_frames(mut reader: OwnedReadHalf, tx: mpsc::Sender<Result<Message, ChannelError>>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if tx.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                let _ = tx.send(Err(err)).await;
                return;
            }
        }
    }
}

#[async_trait]
impl Channel for TcpChannel {
    async fn send(&self, message: Message) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ChannelError::Closed)?;
        write_frame(writer, &message).await
    }

    async fn receive(&self) -> Result<Option<Message>, ChannelError> {
        if *self.closed.borrow() {
            return Ok(None);
        }
        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Ok(None),
            frame = inbound.recv() => frame.transpose(),
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        self.reader.abort();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    fn peer(&self) -> String {
        format!("tcp://{}", self.peer)
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

pub struct TcpAcceptor {
    listener: TcpListener,
}

impl TcpAcceptor {
    pub async fn bind(address: impl ToSocketAddrs) -> Result<Self, ConnectError> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ConnectError> {
        Ok(self.listener.local_addr()?)
    }
}

async fn handshake(stream: TcpStream, peer: SocketAddr) -> Result<Box<dyn Channel>, ConnectError> {
    let channel = TcpChannel::new(stream, peer);
    let hello = tokio::time::timeout(HANDSHAKE_TIMEOUT, channel.receive())
        .await
        .map_err(|_| ConnectError::Handshake(format!("{peer}: no handshake within {HANDSHAKE_TIMEOUT:?}")))??;
    match hello {
        Some(tag) if tag == PROTOCOL_TAG => {
            debug!(peer = %peer, "handshake accepted");
            Ok(Box::new(channel))
        }
        Some(_) => {
            channel.close().await;
            Err(ConnectError::Handshake(format!("{peer}: unexpected protocol tag")))
        }
        None => Err(ConnectError::Handshake(format!("{peer}: closed before handshake"))),
    }
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<Handshake, ConnectError> {
        let (stream, peer) = self.listener.accept().await?;
        Ok(handshake(stream, peer).boxed())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn Channel>, ConnectError> {
        let stream = TcpStream::connect(address).await?;
        let peer = stream.peer_addr()?;
        let channel = TcpChannel::new(stream, peer);
        channel.send(PROTOCOL_TAG.to_vec()).await?;
        Ok(Box::new(channel))
    }
}
