//! In-process channel - 開発用・テスト用の transport
//!
//! A [`pair`] is two connected ends over unbounded mpsc queues. [`listener`]
//! gives an acceptor/connector couple so the controller's accept loop can be
//! exercised without sockets.

use async_trait::async_trait;
use futures_util::FutureExt;
use futures_util::future;
use tokio::sync::{Mutex, mpsc, watch};

use crate::domain::{ChannelError, ConnectError, Message};
use crate::ports::{Acceptor, Channel, Connector, Handshake};

pub struct MemoryChannel {
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: Mutex<mpsc::UnboundedReceiver<Message>>,
    closed: watch::Sender<bool>,
    label: String,
}

impl MemoryChannel {
    fn new(
        outbound: mpsc::UnboundedSender<Message>,
        inbound: mpsc::UnboundedReceiver<Message>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            outbound: Mutex::new(Some(outbound)),
            inbound: Mutex::new(inbound),
            closed: watch::channel(false).0,
            label: label.into(),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Two connected ends. Whatever one sends, the other receives.
pub fn pair() -> (MemoryChannel, MemoryChannel) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    (
        MemoryChannel::new(a_tx, b_rx, "memory:a"),
        MemoryChannel::new(b_tx, a_rx, "memory:b"),
    )
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send(&self, message: Message) -> Result<(), ChannelError> {
        let outbound = self.outbound.lock().await;
        let tx = outbound.as_ref().ok_or(ChannelError::Closed)?;
        tx.send(message).map_err(|_| ChannelError::Closed)
    }

    async fn receive(&self) -> Result<Option<Message>, ChannelError> {
        if self.is_closed() {
            return Ok(None);
        }
        let mut closed = self.closed.subscribe();
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Ok(None),
            message = inbound.recv() => Ok(message),
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        // 送信側を落とすと相手の receive は残りを読み切ったあと None になる
        self.outbound.lock().await.take();
        if let Ok(mut inbound) = self.inbound.try_lock() {
            inbound.close();
        }
    }

    fn peer(&self) -> String {
        self.label.clone()
    }
}

/// Controller side of [`listener`].
pub struct MemoryAcceptor {
    incoming: Mutex<mpsc::UnboundedReceiver<MemoryChannel>>,
}

/// Worker side of [`listener`]. Cloneable; every clone dials the same acceptor.
#[derive(Clone)]
pub struct MemoryConnector {
    dial: mpsc::UnboundedSender<MemoryChannel>,
}

pub fn listener() -> (MemoryAcceptor, MemoryConnector) {
    let (dial, incoming) = mpsc::unbounded_channel();
    (
        MemoryAcceptor {
            incoming: Mutex::new(incoming),
        },
        MemoryConnector { dial },
    )
}

#[async_trait]
impl Acceptor for MemoryAcceptor {
    async fn accept(&self) -> Result<Handshake, ConnectError> {
        match self.incoming.lock().await.recv().await {
            Some(channel) => {
                let channel: Box<dyn Channel> = Box::new(channel);
                Ok(future::ready(Ok::<_, ConnectError>(channel)).boxed())
            }
            None => Err(ConnectError::ListenerClosed),
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, address: &str) -> Result<Box<dyn Channel>, ConnectError> {
        let (near, far) = pair();
        self.dial
            .send(far)
            .map_err(|_| ConnectError::Transport(format!("no listener at {address}")))?;
        Ok(Box::new(near))
    }
}
