//! Per-connection adapter between a peer's stream and the room hub.
//!
//! Each connection runs two tasks: the inbound pump decodes messages from
//! the peer and forwards them to the hub; the outbound pump drains the
//! client's mailbox onto the peer. Both are written against
//! `futures::{Stream, Sink}` so any framed transport can sit underneath.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{
    select,
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, warn};

use crate::{
    hub::{HubClosed, HubHandle},
    identity::Identity,
    message::{IncomingMessage, Message},
};

pub type ClientId = u64;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Upper bound on closing the peer stream when no write deadline is set.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Why a connection ended. Every variant is terminal for that one client only.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("malformed message from peer")]
    Decode(#[from] serde_json::Error),
    #[error("transport failure")]
    Transport(#[source] BoxError),
    #[error("peer sent nothing within {0:?}")]
    ReadTimeout(Duration),
    #[error("write to peer did not complete within {0:?}")]
    WriteTimeout(Duration),
    #[error("removed from the room for not keeping up")]
    Evicted,
    #[error(transparent)]
    HubClosed(#[from] HubClosed),
    #[error("connection task failed")]
    Task(#[from] tokio::task::JoinError),
}

impl ConnectionError {
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }
}

/// Deadlines applied to each read and write on a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientConfig {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// Membership entry for one connection. Owned by the hub while the
/// connection is in the room; holds the only sender for its mailbox.
#[derive(Debug)]
pub struct Client {
    id: ClientId,
    identity: Arc<Identity>,
    sender: mpsc::Sender<Arc<Message>>,
    eviction: oneshot::Sender<()>,
    dropped: u64,
}

impl Client {
    pub fn new(identity: Identity, capacity: usize) -> (Self, Mailbox) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let (eviction, evicted) = oneshot::channel();
        let client = Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            identity: Arc::new(identity),
            sender,
            eviction,
            dropped: 0,
        };
        (client, Mailbox { receiver, evicted })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn identity(&self) -> Arc<Identity> {
        Arc::clone(&self.identity)
    }

    pub(crate) fn sender(&self) -> &mpsc::Sender<Arc<Message>> {
        &self.sender
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }

    pub(crate) fn record_drop(&mut self) {
        self.dropped += 1;
    }

    /// Forces the connection closed even if its outbound stream is stuck
    /// mid-write. Consumes the client, which also closes its mailbox.
    pub(crate) fn evict(self) {
        let _ = self.eviction.send(());
    }
}

/// Outbound queue of a client. Closed when the hub drops the client.
#[derive(Debug)]
pub struct Mailbox {
    receiver: mpsc::Receiver<Arc<Message>>,
    evicted: oneshot::Receiver<()>,
}

impl Mailbox {
    /// Next queued message, or `None` once the mailbox is closed and drained.
    pub async fn recv(&mut self) -> Option<Arc<Message>> {
        self.receiver.recv().await
    }
}

/// Decodes messages from `source` and forwards them to the hub, attributed to
/// `sender`. Returns `Ok` when the peer closes the stream cleanly.
pub async fn read_pump<S>(
    sender: &Identity,
    mut source: S,
    hub: &HubHandle,
    read_timeout: Option<Duration>,
) -> Result<(), ConnectionError>
where
    S: Stream<Item = Result<IncomingMessage, ConnectionError>> + Unpin,
{
    loop {
        let next = match read_timeout {
            Some(limit) => timeout(limit, source.next())
                .await
                .map_err(|_| ConnectionError::ReadTimeout(limit))?,
            None => source.next().await,
        };

        let Some(incoming) = next else {
            return Ok(());
        };

        let message = Message::stamped(sender, incoming?.message);
        hub.forward(message)?;
    }
}

/// Writes every message from `mailbox` to `sink` until the mailbox closes, a
/// write fails or the hub evicts the client, then closes the sink. The sink
/// is closed exactly once.
pub async fn write_pump<K>(
    mailbox: Mailbox,
    mut sink: K,
    write_timeout: Option<Duration>,
) -> Result<(), ConnectionError>
where
    K: Sink<Arc<Message>, Error = ConnectionError> + Unpin,
{
    let Mailbox {
        mut receiver,
        mut evicted,
    } = mailbox;

    // A pending write is abandoned on eviction.
    let result = select! {
        biased;

        Ok(()) = &mut evicted => Err(ConnectionError::Evicted),
        result = drain(&mut receiver, &mut sink, write_timeout) => result,
    };

    let limit = write_timeout.unwrap_or(CLOSE_TIMEOUT);
    match timeout(limit, sink.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => debug!(error = %err, "failed to close peer stream"),
        Err(_) => debug!(?limit, "peer stream did not close in time"),
    }

    result
}

async fn drain<K>(
    receiver: &mut mpsc::Receiver<Arc<Message>>,
    sink: &mut K,
    write_timeout: Option<Duration>,
) -> Result<(), ConnectionError>
where
    K: Sink<Arc<Message>, Error = ConnectionError> + Unpin,
{
    while let Some(message) = receiver.recv().await {
        with_write_deadline(write_timeout, sink.send(message)).await?;
    }
    Ok(())
}

async fn with_write_deadline<F>(limit: Option<Duration>, write: F) -> Result<(), ConnectionError>
where
    F: Future<Output = Result<(), ConnectionError>>,
{
    match limit {
        Some(limit) => timeout(limit, write)
            .await
            .map_err(|_| ConnectionError::WriteTimeout(limit))?,
        None => write.await,
    }
}

/// Runs one connection from join to teardown.
///
/// Joins the hub, starts the outbound pump on its own task and drives the
/// inbound pump on the caller's. Whichever pump stops first triggers the
/// teardown: the client leaves the hub exactly once, then the outbound pump
/// is awaited so the stream is closed before this returns. An eviction by the
/// hub stops the outbound pump, so it tears the connection down the same way.
pub async fn serve_connection<S, K>(
    hub: &HubHandle,
    identity: Identity,
    source: S,
    sink: K,
    config: ClientConfig,
) -> Result<(), ConnectionError>
where
    S: Stream<Item = Result<IncomingMessage, ConnectionError>> + Unpin,
    K: Sink<Arc<Message>, Error = ConnectionError> + Unpin + Send + 'static,
{
    let (client, mailbox) = Client::new(identity, hub.mailbox_capacity());
    let id = client.id();
    let identity = client.identity();
    hub.join(client)?;

    let mut writer: JoinHandle<Result<(), ConnectionError>> =
        tokio::spawn(write_pump(mailbox, sink, config.write_timeout));

    let (inbound, outbound) = select! {
        inbound = read_pump(&identity, source, hub, config.read_timeout) => (Some(inbound), None),
        outbound = &mut writer => (None, Some(outbound)),
    };

    if let Err(HubClosed) = hub.leave(id) {
        debug!(client = id, "hub already stopped during teardown");
    }

    let outbound = match outbound {
        Some(outbound) => outbound,
        None => writer.await,
    };

    match (inbound, outbound?) {
        (Some(Err(err)), _) => Err(err),
        (_, Err(ConnectionError::Evicted)) => {
            warn!(client = id, "connection closed after eviction");
            Err(ConnectionError::Evicted)
        }
        (_, Err(err)) => {
            warn!(client = id, error = %err, "outbound stream failed");
            Err(err)
        }
        _ => Ok(()),
    }
}
