//! The room hub: single owner of membership and message fan-out.
//!
//! Every membership change and every inbound message reaches the hub through
//! a channel and is handled to completion by one task, one event at a time.
//! The membership map is never shared, so no lock guards it.

use std::{collections::HashMap, sync::Arc, time::Duration};

use thiserror::Error;
use tokio::{
    select,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender, error::TrySendError},
        oneshot,
    },
    time::timeout,
};
use tracer::Tracer;
use tracing::{debug, info, warn};

use crate::{
    client::{Client, ClientId},
    identity::Identity,
    message::Message,
};

/// Mailbox capacity used when none is configured.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// What the hub does when a member's mailbox is full during fan-out.
///
/// The choice trades delivery guarantees against isolation from slow peers:
/// only `Block` delivers to every member, at the cost of letting one stalled
/// member hold up the whole room.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Skip the slow member for this message and count the drop.
    #[default]
    Drop,
    /// Wait for a free slot before moving on to the next member.
    Block,
    /// Wait up to the given duration, then remove the member from the room.
    Disconnect(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    pub mailbox_capacity: usize,
    pub overflow: OverflowPolicy,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

/// Returned by [`HubHandle`] operations once the hub task has stopped.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("room hub is no longer running")]
pub struct HubClosed;

/// A member as seen from outside the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub id: ClientId,
    pub identity: Arc<Identity>,
    /// Messages skipped because the member's mailbox was full.
    pub dropped: u64,
}

/// Cloneable front door to a running [`Hub`].
#[derive(Debug, Clone)]
pub struct HubHandle {
    join_tx: UnboundedSender<Client>,
    leave_tx: UnboundedSender<ClientId>,
    roster_tx: UnboundedSender<oneshot::Sender<Vec<Member>>>,
    forward_tx: UnboundedSender<Arc<Message>>,
    mailbox_capacity: usize,
}

impl HubHandle {
    /// Queues `client` for admission to the room.
    pub fn join(&self, client: Client) -> Result<(), HubClosed> {
        self.join_tx.send(client).map_err(|_| HubClosed)
    }

    /// Queues removal of the member with `id`; its mailbox is closed once the
    /// hub processes the request.
    pub fn leave(&self, id: ClientId) -> Result<(), HubClosed> {
        self.leave_tx.send(id).map_err(|_| HubClosed)
    }

    /// Queues `message` for delivery to every member present when the hub
    /// gets to it.
    pub fn forward(&self, message: Message) -> Result<(), HubClosed> {
        self.forward_tx
            .send(Arc::new(message))
            .map_err(|_| HubClosed)
    }

    /// Current members, in no particular order.
    pub async fn roster(&self) -> Result<Vec<Member>, HubClosed> {
        let (respond_to, response) = oneshot::channel();
        self.roster_tx.send(respond_to).map_err(|_| HubClosed)?;
        response.await.map_err(|_| HubClosed)
    }

    pub fn mailbox_capacity(&self) -> usize {
        self.mailbox_capacity
    }
}

pub struct Hub {
    join_rx: UnboundedReceiver<Client>,
    leave_rx: UnboundedReceiver<ClientId>,
    roster_rx: UnboundedReceiver<oneshot::Sender<Vec<Member>>>,
    forward_rx: UnboundedReceiver<Arc<Message>>,
    clients: HashMap<ClientId, Client>,
    overflow: OverflowPolicy,
    tracer: Box<dyn Tracer>,
}

impl Hub {
    /// Creates a hub and the handle used to talk to it. The hub does nothing
    /// until [`Hub::run`] is spawned.
    pub fn new(config: HubConfig, tracer: Box<dyn Tracer>) -> (Self, HubHandle) {
        let (join_tx, join_rx) = mpsc::unbounded_channel();
        let (leave_tx, leave_rx) = mpsc::unbounded_channel();
        let (roster_tx, roster_rx) = mpsc::unbounded_channel();
        let (forward_tx, forward_rx) = mpsc::unbounded_channel();

        let hub = Self {
            join_rx,
            leave_rx,
            roster_rx,
            forward_rx,
            clients: HashMap::new(),
            overflow: config.overflow,
            tracer,
        };
        let handle = HubHandle {
            join_tx,
            leave_tx,
            roster_tx,
            forward_tx,
            mailbox_capacity: config.mailbox_capacity.max(1),
        };

        (hub, handle)
    }

    /// Runs the event loop until every [`HubHandle`] has been dropped.
    ///
    /// Sources are polled in a fixed order (join, leave, forward, roster) so
    /// a client's join is always applied before any message it submits. Roster
    /// queries come last and never hold up fan-out.
    pub async fn run(mut self) {
        info!("room hub started");

        loop {
            select! {
                biased;

                Some(client) = self.join_rx.recv() => self.handle_join(client),
                Some(id) = self.leave_rx.recv() => self.handle_leave(id),
                Some(message) = self.forward_rx.recv() => self.handle_forward(message).await,
                Some(respond_to) = self.roster_rx.recv() => {
                    let _ = respond_to.send(self.roster());
                }
                else => break,
            }
        }

        info!("room hub stopped");
    }

    fn handle_join(&mut self, client: Client) {
        info!(
            client = client.id(),
            name = %client.identity().name,
            members = self.clients.len() + 1,
            "client joined room"
        );
        self.clients.insert(client.id(), client);
        self.tracer.trace("New client joined");
    }

    fn handle_leave(&mut self, id: ClientId) {
        // Dropping the client drops the mailbox sender, which ends the
        // outbound task once it has drained.
        match self.clients.remove(&id) {
            Some(client) => {
                info!(
                    client = id,
                    name = %client.identity().name,
                    members = self.clients.len(),
                    "client left room"
                );
                self.tracer.trace("Client left");
            }
            None => debug!(client = id, "leave for a client that is not a member"),
        }
    }

    async fn handle_forward(&mut self, message: Arc<Message>) {
        debug!(from = %message.name, members = self.clients.len(), "forwarding message");
        self.tracer
            .trace(&format!("Message received: {}", message.message));

        let mut stalled = Vec::new();
        for client in self.clients.values_mut() {
            match deliver(client, Arc::clone(&message), self.overflow).await {
                Delivery::Sent => self.tracer.trace(" -- sent to client"),
                Delivery::Dropped => self.tracer.trace(" -- dropped for slow client"),
                Delivery::Stalled => stalled.push(client.id()),
                Delivery::Closed => {}
            }
        }

        for id in stalled {
            if let Some(client) = self.clients.remove(&id) {
                warn!(
                    client = id,
                    name = %client.identity().name,
                    "disconnecting client with stalled mailbox"
                );
                client.evict();
                self.tracer.trace("Client disconnected: mailbox stalled");
            }
        }
    }

    fn roster(&self) -> Vec<Member> {
        self.clients
            .values()
            .map(|client| Member {
                id: client.id(),
                identity: client.identity(),
                dropped: client.dropped(),
            })
            .collect()
    }
}

enum Delivery {
    Sent,
    Dropped,
    Stalled,
    /// The outbound task is gone; teardown will remove the member shortly.
    Closed,
}

async fn deliver(client: &mut Client, message: Arc<Message>, policy: OverflowPolicy) -> Delivery {
    match policy {
        OverflowPolicy::Drop => match client.sender().try_send(message) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(_)) => {
                client.record_drop();
                warn!(
                    client = client.id(),
                    dropped = client.dropped(),
                    "client mailbox is full, dropping message"
                );
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        },
        OverflowPolicy::Block => match client.sender().send(message).await {
            Ok(()) => Delivery::Sent,
            Err(_) => Delivery::Closed,
        },
        OverflowPolicy::Disconnect(limit) => {
            match timeout(limit, client.sender().send(message)).await {
                Ok(Ok(())) => Delivery::Sent,
                Ok(Err(_)) => Delivery::Closed,
                Err(_) => Delivery::Stalled,
            }
        }
    }
}
