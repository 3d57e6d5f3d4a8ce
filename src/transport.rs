use std::sync::{Arc, Mutex};

use futures::channel::mpsc::{self, Receiver, Sender, UnboundedSender};
use futures::{SinkExt, StreamExt};
use log::{debug, trace};
use tokio::sync::watch;

use crate::message::Message;
use crate::monitor::{self, Direction, MonitorMessage};

/// Depth of the per-direction message queue. Sends suspend when the peer's
/// dispatcher falls this far behind
const TRANSPORT_QUEUE_DEPTH: usize = 64;

/// Inbound message handler. Offered every inbound message in registration
/// order; returns `true` to claim the message and stop the offer round
pub type MessageHandler = Box<dyn FnMut(&Message) -> bool + Send>;

/// Identifies a registered handler for [Transport::unsubscribe]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerId(u64);

struct SubscriberTable {
    next_id: u64,
    entries: Vec<(u64, MessageHandler)>,
}

impl SubscriberTable {
    fn offer(&mut self, message: &Message) -> bool {
        self.entries.iter_mut().any(|(_, handler)| handler(message))
    }
}

/// One end of a full-duplex, ordered, reliable message channel.
///
/// The engines only ever use `send` and `subscribe`; `pair` builds two
/// connected in-process ends the way a socket pair connects two RPC handles.
/// Terminal failure is reported by flipping the `alive` watch, which every
/// engine task selects on
pub struct Transport {
    peer_name: String,
    outbound: Sender<Message>,
    subscribers: Arc<Mutex<SubscriberTable>>,
    monitor: Arc<Mutex<Option<UnboundedSender<MonitorMessage>>>>,
    alive: watch::Receiver<bool>,
}

impl Transport {
    /// Make a connected pair of transports. Messages sent on one end are
    /// offered to the other end's subscribers in wire order
    pub fn pair(left_name: &str, right_name: &str) -> (Arc<Transport>, Arc<Transport>) {
        let (to_right, from_left) = mpsc::channel(TRANSPORT_QUEUE_DEPTH);
        let (to_left, from_right) = mpsc::channel(TRANSPORT_QUEUE_DEPTH);

        let (left_alive_tx, left_alive_rx) = watch::channel(true);
        let (right_alive_tx, right_alive_rx) = watch::channel(true);

        let left = Arc::new(Transport::new(left_name, to_right, left_alive_rx));
        let right = Arc::new(Transport::new(right_name, to_left, right_alive_rx));

        left.spawn_dispatch(from_right, left_alive_tx);
        right.spawn_dispatch(from_left, right_alive_tx);

        (left, right)
    }

    fn new(peer_name: &str, outbound: Sender<Message>, alive: watch::Receiver<bool>) -> Self {
        trace!("Making new transport end <{peer_name}>");

        Self {
            peer_name: peer_name.to_owned(),
            outbound,
            subscribers: Arc::new(Mutex::new(SubscriberTable {
                next_id: 0,
                entries: Vec::new(),
            })),
            monitor: Arc::new(Mutex::new(None)),
            alive,
        }
    }

    /// Offer every inbound message to the subscribers, in wire order, until
    /// one claims it. Flips the alive watch when the peer hangs up
    fn spawn_dispatch(&self, mut inbound: Receiver<Message>, alive_tx: watch::Sender<bool>) {
        let subscribers = self.subscribers.clone();
        let monitor = self.monitor.clone();
        let peer_name = self.peer_name.clone();

        tokio::spawn(async move {
            while let Some(message) = inbound.next().await {
                trace!("<{peer_name}> incoming message for {}", message.call_id());

                monitor::observe(&monitor, Direction::Incoming, &peer_name, &message);

                let claimed = subscribers.lock().unwrap().offer(&message);
                if !claimed {
                    debug!("<{peer_name}> dropping unclaimed message: {message:?}");
                }
            }

            debug!("<{peer_name}> transport peer disconnected");
            let _ = alive_tx.send(false);
        });
    }

    /// Verbose peer name
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// Send one message to the peer. Suspends until the message is handed
    /// off; delivery is reliable and ordered
    pub async fn send(&self, message: Message) -> crate::Result<()> {
        monitor::observe(&self.monitor, Direction::Outgoing, &self.peer_name, &message);

        self.outbound
            .clone()
            .send(message)
            .await
            .map_err(|_| crate::Error::TransportClosed)
    }

    /// Register an inbound message handler. Handlers are offered each
    /// message in registration order until one claims it
    pub fn subscribe(&self, handler: MessageHandler) -> HandlerId {
        let mut table = self.subscribers.lock().unwrap();
        table.next_id += 1;
        let id = table.next_id;
        table.entries.push((id, handler));

        trace!("<{}> new subscriber {id}", self.peer_name);

        HandlerId(id)
    }

    /// Remove a registered handler. Idempotent
    pub fn unsubscribe(&self, id: HandlerId) {
        self.subscribers
            .lock()
            .unwrap()
            .entries
            .retain(|(entry_id, _)| *entry_id != id.0);
    }

    /// Install a monitor sink recording every frame crossing this end
    pub fn set_monitor(&self, sink: UnboundedSender<MonitorMessage>) {
        debug!("<{}> monitor connected", self.peer_name);
        *self.monitor.lock().unwrap() = Some(sink);
    }

    /// Resolves when the peer is gone
    pub async fn wait_closed(&self) {
        let mut alive = self.alive.clone();

        loop {
            if !*alive.borrow_and_update() {
                return;
            }

            if alive.changed().await.is_err() {
                return;
            }
        }
    }
}
