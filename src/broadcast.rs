use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use crate::config::{FlowConfig, Overflow};
use crate::message::SerializedException;

/// Hot stream fan-out sink.
///
/// The engine's feeder job publishes decoded-wire elements here; any number
/// of subscribers read them through independent buffered queues. Replay keeps
/// the most recent elements for late subscribers; a conflated sink keeps
/// exactly the latest element, which is how state streams always hand new
/// subscribers the current value
pub(crate) struct Broadcast {
    buffer: usize,
    replay: usize,
    overflow: Overflow,
    conflate: bool,
    state: Mutex<BroadcastState>,
}

struct BroadcastState {
    replay: VecDeque<Arc<str>>,
    subscribers: Vec<Arc<SubscriberShared>>,
    terminated: Option<Option<SerializedException>>,
}

struct SubscriberShared {
    queue: Mutex<SubscriberQueue>,
}

struct SubscriberQueue {
    items: VecDeque<QueueItem>,
    waker: Option<Waker>,
    detached: bool,
    done: bool,
}

enum QueueItem {
    Element(Arc<str>),
    Cancelled(SerializedException),
    Finished,
}

/// Item handed to a subscription; end-of-stream is signalled separately
pub(crate) enum SubscriberItem {
    Element(Arc<str>),
    Cancelled(SerializedException),
}

impl Broadcast {
    pub fn new(flow: &FlowConfig, conflate: bool) -> Self {
        Self {
            buffer: flow.shared_buffer,
            replay: if conflate { 1 } else { flow.shared_replay },
            overflow: if conflate {
                Overflow::DropOldest
            } else {
                flow.on_overflow
            },
            conflate,
            state: Mutex::new(BroadcastState {
                replay: VecDeque::new(),
                subscribers: Vec::new(),
                terminated: None,
            }),
        }
    }

    /// Fan one encoded element out to the replay buffer and every live
    /// subscriber
    pub fn publish(&self, element: String) {
        let element: Arc<str> = element.into();
        let mut state = self.state.lock().unwrap();

        if state.terminated.is_some() {
            return;
        }

        if self.replay > 0 {
            if state.replay.len() == self.replay {
                state.replay.pop_front();
            }
            state.replay.push_back(element.clone());
        }

        let capacity = if self.conflate {
            1
        } else {
            self.buffer + self.replay
        };
        let overflow = self.overflow;

        state.subscribers.retain(|subscriber| {
            let mut queue = subscriber.queue.lock().unwrap();
            if queue.detached {
                return false;
            }

            let full = capacity > 0 && queue.items.len() >= capacity;
            match (full, overflow) {
                (true, Overflow::DropLatest) => {}
                (true, Overflow::DropOldest) => {
                    queue.items.pop_front();
                    queue.items.push_back(QueueItem::Element(element.clone()));
                }
                _ => queue.items.push_back(QueueItem::Element(element.clone())),
            }

            if let Some(waker) = queue.waker.take() {
                waker.wake();
            }
            true
        });
    }

    /// Terminate the stream: `None` for normal completion, a cause when the
    /// producer failed. Every subscriber observes the termination after its
    /// buffered elements
    pub fn finish(&self, cause: Option<SerializedException>) {
        let mut state = self.state.lock().unwrap();

        if state.terminated.is_some() {
            return;
        }
        state.terminated = Some(cause.clone());

        for subscriber in state.subscribers.drain(..) {
            let mut queue = subscriber.queue.lock().unwrap();
            if queue.detached {
                continue;
            }

            queue.items.push_back(match &cause {
                Some(cause) => QueueItem::Cancelled(cause.clone()),
                None => QueueItem::Finished,
            });

            if let Some(waker) = queue.waker.take() {
                waker.wake();
            }
        }
    }

    /// New subscriber, primed with the replay buffer (and the termination
    /// marker if the stream is already over)
    pub fn subscribe(&self) -> Subscriber {
        let mut state = self.state.lock().unwrap();

        let mut items: VecDeque<QueueItem> = state
            .replay
            .iter()
            .cloned()
            .map(QueueItem::Element)
            .collect();

        if let Some(cause) = &state.terminated {
            items.push_back(match cause {
                Some(cause) => QueueItem::Cancelled(cause.clone()),
                None => QueueItem::Finished,
            });
        }

        let shared = Arc::new(SubscriberShared {
            queue: Mutex::new(SubscriberQueue {
                items,
                waker: None,
                detached: false,
                done: false,
            }),
        });

        if state.terminated.is_none() {
            state.subscribers.push(shared.clone());
        }

        Subscriber { shared }
    }

    /// Latest published element, if any
    pub fn latest(&self) -> Option<Arc<str>> {
        self.state.lock().unwrap().replay.back().cloned()
    }
}

/// One subscriber's end of a [Broadcast]
pub(crate) struct Subscriber {
    shared: Arc<SubscriberShared>,
}

impl Subscriber {
    /// Poll the next item; `Ready(None)` once the stream finished
    pub fn poll_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<SubscriberItem>> {
        let mut queue = self.shared.queue.lock().unwrap();

        match queue.items.pop_front() {
            Some(QueueItem::Element(element)) => Poll::Ready(Some(SubscriberItem::Element(element))),
            Some(QueueItem::Cancelled(cause)) => {
                queue.done = true;
                Poll::Ready(Some(SubscriberItem::Cancelled(cause)))
            }
            Some(QueueItem::Finished) => {
                queue.done = true;
                Poll::Ready(None)
            }
            None if queue.done => Poll::Ready(None),
            None => {
                queue.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }

    /// Stop receiving; the publisher prunes the queue
    pub fn detach(&self) {
        self.shared.queue.lock().unwrap().detached = true;
    }
}
