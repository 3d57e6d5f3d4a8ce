use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::stream::BoxStream;
use log::{debug, trace, warn};

use crate::broadcast::Broadcast;
use crate::config::FlowConfig;
use crate::message::SerializedException;
use crate::stream::StreamEvent;

/// A local stream registered for sending, drawn by the outgoing pump.
/// Elements are already erased to their encoded form
pub(crate) struct OutgoingStream {
    pub stream_id: String,
    pub elements: BoxStream<'static, crate::Result<String>>,
}

/// A materialized hot receive endpoint, drawn by the hot feeder
pub(crate) struct HotFeed {
    pub stream_id: String,
    pub events: UnboundedReceiver<StreamEvent>,
    pub sink: Arc<Broadcast>,
}

struct IncomingEntry {
    events: UnboundedSender<StreamEvent>,
    receiver: Option<UnboundedReceiver<StreamEvent>>,
    terminated: bool,
}

impl IncomingEntry {
    fn new() -> Self {
        let (events, receiver) = mpsc::unbounded();
        Self {
            events,
            receiver: Some(receiver),
            terminated: false,
        }
    }
}

struct ContextState {
    incoming: HashMap<String, IncomingEntry>,
    retired: HashSet<String>,
    outgoing_queue: Option<UnboundedReceiver<OutgoingStream>>,
    hot_queue: Option<UnboundedReceiver<HotFeed>>,
    wake_queue: Option<UnboundedReceiver<()>>,
}

/// Per-call registry of outgoing and incoming streams.
///
/// Incoming entries are created on first use by either the decoder
/// (materializing an endpoint) or an inbound stream message (elements for a
/// stream the local side has not decoded yet buffer until the endpoint claims
/// the channel). The wake queue pokes the owning call task whenever an entry
/// terminates so it can re-evaluate teardown
pub struct StreamContext {
    call_id: String,
    service_fqn: String,
    counter: AtomicU64,
    flow: FlowConfig,
    closed: AtomicBool,
    state: Mutex<ContextState>,
    outgoing_tx: UnboundedSender<OutgoingStream>,
    hot_tx: UnboundedSender<HotFeed>,
    wake_tx: UnboundedSender<()>,
}

impl StreamContext {
    pub fn new(call_id: String, service_fqn: String, flow: FlowConfig) -> Self {
        trace!("New stream context for {call_id}");

        let (outgoing_tx, outgoing_rx) = mpsc::unbounded();
        let (hot_tx, hot_rx) = mpsc::unbounded();
        let (wake_tx, wake_rx) = mpsc::unbounded();

        Self {
            call_id,
            service_fqn,
            counter: AtomicU64::new(0),
            flow,
            closed: AtomicBool::new(false),
            state: Mutex::new(ContextState {
                incoming: HashMap::new(),
                retired: HashSet::new(),
                outgoing_queue: Some(outgoing_rx),
                hot_queue: Some(hot_rx),
                wake_queue: Some(wake_rx),
            }),
            outgoing_tx,
            hot_tx,
            wake_tx,
        }
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn service_fqn(&self) -> &str {
        &self.service_fqn
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Assign a new stream id and enqueue the erased producer for the
    /// outgoing pump. Constant time; never blocks
    pub(crate) fn register_outgoing(
        &self,
        elements: BoxStream<'static, crate::Result<String>>,
    ) -> crate::Result<String> {
        if self.is_closed() {
            return Err(crate::Error::Protocol(format!(
                "stream registered on closed call {}",
                self.call_id
            )));
        }

        let stream_id = format!("stream:{}", self.counter.fetch_add(1, Ordering::Relaxed));
        trace!("Registered outgoing stream {stream_id} on {}", self.call_id);

        self.outgoing_tx
            .unbounded_send(OutgoingStream {
                stream_id: stream_id.clone(),
                elements,
            })
            .map_err(|_| {
                crate::Error::Protocol(format!(
                    "stream registered on closed call {}",
                    self.call_id
                ))
            })?;

        Ok(stream_id)
    }

    /// Claim the receive channel for a stream id, creating the entry when
    /// delivery has not beaten the decoder to it. A closed context or a
    /// retired id yields an immediately-finished channel
    pub(crate) fn claim_incoming(
        &self,
        stream_id: &str,
    ) -> crate::Result<UnboundedReceiver<StreamEvent>> {
        if self.is_closed() {
            let (_, receiver) = mpsc::unbounded();
            return Ok(receiver);
        }

        let mut state = self.state.lock().unwrap();

        if state.retired.contains(stream_id) {
            let (_, receiver) = mpsc::unbounded();
            return Ok(receiver);
        }

        let entry = state
            .incoming
            .entry(stream_id.to_owned())
            .or_insert_with(IncomingEntry::new);

        entry.receiver.take().ok_or_else(|| {
            crate::Error::Protocol(format!("stream {stream_id} materialized twice"))
        })
    }

    /// Materialize a hot receive endpoint: claims the event channel and
    /// schedules a feeder that drains it into the returned sink
    pub(crate) fn prepare_incoming_hot(
        &self,
        stream_id: &str,
        conflate: bool,
    ) -> crate::Result<Arc<Broadcast>> {
        let events = self.claim_incoming(stream_id)?;
        let sink = Arc::new(Broadcast::new(&self.flow, conflate));

        let feed = HotFeed {
            stream_id: stream_id.to_owned(),
            events,
            sink: sink.clone(),
        };

        if self.hot_tx.unbounded_send(feed).is_err() {
            // Context closed under us; nothing will feed the sink
            sink.finish(None);
        }

        Ok(sink)
    }

    /// Route one inbound element to its stream's channel
    pub fn deliver(&self, stream_id: &str, payload: String) {
        self.push_event(stream_id, StreamEvent::Item(payload), false);
    }

    /// Stream producer on the peer completed normally
    pub fn finish(&self, stream_id: &str) {
        self.push_event(stream_id, StreamEvent::End, true);
    }

    /// Stream producer on the peer failed
    pub fn cancel(&self, stream_id: &str, cause: SerializedException) {
        self.push_event(stream_id, StreamEvent::Cancel(cause), true);
    }

    fn push_event(&self, stream_id: &str, event: StreamEvent, terminal: bool) {
        if self.is_closed() {
            debug!(
                "Stream message for {stream_id} on closed call {}, dropping",
                self.call_id
            );
            return;
        }

        let mut state = self.state.lock().unwrap();

        if state.retired.contains(stream_id) {
            debug!("Late message for retired stream {stream_id}, dropping");
            return;
        }

        let entry = state
            .incoming
            .entry(stream_id.to_owned())
            .or_insert_with(IncomingEntry::new);

        if entry.events.unbounded_send(event).is_ok() {
            if terminal {
                entry.terminated = true;
                let _ = self.wake_tx.unbounded_send(());
            }
            return;
        }

        // Receiver dropped: the local consumer cancelled collection
        debug!("Dropping message for released stream {stream_id}");
        state.incoming.remove(stream_id);
        state.retired.insert(stream_id.to_owned());
        let _ = self.wake_tx.unbounded_send(());
    }

    /// Local consumer dropped an unfinished receive endpoint; the stream no
    /// longer counts towards call teardown
    pub(crate) fn release_incoming(&self, stream_id: &str) {
        let mut state = self.state.lock().unwrap();

        if state.incoming.remove(stream_id).is_some() {
            trace!("Released incoming stream {stream_id} on {}", self.call_id);
            state.retired.insert(stream_id.to_owned());
            let _ = self.wake_tx.unbounded_send(());
        }
    }

    /// True once every incoming stream has terminated or been released
    pub fn incoming_idle(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .incoming
            .values()
            .all(|entry| entry.terminated)
    }

    pub(crate) fn take_outgoing_queue(&self) -> Option<UnboundedReceiver<OutgoingStream>> {
        self.state.lock().unwrap().outgoing_queue.take()
    }

    pub(crate) fn take_hot_queue(&self) -> Option<UnboundedReceiver<HotFeed>> {
        self.state.lock().unwrap().hot_queue.take()
    }

    pub(crate) fn take_wake_queue(&self) -> Option<UnboundedReceiver<()>> {
        self.state.lock().unwrap().wake_queue.take()
    }

    /// Stop accepting new outgoing registrations and hot feeds, letting the
    /// pump supervisor drain and exit
    pub(crate) fn close_outbound(&self) {
        self.outgoing_tx.close_channel();
        self.hot_tx.close_channel();
    }

    /// Idempotent teardown: closes every incoming channel and both outbound
    /// queues. Claimed endpoints drain their buffered events and then end
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("Closing stream context for {}", self.call_id);

        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        for (stream_id, entry) in state.incoming.drain() {
            if !entry.terminated {
                warn!("Stream {stream_id} still open at call teardown");
            }
            state.retired.insert(stream_id);
        }

        self.close_outbound();
        self.wake_tx.close_channel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use futures::StreamExt;

    fn context() -> StreamContext {
        StreamContext::new(
            "client:1:TestArgs:1".into(),
            "test.Service".into(),
            FlowConfig::default(),
        )
    }

    #[test]
    fn test_stream_ids_unique_and_sequential() {
        let context = context();

        let first = context
            .register_outgoing(stream::empty().boxed())
            .unwrap();
        let second = context
            .register_outgoing(stream::empty().boxed())
            .unwrap();

        assert_eq!(first, "stream:0");
        assert_eq!(second, "stream:1");
    }

    #[tokio::test]
    async fn test_delivery_buffers_until_claimed() {
        let context = context();

        context.deliver("stream:0", "\"early\"".into());
        context.finish("stream:0");

        let mut events = context.claim_incoming("stream:0").unwrap();
        assert!(matches!(events.next().await, Some(StreamEvent::Item(_))));
        assert!(matches!(events.next().await, Some(StreamEvent::End)));
    }

    #[test]
    fn test_double_claim_is_a_fault() {
        let context = context();

        let _events = context.claim_incoming("stream:0").unwrap();
        assert!(context.claim_incoming("stream:0").is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let context = context();
        let mut events = context.claim_incoming("stream:0").unwrap();

        context.close();
        context.close();

        assert!(context.is_closed());
        assert!(events.next().await.is_none());
        assert!(context.register_outgoing(stream::empty().boxed()).is_err());
    }

    #[test]
    fn test_release_marks_idle() {
        let context = context();

        let _events = context.claim_incoming("stream:0").unwrap();
        assert!(!context.incoming_idle());

        context.release_incoming("stream:0");
        assert!(context.incoming_idle());

        // Late traffic for the released stream is dropped
        context.deliver("stream:0", "\"late\"".into());
        assert!(context.incoming_idle());
    }
}
