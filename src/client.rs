use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::channel::{mpsc, oneshot};
use futures::{select, FutureExt, StreamExt};
use log::{debug, trace, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::codec::CallCodec;
use crate::config::ClientConfig;
use crate::error;
use crate::message::Message;
use crate::pump;
use crate::service::CallInfo;
use crate::stream_context::StreamContext;
use crate::transport::Transport;

static ENGINE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Client-side call engine.
///
/// Multiplexes any number of concurrent calls over one transport. Each call
/// gets a task driving its inbound state machine and a supervisor pumping its
/// outgoing streams; dropping the engine aborts every call
pub struct ClientEngine {
    engine_id: String,
    transport: Arc<Transport>,
    config: ClientConfig,
    call_counter: AtomicU64,
    active_calls: Arc<AtomicUsize>,
    tasks: Mutex<JoinSet<()>>,
}

impl ClientEngine {
    /// Engine with a process-unique id
    pub fn new(transport: Arc<Transport>, config: ClientConfig) -> Self {
        let n = ENGINE_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
        Self::with_id(format!("client:{n}"), transport, config)
    }

    /// Engine with an injected id, for deterministic call ids in tests
    pub fn with_id(engine_id: String, transport: Arc<Transport>, config: ClientConfig) -> Self {
        trace!("Making new client engine {engine_id}");

        Self {
            engine_id,
            transport,
            config,
            call_counter: AtomicU64::new(0),
            active_calls: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Number of calls whose task subtree is still live
    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::Relaxed)
    }

    /// Perform one call: encode the arguments, send `CallData`, and await the
    /// scalar completion. Streams embedded in the arguments start pumping
    /// concurrently; streams embedded in the returned value keep flowing
    /// after this returns, for as long as the call's context lives
    pub async fn call<A, R>(&self, info: CallInfo<A>) -> crate::Result<R>
    where
        A: Serialize + Send + 'static,
        R: DeserializeOwned + Send + 'static,
    {
        let call_id = format!(
            "{}:{}:{}",
            self.engine_id,
            info.arg_type,
            self.call_counter.fetch_add(1, Ordering::Relaxed) + 1
        );

        debug!(
            "New call {call_id} to {}::{}",
            info.service_fqn, info.callable_name
        );

        let context = Arc::new(StreamContext::new(
            call_id.clone(),
            info.service_fqn.to_owned(),
            self.config.flow.clone(),
        ));
        let codec = CallCodec::new(context.clone(), self.config.serializers.clone());

        // Encoding registers any argument streams with the context
        let payload = codec.encode(&info.args)?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded();
        let handler_id = self.transport.subscribe(Box::new({
            let call_id = call_id.clone();
            move |message: &Message| {
                if message.call_id() == call_id {
                    let _ = inbox_tx.unbounded_send(message.clone());
                    true
                } else {
                    false
                }
            }
        }));

        let (done_tx, done_rx) = oneshot::channel();

        // The pumps must not start before CallData is on the wire: a stream
        // message outrunning its call would be dropped by the peer
        let sent = self
            .transport
            .send(Message::CallData {
                call_id,
                service_fqn: info.service_fqn.to_owned(),
                callable_name: info.callable_name.to_owned(),
                payload,
                call_kind: info.call_kind,
            })
            .await;

        if let Err(e) = sent {
            self.transport.unsubscribe(handler_id);
            context.close();
            return Err(e);
        }

        self.active_calls.fetch_add(1, Ordering::Relaxed);

        {
            let mut tasks = self.tasks.lock().unwrap();
            // Reap finished call tasks
            while tasks.try_join_next().is_some() {}

            tasks.spawn({
                let context = context.clone();
                let codec = codec.clone();
                let transport = self.transport.clone();
                let active_calls = self.active_calls.clone();

                async move {
                    let pumps = pump::run(context.clone(), transport.clone());
                    let drive = async {
                        drive_call(&context, &codec, &transport, inbox_rx, done_tx).await;
                        // Let the pump supervisor drain and exit
                        context.close_outbound();
                    };

                    futures::join!(pumps, drive);

                    context.close();
                    transport.unsubscribe(handler_id);
                    active_calls.fetch_sub(1, Ordering::Relaxed);

                    debug!("Call {} torn down", context.call_id());
                }
            });
        }

        match done_rx.await {
            Ok(result) => result,
            // The call task died without completing the scalar
            Err(_) => Err(crate::Error::TransportClosed),
        }
    }
}

/// Inbound state machine of one call. Runs until the scalar has completed
/// and every incoming stream has terminated or been released
async fn drive_call<R>(
    context: &Arc<StreamContext>,
    codec: &CallCodec,
    transport: &Arc<Transport>,
    mut inbox: mpsc::UnboundedReceiver<Message>,
    done: oneshot::Sender<crate::Result<R>>,
) where
    R: DeserializeOwned + Send + 'static,
{
    let call_id = context.call_id().to_owned();
    let mut done = Some(done);
    let mut transport_closed = transport.wait_closed().boxed().fuse();

    let Some(mut wake) = context.take_wake_queue() else {
        return;
    };

    let failure = loop {
        if done.is_none() && context.incoming_idle() {
            break None;
        }

        select! {
            message = inbox.next() => match message {
                Some(Message::CallSuccess { payload, .. }) => match done.take() {
                    Some(done) => {
                        // Decoding the return value here keeps receive-side
                        // stream registration ordered before any stream
                        // message that follows the result
                        let result = codec.decode::<R>(&payload);
                        let failed = result.is_err();
                        let _ = done.send(result);

                        if failed {
                            break None;
                        }
                    }
                    None => warn!("Duplicate call result for {call_id}"),
                },
                Some(Message::CallException { cause, .. }) => {
                    if let Some(done) = done.take() {
                        let _ = done.send(Err(error::reconstruct(&cause)));
                    }
                    break None;
                }
                Some(Message::StreamMessage { stream_id, payload, .. }) => {
                    context.deliver(&stream_id, payload);
                }
                Some(Message::StreamFinished { stream_id, .. }) => context.finish(&stream_id),
                Some(Message::StreamCancel { stream_id, cause, .. }) => {
                    context.cancel(&stream_id, cause);
                }
                Some(Message::CallData { .. }) => {
                    warn!("Protocol violation: CallData addressed at client call {call_id}");
                    break Some(crate::Error::Protocol(format!(
                        "unexpected CallData for call {call_id}"
                    )));
                }
                None => break Some(crate::Error::TransportClosed),
            },
            _ = wake.next() => {},
            _ = transport_closed => break Some(crate::Error::TransportClosed),
        }
    };

    if let Some(done) = done.take() {
        let _ = done.send(Err(failure.unwrap_or(crate::Error::Cancelled)));
    }
}
