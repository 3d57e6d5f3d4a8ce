use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::{select, FutureExt, StreamExt};
use log::{debug, trace, warn};
use tokio::task::JoinSet;

use crate::codec::CallCodec;
use crate::config::ServerConfig;
use crate::message::{CallKind, Message, SerializedException};
use crate::pump;
use crate::service::{self, ServiceDescriptor, ServiceDispatcher};
use crate::stream_context::StreamContext;
use crate::transport::{HandlerId, Transport};

/// Server-side call engine: one RPC service instance bound to a transport.
///
/// Claims inbound `CallData` and stream traffic for its service, invokes the
/// implementation through the generated dispatcher, and streams results back.
/// Dropping the engine cancels the root scope and with it every running call
pub struct ServerEngine {
    service_fqn: String,
    transport: Arc<Transport>,
    handler_id: HandlerId,
    tasks: Mutex<JoinSet<()>>,
}

impl ServerEngine {
    /// Start serving. Fails fast when no provider is registered for the
    /// service
    pub fn start(
        transport: Arc<Transport>,
        service_fqn: &str,
        dispatcher: Arc<dyn ServiceDispatcher>,
        config: ServerConfig,
    ) -> crate::Result<Arc<Self>> {
        let descriptor = service::lookup_service(service_fqn)
            .ok_or_else(|| crate::Error::ServiceNotFound(service_fqn.to_owned()))?;

        debug!("Starting server engine for {service_fqn}");

        let (inbox_tx, inbox_rx) = mpsc::unbounded();
        let claimed_fqn = service_fqn.to_owned();

        let handler_id = transport.subscribe(Box::new(move |message: &Message| {
            if message.service_fqn() != claimed_fqn {
                return false;
            }

            match message {
                // A server receiving a call result would be a protocol
                // violation; leave them for a client sharing this end
                Message::CallSuccess { .. } | Message::CallException { .. } => false,
                _ => {
                    let _ = inbox_tx.unbounded_send(message.clone());
                    true
                }
            }
        }));

        let engine = Arc::new(Self {
            service_fqn: service_fqn.to_owned(),
            transport: transport.clone(),
            handler_id,
            tasks: Mutex::new(JoinSet::new()),
        });

        engine
            .tasks
            .lock()
            .unwrap()
            .spawn(run_server(descriptor, dispatcher, transport, inbox_rx, config));

        Ok(engine)
    }

    /// Service this engine answers for
    pub fn service_fqn(&self) -> &str {
        &self.service_fqn
    }
}

impl Drop for ServerEngine {
    fn drop(&mut self) {
        self.transport.unsubscribe(self.handler_id);
    }
}

struct ActiveCall {
    context: Arc<StreamContext>,
}

/// Main server loop: dispatches `CallData` into call jobs, routes stream
/// traffic to the owning call's context, retires finished calls
async fn run_server(
    descriptor: &'static ServiceDescriptor,
    dispatcher: Arc<dyn ServiceDispatcher>,
    transport: Arc<Transport>,
    mut inbox: UnboundedReceiver<Message>,
    config: ServerConfig,
) {
    let mut calls: HashMap<String, ActiveCall> = HashMap::new();
    let mut retired: HashSet<String> = HashSet::new();
    let mut jobs = JoinSet::new();
    let (retire_tx, mut retire_rx) = mpsc::unbounded::<String>();
    let mut transport_closed = transport.wait_closed().boxed().fuse();

    loop {
        select! {
            message = inbox.next() => match message {
                Some(Message::CallData { call_id, service_fqn, callable_name, payload, call_kind }) => {
                    if calls.contains_key(&call_id) || retired.contains(&call_id) {
                        warn!("Protocol violation: duplicate CallData for {call_id}, dropping");
                        continue;
                    }

                    if descriptor.callable(&callable_name).is_none() {
                        debug!("Unknown callable {callable_name} requested by {call_id}");

                        let cause =
                            SerializedException::from(&crate::Error::NoCallable(callable_name));
                        let _ = transport
                            .send(Message::CallException { call_id, service_fqn, cause })
                            .await;
                        continue;
                    }

                    let context = Arc::new(StreamContext::new(
                        call_id.clone(),
                        service_fqn,
                        config.flow.clone(),
                    ));
                    let codec = CallCodec::new(context.clone(), config.serializers.clone());

                    calls.insert(call_id, ActiveCall { context: context.clone() });

                    while jobs.try_join_next().is_some() {}
                    jobs.spawn(run_call(
                        context,
                        codec,
                        dispatcher.clone(),
                        transport.clone(),
                        callable_name,
                        call_kind,
                        payload,
                        retire_tx.clone(),
                    ));
                }
                Some(Message::StreamMessage { call_id, stream_id, payload, .. }) => {
                    match calls.get(&call_id) {
                        Some(call) => call.context.deliver(&stream_id, payload),
                        None => warn!("Stream message for unknown call {call_id}, dropping"),
                    }
                }
                Some(Message::StreamFinished { call_id, stream_id, .. }) => {
                    match calls.get(&call_id) {
                        Some(call) => call.context.finish(&stream_id),
                        None => warn!("Stream finish for unknown call {call_id}, dropping"),
                    }
                }
                Some(Message::StreamCancel { call_id, stream_id, cause, .. }) => {
                    match calls.get(&call_id) {
                        Some(call) => call.context.cancel(&stream_id, cause),
                        None => warn!("Stream cancel for unknown call {call_id}, dropping"),
                    }
                }
                Some(message) => {
                    warn!("Protocol violation: unexpected {message:?} at server, dropping");
                }
                None => break,
            },
            call_id = retire_rx.next() => {
                if let Some(call_id) = call_id {
                    if let Some(call) = calls.remove(&call_id) {
                        call.context.close();
                    }
                    retired.insert(call_id);
                }
            },
            _ = transport_closed => break,
        }
    }

    debug!("Server engine for {} shutting down", descriptor.fqn);
    for call in calls.values() {
        call.context.close();
    }
}

/// One server call: invoke the implementation, send the scalar result, keep
/// pumping return streams until everything the call owns has terminated
#[allow(clippy::too_many_arguments)]
async fn run_call(
    context: Arc<StreamContext>,
    codec: CallCodec,
    dispatcher: Arc<dyn ServiceDispatcher>,
    transport: Arc<Transport>,
    callable_name: String,
    call_kind: CallKind,
    payload: String,
    retire: UnboundedSender<String>,
) {
    let call_id = context.call_id().to_owned();
    let service_fqn = context.service_fqn().to_owned();

    trace!("Invoking {callable_name} for {call_id}");

    let pumps = pump::run(context.clone(), transport.clone());
    let call = async {
        let result = dispatcher
            .invoke(&callable_name, call_kind, payload, codec.clone())
            .await;

        match result {
            Ok(payload) => {
                let _ = transport
                    .send(Message::CallSuccess {
                        call_id: call_id.clone(),
                        service_fqn: service_fqn.clone(),
                        payload,
                    })
                    .await;
            }
            // Cooperative cancellation of the call; no wire message
            Err(crate::Error::Cancelled) => debug!("Call {call_id} cancelled"),
            Err(e) => {
                debug!("Call {call_id} failed: {e}");

                let _ = transport
                    .send(Message::CallException {
                        call_id: call_id.clone(),
                        service_fqn: service_fqn.clone(),
                        cause: SerializedException::from(&e),
                    })
                    .await;
            }
        }

        // Argument streams may still be collected lazily by return-stream
        // producers; hold the call open until they terminate
        if let Some(mut wake) = context.take_wake_queue() {
            while !context.incoming_idle() {
                if wake.next().await.is_none() {
                    break;
                }
            }
        }

        context.close_outbound();
    };

    futures::join!(pumps, call);

    context.close();
    let _ = retire.unbounded_send(call_id);
}
