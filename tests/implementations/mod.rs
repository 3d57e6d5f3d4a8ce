#![allow(dead_code)]

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};

use flowrpc::client::ClientEngine;
use flowrpc::codec::CallCodec;
use flowrpc::config::{ClientConfig, ServerConfig};
use flowrpc::message::CallKind;
use flowrpc::server::ServerEngine;
use flowrpc::service::{
    lookup_service, register_service, CallInfo, CallableDescriptor, FieldArgs, ServiceDescriptor,
    ServiceDispatcher,
};
use flowrpc::stream::{RpcStream, SharedStream, StateStream};
use flowrpc::transport::Transport;

pub const SERVICE_FQN: &str = "flowrpc.test.EchoService";

pub static ECHO_SERVICE: ServiceDescriptor = ServiceDescriptor {
    fqn: SERVICE_FQN,
    callables: &[
        CallableDescriptor {
            name: "simpleWithParams",
            kind: CallKind::Method,
            return_type: "String",
        },
        CallableDescriptor {
            name: "incomingStreamSyncCollect",
            kind: CallKind::Method,
            return_type: "i32",
        },
        CallableDescriptor {
            name: "bidirectionalStream",
            kind: CallKind::Method,
            return_type: "RpcStream<String>",
        },
        CallableDescriptor {
            name: "streamInDataClass",
            kind: CallKind::Method,
            return_type: "i32",
        },
        CallableDescriptor {
            name: "throwsIllegalArgument",
            kind: CallKind::Method,
            return_type: "Unit",
        },
        CallableDescriptor {
            name: "delayForever",
            kind: CallKind::Method,
            return_type: "RpcStream<String>",
        },
        CallableDescriptor {
            name: "slowEcho",
            kind: CallKind::Method,
            return_type: "String",
        },
        CallableDescriptor {
            name: "sharedFeed",
            kind: CallKind::Method,
            return_type: "SharedStream<String>",
        },
        CallableDescriptor {
            name: "failingFeed",
            kind: CallKind::Method,
            return_type: "SharedStream<String>",
        },
        CallableDescriptor {
            name: "counterState",
            kind: CallKind::Field,
            return_type: "StateStream<i32>",
        },
        CallableDescriptor {
            name: "numberStream",
            kind: CallKind::Method,
            return_type: "RpcStream<i32>",
        },
        CallableDescriptor {
            name: "numberBatches",
            kind: CallKind::Method,
            return_type: "RpcStream<Vec<i32>>",
        },
    ],
};

#[derive(Serialize, Deserialize)]
pub struct SimpleWithParamsArgs {
    pub name: String,
}

#[derive(Serialize, Deserialize)]
pub struct IncomingStreamArgs {
    pub values: RpcStream<String>,
}

#[derive(Serialize, Deserialize)]
pub struct BidirectionalStreamArgs {
    pub values: RpcStream<String>,
}

#[derive(Serialize, Deserialize)]
pub struct PayloadData {
    pub values: RpcStream<String>,
}

#[derive(Serialize, Deserialize)]
pub struct StreamInDataClassArgs {
    pub payload: PayloadData,
}

#[derive(Serialize, Deserialize)]
pub struct ThrowsIllegalArgumentArgs {
    pub message: String,
}

#[derive(Serialize, Deserialize)]
pub struct SlowEchoArgs {
    pub name: String,
    pub delay_ms: u64,
}

#[derive(Serialize, Deserialize)]
pub struct SharedFeedArgs {
    pub values: Vec<String>,
}

#[derive(Serialize, Deserialize)]
pub struct NumberStreamArgs {
    pub count: i32,
}

#[derive(Serialize, Deserialize)]
pub struct NumberBatchesArgs {
    pub count: i32,
    pub batch: usize,
}

/// Server adapter, written the way generated code dispatches by callable
/// name
pub struct EchoDispatcher;

impl ServiceDispatcher for EchoDispatcher {
    fn invoke(
        &self,
        callable_name: &str,
        _call_kind: CallKind,
        payload: String,
        codec: CallCodec,
    ) -> BoxFuture<'static, flowrpc::Result<String>> {
        let callable_name = callable_name.to_owned();

        async move {
            match callable_name.as_str() {
                "simpleWithParams" => {
                    let args: SimpleWithParamsArgs = codec.decode(&payload)?;
                    codec.encode(&args.name.chars().rev().collect::<String>())
                }
                "incomingStreamSyncCollect" => {
                    let args: IncomingStreamArgs = codec.decode(&payload)?;

                    let mut values = args.values;
                    let mut count = 0i32;
                    while let Some(value) = values.next().await {
                        value?;
                        count += 1;
                    }

                    codec.encode(&count)
                }
                "bidirectionalStream" => {
                    let args: BidirectionalStreamArgs = codec.decode(&payload)?;

                    let reversed = args
                        .values
                        .map(|value| value.map(|s| s.chars().rev().collect::<String>()));

                    codec.encode(&RpcStream::cold(reversed))
                }
                "streamInDataClass" => {
                    let args: StreamInDataClassArgs = codec.decode(&payload)?;

                    let mut values = args.payload.values;
                    let mut total = 0i32;
                    while let Some(value) = values.next().await {
                        total += value?.len() as i32;
                    }

                    codec.encode(&total)
                }
                "throwsIllegalArgument" => {
                    let args: ThrowsIllegalArgumentArgs = codec.decode(&payload)?;
                    Err(flowrpc::Error::raised("IllegalArgument", args.message))
                }
                "delayForever" => {
                    let _args: FieldArgs = codec.decode(&payload)?;

                    let stream = futures::stream::once(futures::future::ready(Ok(
                        "first".to_string()
                    )))
                    .chain(futures::stream::pending());

                    codec.encode(&RpcStream::cold(stream))
                }
                "slowEcho" => {
                    let args: SlowEchoArgs = codec.decode(&payload)?;
                    sleep(Duration::from_millis(args.delay_ms)).await;
                    codec.encode(&args.name)
                }
                "sharedFeed" => {
                    let args: SharedFeedArgs = codec.decode(&payload)?;
                    codec.encode(&SharedStream::new(
                        futures::stream::iter(args.values).map(Ok),
                    ))
                }
                "failingFeed" => {
                    let _args: FieldArgs = codec.decode(&payload)?;

                    let feed = futures::stream::iter(vec![
                        Ok("first".to_string()),
                        Err(flowrpc::Error::raised("Boom", "feed blew up")),
                    ]);

                    codec.encode(&SharedStream::new(feed))
                }
                "counterState" => {
                    let _args: FieldArgs = codec.decode(&payload)?;
                    codec.encode(&StateStream::new(
                        0i32,
                        futures::stream::iter(vec![1, 2, 3]).map(Ok),
                    ))
                }
                "numberStream" => {
                    let args: NumberStreamArgs = codec.decode(&payload)?;
                    codec.encode(&RpcStream::cold(
                        futures::stream::iter(1..=args.count).map(Ok),
                    ))
                }
                "numberBatches" => {
                    let args: NumberBatchesArgs = codec.decode(&payload)?;
                    codec.encode(&RpcStream::cold(
                        futures::stream::iter(1..=args.count)
                            .chunks(args.batch)
                            .map(Ok),
                    ))
                }
                _ => Err(flowrpc::Error::NoCallable(callable_name)),
            }
        }
        .boxed()
    }
}

/// Client stub, written the way generated code builds [CallInfo]s
pub struct TestClient {
    engine: Arc<ClientEngine>,
}

impl TestClient {
    pub fn new(engine: Arc<ClientEngine>) -> flowrpc::Result<Self> {
        lookup_service(SERVICE_FQN)
            .ok_or_else(|| flowrpc::Error::ServiceNotFound(SERVICE_FQN.to_owned()))?;

        Ok(Self { engine })
    }

    pub fn engine(&self) -> &ClientEngine {
        &self.engine
    }

    pub async fn simple_with_params(&self, name: &str) -> flowrpc::Result<String> {
        self.engine
            .call(CallInfo {
                service_fqn: SERVICE_FQN,
                callable_name: "simpleWithParams",
                args: SimpleWithParamsArgs {
                    name: name.to_owned(),
                },
                arg_type: "SimpleWithParamsArgs",
                call_kind: CallKind::Method,
            })
            .await
    }

    pub async fn incoming_stream_sync_collect(
        &self,
        values: RpcStream<String>,
    ) -> flowrpc::Result<i32> {
        self.engine
            .call(CallInfo {
                service_fqn: SERVICE_FQN,
                callable_name: "incomingStreamSyncCollect",
                args: IncomingStreamArgs { values },
                arg_type: "IncomingStreamArgs",
                call_kind: CallKind::Method,
            })
            .await
    }

    pub async fn bidirectional_stream(
        &self,
        values: RpcStream<String>,
    ) -> flowrpc::Result<RpcStream<String>> {
        self.engine
            .call(CallInfo {
                service_fqn: SERVICE_FQN,
                callable_name: "bidirectionalStream",
                args: BidirectionalStreamArgs { values },
                arg_type: "BidirectionalStreamArgs",
                call_kind: CallKind::Method,
            })
            .await
    }

    pub async fn stream_in_data_class(&self, payload: PayloadData) -> flowrpc::Result<i32> {
        self.engine
            .call(CallInfo {
                service_fqn: SERVICE_FQN,
                callable_name: "streamInDataClass",
                args: StreamInDataClassArgs { payload },
                arg_type: "StreamInDataClassArgs",
                call_kind: CallKind::Method,
            })
            .await
    }

    pub async fn throws_illegal_argument(&self, message: &str) -> flowrpc::Result<()> {
        self.engine
            .call(CallInfo {
                service_fqn: SERVICE_FQN,
                callable_name: "throwsIllegalArgument",
                args: ThrowsIllegalArgumentArgs {
                    message: message.to_owned(),
                },
                arg_type: "ThrowsIllegalArgumentArgs",
                call_kind: CallKind::Method,
            })
            .await
    }

    pub async fn delay_forever(&self) -> flowrpc::Result<RpcStream<String>> {
        self.engine
            .call(CallInfo {
                service_fqn: SERVICE_FQN,
                callable_name: "delayForever",
                args: FieldArgs {},
                arg_type: "FieldArgs",
                call_kind: CallKind::Method,
            })
            .await
    }

    pub async fn slow_echo(&self, name: &str, delay_ms: u64) -> flowrpc::Result<String> {
        self.engine
            .call(CallInfo {
                service_fqn: SERVICE_FQN,
                callable_name: "slowEcho",
                args: SlowEchoArgs {
                    name: name.to_owned(),
                    delay_ms,
                },
                arg_type: "SlowEchoArgs",
                call_kind: CallKind::Method,
            })
            .await
    }

    pub async fn shared_feed(&self, values: Vec<String>) -> flowrpc::Result<SharedStream<String>> {
        self.engine
            .call(CallInfo {
                service_fqn: SERVICE_FQN,
                callable_name: "sharedFeed",
                args: SharedFeedArgs { values },
                arg_type: "SharedFeedArgs",
                call_kind: CallKind::Method,
            })
            .await
    }

    pub async fn failing_feed(&self) -> flowrpc::Result<SharedStream<String>> {
        self.engine
            .call(CallInfo {
                service_fqn: SERVICE_FQN,
                callable_name: "failingFeed",
                args: FieldArgs {},
                arg_type: "FieldArgs",
                call_kind: CallKind::Method,
            })
            .await
    }

    pub async fn counter_state(&self) -> flowrpc::Result<StateStream<i32>> {
        self.engine
            .call(CallInfo {
                service_fqn: SERVICE_FQN,
                callable_name: "counterState",
                args: FieldArgs {},
                arg_type: "FieldArgs",
                call_kind: CallKind::Field,
            })
            .await
    }

    pub async fn number_stream(&self, count: i32) -> flowrpc::Result<RpcStream<i32>> {
        self.engine
            .call(CallInfo {
                service_fqn: SERVICE_FQN,
                callable_name: "numberStream",
                args: NumberStreamArgs { count },
                arg_type: "NumberStreamArgs",
                call_kind: CallKind::Method,
            })
            .await
    }

    pub async fn number_batches(
        &self,
        count: i32,
        batch: usize,
    ) -> flowrpc::Result<RpcStream<Vec<i32>>> {
        self.engine
            .call(CallInfo {
                service_fqn: SERVICE_FQN,
                callable_name: "numberBatches",
                args: NumberBatchesArgs { count, batch },
                arg_type: "NumberBatchesArgs",
                call_kind: CallKind::Method,
            })
            .await
    }
}

/// A connected client/server pair over an in-process transport
pub struct TestBed {
    pub client: TestClient,
    pub server: Arc<ServerEngine>,
    pub client_transport: Arc<Transport>,
    pub server_transport: Arc<Transport>,
}

pub fn start() -> TestBed {
    start_with_configs(ClientConfig::default(), ServerConfig::default())
}

pub fn start_with_configs(client_config: ClientConfig, server_config: ServerConfig) -> TestBed {
    let _ = pretty_env_logger::formatted_builder()
        .filter_level(log::LevelFilter::Debug)
        .try_init();

    register_service(&ECHO_SERVICE);

    let (client_end, server_end) = Transport::pair("client", "server");

    let server = ServerEngine::start(
        server_end.clone(),
        SERVICE_FQN,
        Arc::new(EchoDispatcher),
        server_config,
    )
    .unwrap();

    let engine = Arc::new(ClientEngine::new(client_end.clone(), client_config));
    let client = TestClient::new(engine).unwrap();

    TestBed {
        client,
        server,
        client_transport: client_end,
        server_transport: server_end,
    }
}
