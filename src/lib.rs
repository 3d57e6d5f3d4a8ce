/*!
Bidirectional, streaming, schema-aware RPC runtime.

The library multiplexes many concurrent calls over a single ordered,
reliable, bidirectional message transport. Each call carries scalar
arguments, returns a scalar value or an error, and may additionally open
arbitrarily many nested, long-lived data streams flowing in either direction
for the call's lifetime — embedded in arguments, return values, or
recursively inside other streams.

- [client::ClientEngine] assigns call ids, serializes arguments, awaits the
  scalar completion, and drives the call's stream pumps;
- [server::ServerEngine] dispatches incoming calls to a service
  implementation through a generated [service::ServiceDispatcher];
- [stream::RpcStream], [stream::SharedStream] and [stream::StateStream] are
  the stream values embedded in payloads: serializing one writes only its
  stream id, deserializing the id materializes the receive endpoint.

Generated code registers a [service::ServiceDescriptor] per service; engines
look it up at construction time and fail fast when it is absent.

# Examples

Scalar call between two in-process engines:

```no_run
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};

use flowrpc::client::ClientEngine;
use flowrpc::codec::CallCodec;
use flowrpc::message::CallKind;
use flowrpc::server::ServerEngine;
use flowrpc::service::{
    register_service, CallInfo, CallableDescriptor, ServiceDescriptor, ServiceDispatcher,
};
use flowrpc::transport::Transport;

#[derive(Serialize, Deserialize)]
struct EchoArgs {
    name: String,
}

static ECHO_SERVICE: ServiceDescriptor = ServiceDescriptor {
    fqn: "sample.Echo",
    callables: &[CallableDescriptor {
        name: "echo",
        kind: CallKind::Method,
        return_type: "String",
    }],
};

struct EchoDispatcher;

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
                "echo" => {
                    let args: EchoArgs = codec.decode(&payload)?;
                    codec.encode(&args.name)
                }
                _ => Err(flowrpc::Error::NoCallable(callable_name)),
            }
        }
        .boxed()
    }
}

#[tokio::main]
async fn main() -> flowrpc::Result<()> {
    register_service(&ECHO_SERVICE);

    let (client_end, server_end) = Transport::pair("client", "server");
    let _server = ServerEngine::start(
        server_end,
        "sample.Echo",
        Arc::new(EchoDispatcher),
        Default::default(),
    )?;

    let client = ClientEngine::new(client_end, Default::default());
    let reply: String = client
        .call(CallInfo {
            service_fqn: "sample.Echo",
            callable_name: "echo",
            args: EchoArgs {
                name: "hello".into(),
            },
            arg_type: "EchoArgs",
            call_kind: CallKind::Method,
        })
        .await?;

    assert_eq!(reply, "hello");
    Ok(())
}
```

See `tests/` for streaming, cancellation, and hot-stream examples.
*/

mod broadcast;
pub mod client;
pub mod codec;
pub mod config;
mod error;
pub mod message;
pub mod monitor;
mod pump;
pub mod server;
pub mod service;
pub mod stream;
pub mod stream_context;
pub mod transport;

pub use error::{
    reconstruct, register_exception, Error, ExceptionFactory, RaisedException, RemoteException,
    Result,
};
