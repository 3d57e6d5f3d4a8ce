use std::sync::Arc;

use futures::future::BoxFuture;
use futures::lock::Mutex;
use futures::stream::FuturesUnordered;
use futures::{select, FutureExt, StreamExt};
use log::{debug, warn};

use crate::message::{Message, SerializedException};
use crate::stream::StreamEvent;
use crate::stream_context::{HotFeed, OutgoingStream, StreamContext};
use crate::transport::Transport;

enum Work {
    Outgoing(OutgoingStream),
    Hot(HotFeed),
}

/// Drive a call's stream machinery: spawn a pump job per registered outgoing
/// stream and a feeder job per materialized hot endpoint. Runs until the
/// context's queues close and every job has drained
pub(crate) async fn run(context: Arc<StreamContext>, transport: Arc<Transport>) {
    let (Some(outgoing), Some(hot)) = (context.take_outgoing_queue(), context.take_hot_queue())
    else {
        return;
    };

    // Serializes element sends so one call's composite traffic cannot
    // interleave with itself
    let send_lock = Arc::new(Mutex::new(()));

    let mut work =
        futures::stream::select(outgoing.map(Work::Outgoing), hot.map(Work::Hot)).fuse();
    let mut jobs: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();

    loop {
        select! {
            item = work.next() => match item {
                Some(Work::Outgoing(stream)) => jobs.push(
                    pump_stream(stream, context.clone(), transport.clone(), send_lock.clone())
                        .boxed(),
                ),
                Some(Work::Hot(feed)) => jobs.push(feed_hot(feed).boxed()),
                None => break,
            },
            _ = jobs.select_next_some() => {},
        }
    }

    while jobs.next().await.is_some() {}
}

/// Collect one local stream onto the wire: every element as a
/// `StreamMessage`, then exactly one of `StreamFinished` or `StreamCancel`
async fn pump_stream(
    mut stream: OutgoingStream,
    context: Arc<StreamContext>,
    transport: Arc<Transport>,
    send_lock: Arc<Mutex<()>>,
) {
    let call_id = context.call_id().to_owned();
    let service_fqn = context.service_fqn().to_owned();

    loop {
        match stream.elements.next().await {
            Some(Ok(payload)) => {
                let _guard = send_lock.lock().await;
                let message = Message::StreamMessage {
                    call_id: call_id.clone(),
                    service_fqn: service_fqn.clone(),
                    stream_id: stream.stream_id.clone(),
                    payload,
                };

                if transport.send(message).await.is_err() {
                    debug!("Transport closed while pumping stream {}", stream.stream_id);
                    return;
                }
            }
            Some(Err(e)) => {
                warn!("Outgoing stream {} failed: {e}", stream.stream_id);

                let _guard = send_lock.lock().await;
                let _ = transport
                    .send(Message::StreamCancel {
                        call_id: call_id.clone(),
                        service_fqn: service_fqn.clone(),
                        stream_id: stream.stream_id.clone(),
                        cause: SerializedException::from(&e),
                    })
                    .await;
                return;
            }
            None => {
                let _guard = send_lock.lock().await;
                let _ = transport
                    .send(Message::StreamFinished {
                        call_id: call_id.clone(),
                        service_fqn: service_fqn.clone(),
                        stream_id: stream.stream_id.clone(),
                    })
                    .await;
                return;
            }
        }
    }
}

/// Drain a hot receive endpoint's channel into its broadcast sink
async fn feed_hot(mut feed: HotFeed) {
    while let Some(event) = feed.events.next().await {
        match event {
            StreamEvent::Item(element) => feed.sink.publish(element),
            StreamEvent::End => {
                feed.sink.finish(None);
                return;
            }
            StreamEvent::Cancel(cause) => {
                feed.sink.finish(Some(cause));
                return;
            }
        }
    }

    // Channel closed at call teardown without a terminal event
    feed.sink.finish(None);
}
