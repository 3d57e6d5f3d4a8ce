use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::channel::mpsc::UnboundedReceiver;
use futures::stream::BoxStream;
use futures::{future, stream, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::broadcast::{Broadcast, Subscriber, SubscriberItem};
use crate::codec::{self, CallCodec};
use crate::error;
use crate::message::SerializedException;

/// Item flowing through an incoming stream's channel. Elements stay in their
/// encoded form until the typed endpoint decodes them at collection time
pub(crate) enum StreamEvent {
    Item(String),
    End,
    Cancel(SerializedException),
}

/// Cold stream embedded in call arguments, return values, or other streams.
///
/// On the sending side it wraps a local producer; serializing it registers
/// the producer with the call's stream context and writes only the assigned
/// stream id. On the receiving side it is materialized from that id and
/// implements [Stream], draining elements as the peer pumps them.
///
/// Single-consumer: collection drains the underlying channel, and a second
/// collection continues from wherever the first stopped
pub struct RpcStream<T> {
    slot: Mutex<ColdSlot<T>>,
}

enum ColdSlot<T> {
    Producer(BoxStream<'static, crate::Result<T>>),
    Incoming {
        stream_id: String,
        events: UnboundedReceiver<StreamEvent>,
        codec: CallCodec,
        done: bool,
    },
    Taken,
}

impl<T: Send + 'static> RpcStream<T> {
    /// Wrap a local producer for sending
    pub fn cold<S>(stream: S) -> Self
    where
        S: Stream<Item = crate::Result<T>> + Send + 'static,
    {
        Self {
            slot: Mutex::new(ColdSlot::Producer(stream.boxed())),
        }
    }

    /// Finite stream over a collection of values
    pub fn from_values<I>(values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::cold(stream::iter(values).map(Ok))
    }

    fn take_producer(&self) -> crate::Result<BoxStream<'static, crate::Result<T>>> {
        let mut slot = self.slot.lock().unwrap();

        match std::mem::replace(&mut *slot, ColdSlot::Taken) {
            ColdSlot::Producer(producer) => Ok(producer),
            other => {
                *slot = other;
                Err(crate::Error::Protocol(
                    "stream endpoint cannot be sent: it is not a local producer".into(),
                ))
            }
        }
    }
}

impl<T> Stream for RpcStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Item = crate::Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let slot = this.slot.get_mut().unwrap();

        match slot {
            ColdSlot::Producer(producer) => producer.as_mut().poll_next(cx),
            ColdSlot::Incoming {
                events,
                codec,
                done,
                ..
            } => {
                if *done {
                    return Poll::Ready(None);
                }

                match Pin::new(events).poll_next(cx) {
                    Poll::Ready(Some(StreamEvent::Item(payload))) => {
                        match codec.decode::<T>(&payload) {
                            Ok(value) => Poll::Ready(Some(Ok(value))),
                            Err(e) => {
                                *done = true;
                                Poll::Ready(Some(Err(e)))
                            }
                        }
                    }
                    Poll::Ready(Some(StreamEvent::End)) | Poll::Ready(None) => {
                        *done = true;
                        Poll::Ready(None)
                    }
                    Poll::Ready(Some(StreamEvent::Cancel(cause))) => {
                        *done = true;
                        Poll::Ready(Some(Err(error::reconstruct(&cause))))
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            ColdSlot::Taken => Poll::Ready(None),
        }
    }
}

impl<T> Drop for RpcStream<T> {
    fn drop(&mut self) {
        if let Ok(slot) = self.slot.get_mut() {
            if let ColdSlot::Incoming {
                stream_id,
                codec,
                done,
                ..
            } = slot
            {
                if !*done {
                    codec.context().release_incoming(stream_id);
                }
            }
        }
    }
}

impl<T> Serialize for RpcStream<T>
where
    T: Serialize + Send + 'static,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let producer = self.take_producer().map_err(serde::ser::Error::custom)?;
        let stream_id = register_producer(producer).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&stream_id)
    }
}

impl<'de, T> Deserialize<'de> for RpcStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stream_id = String::deserialize(deserializer)?;
        let codec = ambient_codec::<D>()?;
        let events = codec
            .context()
            .claim_incoming(&stream_id)
            .map_err(serde::de::Error::custom)?;

        Ok(Self {
            slot: Mutex::new(ColdSlot::Incoming {
                stream_id,
                events,
                codec,
                done: false,
            }),
        })
    }
}

/// Hot multi-subscriber stream. The receiving side fans elements out to any
/// number of [Subscription]s with the buffer/replay/overflow behavior of the
/// engine's flow configuration
pub struct SharedStream<T> {
    slot: Mutex<HotSlot<T>>,
}

/// Hot stream with a conflated current value. New subscribers always observe
/// the latest value first; [StateStream::value] reads it without subscribing
pub struct StateStream<T> {
    slot: Mutex<HotSlot<T>>,
}

enum HotSlot<T> {
    Producer(BoxStream<'static, crate::Result<T>>),
    Incoming {
        sink: Arc<Broadcast>,
        codec: CallCodec,
    },
    Taken,
}

impl<T> HotSlot<T> {
    fn take_producer(slot: &Mutex<Self>) -> crate::Result<BoxStream<'static, crate::Result<T>>> {
        let mut slot = slot.lock().unwrap();

        match std::mem::replace(&mut *slot, HotSlot::Taken) {
            HotSlot::Producer(producer) => Ok(producer),
            other => {
                *slot = other;
                Err(crate::Error::Protocol(
                    "stream endpoint cannot be sent: it is not a local producer".into(),
                ))
            }
        }
    }

    fn subscribe(slot: &Mutex<Self>) -> crate::Result<Subscription<T>> {
        match &*slot.lock().unwrap() {
            HotSlot::Incoming { sink, codec } => {
                Ok(Subscription::new(sink.subscribe(), codec.clone()))
            }
            _ => Err(crate::Error::Protocol(
                "subscription is only available on a received stream".into(),
            )),
        }
    }
}

impl<T: Send + 'static> SharedStream<T> {
    /// Wrap a local producer for sending
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = crate::Result<T>> + Send + 'static,
    {
        Self {
            slot: Mutex::new(HotSlot::Producer(stream.boxed())),
        }
    }

    /// Independent subscription to a received stream
    pub fn subscribe(&self) -> crate::Result<Subscription<T>> {
        HotSlot::subscribe(&self.slot)
    }
}

impl<T: Send + 'static> StateStream<T> {
    /// Wrap a local state for sending: the current value followed by updates
    pub fn new<S>(initial: T, updates: S) -> Self
    where
        S: Stream<Item = crate::Result<T>> + Send + 'static,
    {
        let producer = stream::once(future::ready(Ok(initial))).chain(updates);

        Self {
            slot: Mutex::new(HotSlot::Producer(producer.boxed())),
        }
    }

    /// Independent subscription to a received stream; yields the current
    /// value first
    pub fn subscribe(&self) -> crate::Result<Subscription<T>> {
        HotSlot::subscribe(&self.slot)
    }

    /// Current value of a received state stream, `None` before the first
    /// element arrived
    pub fn value(&self) -> crate::Result<Option<T>>
    where
        T: DeserializeOwned,
    {
        match &*self.slot.lock().unwrap() {
            HotSlot::Incoming { sink, codec } => match sink.latest() {
                Some(element) => codec.decode(&element).map(Some),
                None => Ok(None),
            },
            _ => Err(crate::Error::Protocol(
                "state value is only available on a received stream".into(),
            )),
        }
    }
}

impl<T> Serialize for SharedStream<T>
where
    T: Serialize + Send + 'static,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let producer = HotSlot::take_producer(&self.slot).map_err(serde::ser::Error::custom)?;
        let stream_id = register_producer(producer).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&stream_id)
    }
}

impl<T> Serialize for StateStream<T>
where
    T: Serialize + Send + 'static,
{
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let producer = HotSlot::take_producer(&self.slot).map_err(serde::ser::Error::custom)?;
        let stream_id = register_producer(producer).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&stream_id)
    }
}

impl<'de, T> Deserialize<'de> for SharedStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stream_id = String::deserialize(deserializer)?;
        let codec = ambient_codec::<D>()?;
        let sink = codec
            .context()
            .prepare_incoming_hot(&stream_id, false)
            .map_err(serde::de::Error::custom)?;

        Ok(Self {
            slot: Mutex::new(HotSlot::Incoming { sink, codec }),
        })
    }
}

impl<'de, T> Deserialize<'de> for StateStream<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stream_id = String::deserialize(deserializer)?;
        let codec = ambient_codec::<D>()?;
        let sink = codec
            .context()
            .prepare_incoming_hot(&stream_id, true)
            .map_err(serde::de::Error::custom)?;

        Ok(Self {
            slot: Mutex::new(HotSlot::Incoming { sink, codec }),
        })
    }
}

/// One subscriber's view of a hot stream
pub struct Subscription<T> {
    subscriber: Subscriber,
    codec: CallCodec,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Subscription<T> {
    fn new(subscriber: Subscriber, codec: CallCodec) -> Self {
        Self {
            subscriber,
            codec,
            done: false,
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Stream for Subscription<T> {
    type Item = crate::Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.done {
            return Poll::Ready(None);
        }

        match this.subscriber.poll_item(cx) {
            Poll::Ready(Some(SubscriberItem::Element(element))) => {
                match this.codec.decode::<T>(&element) {
                    Ok(value) => Poll::Ready(Some(Ok(value))),
                    Err(e) => {
                        this.done = true;
                        Poll::Ready(Some(Err(e)))
                    }
                }
            }
            Poll::Ready(Some(SubscriberItem::Cancelled(cause))) => {
                this.done = true;
                Poll::Ready(Some(Err(error::reconstruct(&cause))))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.subscriber.detach();
    }
}

/// Register a local producer with the ambient call's stream context,
/// returning the assigned stream id. Elements encode lazily when the pump
/// polls them, under the same codec, so streams nest to arbitrary depth
fn register_producer<T>(producer: BoxStream<'static, crate::Result<T>>) -> crate::Result<String>
where
    T: Serialize + Send + 'static,
{
    let codec = codec::current_codec().ok_or_else(|| {
        crate::Error::Protocol("stream value serialized outside of a call codec".into())
    })?;

    let element_codec = codec.clone();
    let elements = producer
        .map(move |item| item.and_then(|value| element_codec.encode(&value)))
        .boxed();

    codec.context().register_outgoing(elements)
}

fn ambient_codec<'de, D: Deserializer<'de>>() -> Result<CallCodec, D::Error> {
    codec::current_codec().ok_or_else(|| {
        serde::de::Error::custom("stream id decoded outside of a call codec")
    })
}
