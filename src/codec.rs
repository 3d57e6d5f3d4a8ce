use std::cell::RefCell;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::SerializerExtension;
use crate::stream_context::StreamContext;

thread_local! {
    static CODEC_SCOPE: RefCell<Vec<CallCodec>> = const { RefCell::new(Vec::new()) };
}

/// Per-call codec.
///
/// Encoding and decoding run with this codec installed as the ambient scope
/// on the current thread, which is how stream-typed slots inside payloads
/// resolve to the call's [StreamContext]: serializing a stream registers it
/// and writes its id, deserializing an id materializes the receive endpoint.
/// serde_json is fully synchronous, so the scope never leaks across awaits
#[derive(Clone)]
pub struct CallCodec {
    context: Arc<StreamContext>,
    extension: Option<Arc<dyn SerializerExtension>>,
}

impl CallCodec {
    pub(crate) fn new(
        context: Arc<StreamContext>,
        extension: Option<Arc<dyn SerializerExtension>>,
    ) -> Self {
        Self { context, extension }
    }

    /// The stream context this codec binds stream slots to
    pub fn context(&self) -> &Arc<StreamContext> {
        &self.context
    }

    /// Encode a value to its wire payload, registering any stream values it
    /// contains with the call's stream context
    pub fn encode<T: Serialize>(&self, value: &T) -> crate::Result<String> {
        let _scope = ScopeGuard::enter(self.clone());

        match &self.extension {
            None => serde_json::to_string(value).map_err(|e| crate::Error::Encode(e.to_string())),
            Some(extension) => {
                let plain =
                    serde_json::to_value(value).map_err(|e| crate::Error::Encode(e.to_string()))?;
                serde_json::to_string(&extension.on_encode(plain))
                    .map_err(|e| crate::Error::Encode(e.to_string()))
            }
        }
    }

    /// Decode a wire payload, materializing receive endpoints for any stream
    /// ids it contains
    pub fn decode<T: DeserializeOwned>(&self, payload: &str) -> crate::Result<T> {
        let _scope = ScopeGuard::enter(self.clone());

        match &self.extension {
            None => serde_json::from_str(payload).map_err(|e| crate::Error::Decode(e.to_string())),
            Some(extension) => {
                let plain: serde_json::Value = serde_json::from_str(payload)
                    .map_err(|e| crate::Error::Decode(e.to_string()))?;
                serde_json::from_value(extension.on_decode(plain))
                    .map_err(|e| crate::Error::Decode(e.to_string()))
            }
        }
    }
}

/// Codec currently scoped on this thread, if encode/decode is in progress
pub(crate) fn current_codec() -> Option<CallCodec> {
    CODEC_SCOPE.with(|scope| scope.borrow().last().cloned())
}

struct ScopeGuard;

impl ScopeGuard {
    fn enter(codec: CallCodec) -> Self {
        CODEC_SCOPE.with(|scope| scope.borrow_mut().push(codec));
        ScopeGuard
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        CODEC_SCOPE.with(|scope| {
            scope.borrow_mut().pop();
        });
    }
}
