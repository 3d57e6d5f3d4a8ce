use std::sync::Arc;

/// Overflow policy for hot stream subscriber buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Never drop; the subscriber queue grows with the burst
    Suspend,
    /// Evict the oldest buffered element
    DropOldest,
    /// Skip the new element when the buffer is full
    DropLatest,
}

/// Buffer, replay and overflow behavior of hot streams
#[derive(Debug, Clone)]
pub struct FlowConfig {
    pub shared_buffer: usize,
    pub shared_replay: usize,
    pub on_overflow: Overflow,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            shared_buffer: 0,
            shared_replay: 0,
            on_overflow: Overflow::Suspend,
        }
    }
}

/// Hook to rewrite payload values around the per-call codec
pub trait SerializerExtension: Send + Sync {
    fn on_encode(&self, value: serde_json::Value) -> serde_json::Value {
        value
    }

    fn on_decode(&self, value: serde_json::Value) -> serde_json::Value {
        value
    }
}

/// Client engine configuration
#[derive(Clone, Default)]
pub struct ClientConfig {
    pub flow: FlowConfig,
    pub serializers: Option<Arc<dyn SerializerExtension>>,
}

/// Server engine configuration
#[derive(Clone, Default)]
pub struct ServerConfig {
    pub flow: FlowConfig,
    pub serializers: Option<Arc<dyn SerializerExtension>>,
}
