use serde::{Deserialize, Serialize};

/// Wire message exchanged between engines.
///
/// The envelope discriminator (`type`) names each variant; every variant
/// carries the `callId` it belongs to. `payload` fields hold the per-call
/// codec's encoding of the argument object, return value, or stream element.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum Message {
    /// Opens a call
    #[serde(rename_all = "camelCase")]
    CallData {
        call_id: String,
        service_fqn: String,
        callable_name: String,
        payload: String,
        call_kind: CallKind,
    },
    /// Scalar result, terminates the call
    #[serde(rename_all = "camelCase")]
    CallSuccess {
        call_id: String,
        service_fqn: String,
        payload: String,
    },
    /// Call failed, terminates the call
    #[serde(rename_all = "camelCase")]
    CallException {
        call_id: String,
        service_fqn: String,
        cause: SerializedException,
    },
    /// One element on a nested stream
    #[serde(rename_all = "camelCase")]
    StreamMessage {
        call_id: String,
        service_fqn: String,
        stream_id: String,
        payload: String,
    },
    /// Stream producer completed normally
    #[serde(rename_all = "camelCase")]
    StreamFinished {
        call_id: String,
        service_fqn: String,
        stream_id: String,
    },
    /// Stream producer failed
    #[serde(rename_all = "camelCase")]
    StreamCancel {
        call_id: String,
        service_fqn: String,
        stream_id: String,
        cause: SerializedException,
    },
}

impl Message {
    /// Call the message belongs to
    pub fn call_id(&self) -> &str {
        match self {
            Message::CallData { call_id, .. }
            | Message::CallSuccess { call_id, .. }
            | Message::CallException { call_id, .. }
            | Message::StreamMessage { call_id, .. }
            | Message::StreamFinished { call_id, .. }
            | Message::StreamCancel { call_id, .. } => call_id,
        }
    }

    /// Target service fully qualified name
    pub fn service_fqn(&self) -> &str {
        match self {
            Message::CallData { service_fqn, .. }
            | Message::CallSuccess { service_fqn, .. }
            | Message::CallException { service_fqn, .. }
            | Message::StreamMessage { service_fqn, .. }
            | Message::StreamFinished { service_fqn, .. }
            | Message::StreamCancel { service_fqn, .. } => service_fqn,
        }
    }

    /// Stream the message belongs to, if it's stream traffic
    pub fn stream_id(&self) -> Option<&str> {
        match self {
            Message::StreamMessage { stream_id, .. }
            | Message::StreamFinished { stream_id, .. }
            | Message::StreamCancel { stream_id, .. } => Some(stream_id),
            _ => None,
        }
    }
}

/// Whether a call targets a method or a field accessor
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Method,
    Field,
}

/// Wire representation of an exception.
///
/// `class_name` lets the receiver reconstruct a typed error through the
/// exception registry; otherwise a generic remote exception is raised whose
/// display equals `to_string_repr`. Stack frames are best-effort and may be
/// empty.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SerializedException {
    pub to_string_repr: String,
    pub message: String,
    pub class_name: String,
    #[serde(default)]
    pub stacktrace: Vec<StackFrame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<SerializedException>>,
}

/// One best-effort stack frame of a serialized exception
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StackFrame {
    pub class: String,
    pub method: String,
    pub file: String,
    pub line: u32,
}
