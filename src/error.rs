use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::message::SerializedException;

#[derive(Debug, Error, Clone)]
pub enum Error {
    /// The message channel to the peer is gone. Tears down the engine
    #[error("Transport is closed")]
    TransportClosed,
    /// Unexpected message kind or malformed traffic. Cancels the affected
    /// call, never the engine
    #[error("Protocol violation: {0}")]
    Protocol(String),
    /// No provider registered for the requested service
    #[error("No provider registered for service `{0}`")]
    ServiceNotFound(String),
    /// The service has no such method or field
    #[error("No callable `{0}` on the requested service")]
    NoCallable(String),
    /// Failed to encode a payload or stream element
    #[error("Failed to encode payload: {0}")]
    Encode(String),
    /// Failed to decode a payload or stream element
    #[error("Failed to decode payload: {0}")]
    Decode(String),
    /// Typed application exception raised by a service implementation
    #[error("{0}")]
    Raised(RaisedException),
    /// Exception received from the peer
    #[error("{0}")]
    Remote(RemoteException),
    /// Cooperative cancellation of the local scope
    #[error("Call cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Application exception with an explicit class name, e.g.
    /// `Error::raised("IllegalArgument", "me")`
    pub fn raised(class_name: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Raised(RaisedException {
            class_name: class_name.into(),
            message: message.into(),
            cause: None,
        })
    }

    /// Class name used on the wire for this error
    pub fn class_name(&self) -> &str {
        match self {
            Error::TransportClosed => "TransportException",
            Error::Protocol(_) => "ProtocolException",
            Error::ServiceNotFound(_) => "ServiceNotFoundException",
            Error::NoCallable(_) => "NoSuchCallableException",
            Error::Encode(_) | Error::Decode(_) => "SerializationException",
            Error::Raised(raised) => &raised.class_name,
            Error::Remote(remote) => &remote.class_name,
            Error::Cancelled => "CancellationException",
        }
    }
}

/// Application exception thrown by a service implementation
#[derive(Debug, Clone)]
pub struct RaisedException {
    pub class_name: String,
    pub message: String,
    pub cause: Option<Box<Error>>,
}

impl fmt::Display for RaisedException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class_name, self.message)
    }
}

/// Exception reconstructed from a peer's [SerializedException] when no typed
/// factory is registered for its class. Displays as the peer's string
/// representation
#[derive(Debug, Clone)]
pub struct RemoteException {
    pub class_name: String,
    pub message: String,
    pub to_string_repr: String,
    pub cause: Option<Box<RemoteException>>,
}

impl fmt::Display for RemoteException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_repr)
    }
}

impl From<&SerializedException> for RemoteException {
    fn from(cause: &SerializedException) -> Self {
        RemoteException {
            class_name: cause.class_name.clone(),
            message: cause.message.clone(),
            to_string_repr: cause.to_string_repr.clone(),
            cause: cause
                .cause
                .as_deref()
                .map(|nested| Box::new(RemoteException::from(nested))),
        }
    }
}

impl From<&Error> for SerializedException {
    fn from(error: &Error) -> Self {
        let (message, cause) = match error {
            Error::Raised(raised) => (
                raised.message.clone(),
                raised
                    .cause
                    .as_deref()
                    .map(|nested| Box::new(SerializedException::from(nested))),
            ),
            Error::Remote(remote) => (
                remote.message.clone(),
                remote.cause.as_deref().map(|nested| Box::new(remote_cause(nested))),
            ),
            other => (other.to_string(), None),
        };

        SerializedException {
            to_string_repr: error.to_string(),
            message,
            class_name: error.class_name().to_owned(),
            stacktrace: Vec::new(),
            cause,
        }
    }
}

fn remote_cause(remote: &RemoteException) -> SerializedException {
    SerializedException {
        to_string_repr: remote.to_string_repr.clone(),
        message: remote.message.clone(),
        class_name: remote.class_name.clone(),
        stacktrace: Vec::new(),
        cause: remote.cause.as_deref().map(|nested| Box::new(remote_cause(nested))),
    }
}

/// Builds a typed error from a wire cause with a known class name
pub type ExceptionFactory = fn(&SerializedException) -> Error;

static EXCEPTION_FACTORIES: Lazy<RwLock<HashMap<String, ExceptionFactory>>> =
    Lazy::new(Default::default);

/// Register a factory reconstructing a typed error for a class name.
/// Called by generated code at module init
pub fn register_exception(class_name: &str, factory: ExceptionFactory) {
    EXCEPTION_FACTORIES
        .write()
        .unwrap()
        .insert(class_name.to_owned(), factory);
}

/// Reconstruct a native error from a wire cause: a registered factory for the
/// class name wins, otherwise a generic [RemoteException] keeps the peer's
/// string representation. The cause chain is preserved recursively
pub fn reconstruct(cause: &SerializedException) -> Error {
    match EXCEPTION_FACTORIES.read().unwrap().get(&cause.class_name) {
        Some(factory) => factory(cause),
        None => Error::Remote(RemoteException::from(cause)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raised_round_trip() {
        let error = Error::raised("IllegalArgument", "me");
        let cause = SerializedException::from(&error);

        assert_eq!(cause.class_name, "IllegalArgument");
        assert_eq!(cause.message, "me");
        assert_eq!(cause.to_string_repr, "IllegalArgument: me");

        match reconstruct(&cause) {
            Error::Remote(remote) => {
                assert_eq!(remote.class_name, "IllegalArgument");
                assert_eq!(remote.message, "me");
                assert_eq!(remote.to_string(), "IllegalArgument: me");
            }
            other => panic!("Expected a remote exception, got {other:?}"),
        }
    }

    #[test]
    fn test_registered_factory_reconstructs_typed_error() {
        register_exception("TypedTestFailure", |cause| {
            Error::raised(cause.class_name.clone(), format!("typed: {}", cause.message))
        });

        let cause = SerializedException {
            to_string_repr: "TypedTestFailure: nope".into(),
            message: "nope".into(),
            class_name: "TypedTestFailure".into(),
            stacktrace: Vec::new(),
            cause: None,
        };

        match reconstruct(&cause) {
            Error::Raised(raised) => assert_eq!(raised.message, "typed: nope"),
            other => panic!("Expected the registered factory to run, got {other:?}"),
        }
    }

    #[test]
    fn test_cause_chain_preserved() {
        let inner = Error::raised("Inner", "root cause");
        let error = Error::Raised(RaisedException {
            class_name: "Outer".into(),
            message: "wrapper".into(),
            cause: Some(Box::new(inner)),
        });

        let cause = SerializedException::from(&error);
        let nested = cause.cause.as_deref().unwrap();
        assert_eq!(nested.class_name, "Inner");
        assert_eq!(nested.message, "root cause");
    }
}
