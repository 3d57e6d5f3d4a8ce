use std::collections::HashMap;
use std::sync::RwLock;

use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::codec::CallCodec;
use crate::message::CallKind;

/// One client-side call, assembled by a generated stub.
///
/// `arg_type` is the static type tag of the arguments carrier; it identifies
/// the callable uniquely and becomes part of the call id
pub struct CallInfo<A> {
    pub service_fqn: &'static str,
    pub callable_name: &'static str,
    pub args: A,
    pub arg_type: &'static str,
    pub call_kind: CallKind,
}

/// Server-side adapter emitted by the code generator.
///
/// `invoke` decodes the arguments carrier under the call's codec (allocating
/// any receive-side streams embedded in it), runs the implementation, and
/// encodes the return value under the same codec
pub trait ServiceDispatcher: Send + Sync {
    fn invoke(
        &self,
        callable_name: &str,
        call_kind: CallKind,
        payload: String,
        codec: CallCodec,
    ) -> BoxFuture<'static, crate::Result<String>>;
}

/// One method or field of a service, as generated code describes it
#[derive(Debug, Clone, Copy)]
pub struct CallableDescriptor {
    pub name: &'static str,
    pub kind: CallKind,
    /// Static serialization-type tag of the return value
    pub return_type: &'static str,
}

/// Generated description of a service's callable surface
#[derive(Debug)]
pub struct ServiceDescriptor {
    pub fqn: &'static str,
    pub callables: &'static [CallableDescriptor],
}

impl ServiceDescriptor {
    pub fn callable(&self, name: &str) -> Option<&CallableDescriptor> {
        self.callables.iter().find(|callable| callable.name == name)
    }

    /// Serialization type of a callable's return value
    pub fn return_type(&self, name: &str) -> Option<&'static str> {
        self.callable(name).map(|callable| callable.return_type)
    }
}

static SERVICES: Lazy<RwLock<HashMap<&'static str, &'static ServiceDescriptor>>> =
    Lazy::new(Default::default);

/// Register a service descriptor. Called by generated code at module init;
/// engines look descriptors up at construction time and fail fast when the
/// service is absent
pub fn register_service(descriptor: &'static ServiceDescriptor) {
    SERVICES.write().unwrap().insert(descriptor.fqn, descriptor);
}

/// Look up a registered service by its fully qualified name
pub fn lookup_service(fqn: &str) -> Option<&'static ServiceDescriptor> {
    SERVICES.read().unwrap().get(fqn).copied()
}

/// Empty arguments carrier for field accessors
#[derive(Serialize, Deserialize, Debug, Default)]
pub struct FieldArgs {}
