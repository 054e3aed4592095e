//! A resolved, bound operation invocation.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::service::{OperationSpec, ServiceDescriptor};

/// A value bound to one declared parameter slot.
#[derive(Debug, Clone)]
pub enum Argument {
    /// The request bean, populated from KVP and/or the XML body.
    Bean(Value),
    /// The raw incoming body bytes.
    RawBody(Bytes),
    /// The request header snapshot.
    HttpHeaders(Vec<(String, String)>),
}

impl Argument {
    pub fn as_bean(&self) -> Option<&Value> {
        match self {
            Argument::Bean(value) => Some(value),
            _ => None,
        }
    }
}

/// One in-flight invocation: the canonical operation name, the service it
/// belongs to, the operation spec and the bound arguments. Immutable once
/// constructed.
#[derive(Clone)]
pub struct Operation {
    pub name: String,
    pub descriptor: Arc<ServiceDescriptor>,
    pub spec: Arc<OperationSpec>,
    pub args: Vec<Argument>,
}

impl Operation {
    pub fn new(
        name: impl Into<String>,
        descriptor: Arc<ServiceDescriptor>,
        spec: Arc<OperationSpec>,
        args: Vec<Argument>,
    ) -> Self {
        Self {
            name: name.into(),
            descriptor,
            spec,
            args,
        }
    }

    /// The request bean, when the operation declares one.
    pub fn bean(&self) -> Option<&Value> {
        self.args.iter().find_map(Argument::as_bean)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("service", &self.descriptor.id)
            .field("version", &self.descriptor.version)
            .finish()
    }
}
