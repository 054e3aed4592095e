//! Per-exchange request state.
//!
//! A [`RequestContext`] is created when the exchange starts, populated
//! incrementally through the negotiation stages, and dropped when the
//! exchange ends. It is owned by exactly one exchange and passed explicitly
//! through every pipeline stage; there is no ambient request state.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value;

use crate::error::OwsError;
use crate::service::ServiceDescriptor;
use crate::version::Version;

/// The root element of a buffered XML request body.
#[derive(Debug, Clone)]
pub struct XmlRoot {
    /// Resolved namespace URI of the root element, if declared.
    pub namespace: Option<String>,
    pub local_name: String,
    /// Root-element attributes, excluding namespace declarations.
    pub attributes: HashMap<String, String>,
}

impl XmlRoot {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// A fully buffered, re-readable XML request body.
#[derive(Debug, Clone)]
pub struct XmlBody {
    /// The raw payload bytes as received (after any SOAP unwrapping).
    pub raw: Bytes,
    /// The decoded document text.
    pub text: String,
    pub root: XmlRoot,
}

/// Value object accumulating the negotiated request coordinates.
#[derive(Default)]
pub struct RequestContext {
    /// Negotiated service id.
    pub service: Option<String>,
    /// Negotiated service version.
    pub version: Option<Version>,
    /// Negotiated operation name.
    pub request: Option<String>,
    pub output_format: Option<String>,
    pub namespace: Option<String>,

    /// Parsed KVP entries, keyed by normalized lower-case key.
    pub kvp: HashMap<String, Value>,
    /// Unparsed KVP entries, keyed by normalized lower-case key.
    pub raw_kvp: HashMap<String, String>,

    /// Buffered XML body, absent for KVP-only exchanges and empty bodies.
    pub body: Option<XmlBody>,

    pub is_get: bool,
    pub is_soap: bool,

    /// The resolved service, once negotiation succeeds.
    pub descriptor: Option<Arc<ServiceDescriptor>>,

    /// First soft parse failure, deferred so faults can be reported in
    /// protocol-correct form after classification.
    pub error: Option<OwsError>,

    /// Request path relative to the dispatch mount point.
    pub path: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a soft failure, keeping only the first one.
    pub fn soft_fail(&mut self, error: OwsError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Case-insensitive header lookup on the snapshot.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Non-empty path segments of the request path.
    pub fn path_segments(&self) -> Vec<&str> {
        self.path
            .split('/')
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Raw KVP value for a normalized key.
    pub fn raw_kvp(&self, key: &str) -> Option<&str> {
        self.raw_kvp.get(key).map(String::as_str)
    }
}
