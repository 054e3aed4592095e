//! # OWS Dispatch Core
//!
//! A pure, transport-agnostic implementation of the OGC web-service (OWS)
//! request model. This crate provides the core types and negotiation logic for
//! classifying an exchange by service, version and operation without any
//! transport-specific code.
//!
//! ## Features
//! - Three-component version model with OWS negotiation rules
//! - Case-insensitive KVP normalization and typed parameter parsing
//! - Service/operation registries validated eagerly at construction
//! - Tag-based response encoder selection with detectable ambiguity
//! - Exception taxonomy with version-specific fault document encoders

pub mod callback;
pub mod error;
pub mod fault;
pub mod kvp;
pub mod operation;
pub mod output;
pub mod reader;
pub mod request;
pub mod response;
pub mod service;
pub mod version;

// Re-export main types
pub use callback::{CallbackChain, DispatcherCallback, RequestLoggingCallback};
pub use error::{BoxError, FaultKind, OwsError, ServiceException};
pub use fault::{
    ExceptionHandler, ExceptionHandlerRegistry, FaultDocument, LegacyExceptionHandler,
    OwsExceptionHandler,
};
pub use kvp::{KvpParser, KvpParserRegistry};
pub use operation::{Argument, Operation};
pub use output::{BufferedOutput, OutputStrategy, VecOutput};
pub use reader::{
    DefaultKvpReader, KvpReaderRegistry, KvpRequestReader, XmlReaderRegistry, XmlRequestReader,
    bind_parameters,
};
pub use request::{RequestContext, XmlBody, XmlRoot};
pub use response::{
    BoxedResult, ContentDisposition, OperationResult, ResponseEncoder, ResponseEncoderRegistry,
};
pub use service::{
    FunctionOperation, OperationHandler, OperationSpec, OwsService, ParamSlot, ServiceDescriptor,
    ServiceRegistry, SimpleService, resolve_operation,
};
pub use version::{Version, negotiate, negotiate_ordered};

/// Result type for OWS dispatch operations
pub type OwsResult<T> = std::result::Result<T, OwsError>;

/// SOAP 1.2 envelope namespace
pub const SOAP_NAMESPACE: &str = "http://www.w3.org/2003/05/soap-envelope";

/// SOAP 1.2 media type
pub const SOAP_MIME: &str = "application/soap+xml";

/// Reserved KVP keys consumed by the dispatcher itself
pub mod reserved {
    pub const SERVICE: &str = "service";
    pub const VERSION: &str = "version";
    pub const REQUEST: &str = "request";
    pub const OUTPUT_FORMAT: &str = "outputformat";
    pub const NAMESPACE: &str = "namespace";
    pub const FILENAME: &str = "filename";
    pub const CONTENT_DISPOSITION: &str = "content-disposition";
}
