//! Exception taxonomy for the dispatch pipeline.
//!
//! Failures are produced as a tagged union at the point of failure; walking
//! `source()` chains is reserved for adapting opaque errors arriving from
//! collaborator layers (service implementations, I/O).

use std::error::Error as StdError;
use std::fmt;
use std::io;

use thiserror::Error;

/// Boxed opaque error from a collaborator layer
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// A protocol-level service exception, rendered as an OWS fault document.
#[derive(Debug)]
pub struct ServiceException {
    pub message: String,
    /// OGC exception code; `NoApplicableCode` when unset.
    pub code: Option<String>,
    /// The parameter or element the exception relates to.
    pub locator: Option<String>,
    /// Additional text lines carried into the fault document.
    pub texts: Vec<String>,
    pub source: Option<BoxError>,
}

impl ServiceException {
    pub const MISSING_PARAMETER_VALUE: &'static str = "MissingParameterValue";
    pub const INVALID_PARAMETER_VALUE: &'static str = "InvalidParameterValue";
    pub const OPERATION_NOT_SUPPORTED: &'static str = "OperationNotSupported";
    pub const NO_APPLICABLE_CODE: &'static str = "NoApplicableCode";
    pub const VERSION_NEGOTIATION_FAILED: &'static str = "VersionNegotiationFailed";
    pub const INVALID_UPDATE_SEQUENCE: &'static str = "InvalidUpdateSequence";

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            locator: None,
            texts: Vec::new(),
            source: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn with_locator(mut self, locator: impl Into<String>) -> Self {
        self.locator = Some(locator.into());
        self
    }

    pub fn with_text(mut self, line: impl Into<String>) -> Self {
        self.texts.push(line.into());
        self
    }

    pub fn with_source(mut self, source: BoxError) -> Self {
        self.source = Some(source);
        self
    }

    /// A mandatory parameter was not supplied.
    pub fn missing_parameter(name: &str) -> Self {
        Self::new(format!("Could not determine {}", name))
            .with_code(Self::MISSING_PARAMETER_VALUE)
            .with_locator(name)
    }

    /// A supplied parameter value was not usable.
    pub fn invalid_parameter(name: &str, message: impl Into<String>) -> Self {
        Self::new(message)
            .with_code(Self::INVALID_PARAMETER_VALUE)
            .with_locator(name)
    }

    pub fn operation_not_supported(name: &str) -> Self {
        Self::new(format!("No such operation: {}", name))
            .with_code(Self::OPERATION_NOT_SUPPORTED)
            .with_locator(name)
    }

    pub fn version_negotiation_failed() -> Self {
        Self::new("Version negotiation failed").with_code(Self::VERSION_NEGOTIATION_FAILED)
    }

    /// Copies the reportable fields, leaving the unclonable cause behind.
    pub fn to_reported(&self) -> Self {
        Self {
            message: self.message.clone(),
            code: self.code.clone(),
            locator: self.locator.clone(),
            texts: self.texts.clone(),
            source: None,
        }
    }
}

impl fmt::Display for ServiceException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl StdError for ServiceException {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

/// Errors escaping any stage of the dispatch pipeline.
#[derive(Debug, Error)]
pub enum OwsError {
    /// A protocol fault, reported in-band as a fault document.
    #[error(transparent)]
    Fault(#[from] ServiceException),

    /// Rendered as a bare HTTP status rather than an XML fault body.
    #[error("HTTP {status}")]
    HttpStatus { status: u16, message: Option<String> },

    /// The peer closed the connection; suppressed, never reported.
    #[error("client aborted the connection")]
    ClientAborted,

    /// A security-layer failure; rethrown untouched for the outer layer.
    #[error("security failure: {0}")]
    Security(BoxError),

    /// Ambiguous or missing registrations; fatal at startup or first use.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Opaque failure from a collaborator layer.
    #[error(transparent)]
    Other(BoxError),
}

/// The reportable form of a classified failure.
#[derive(Debug)]
pub enum FaultKind {
    Service(ServiceException),
    Status { status: u16, message: Option<String> },
}

impl OwsError {
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        OwsError::HttpStatus {
            status,
            message: Some(message.into()),
        }
    }

    /// Whether this failure, or anything in its cause chain, signals that the
    /// peer already closed the connection.
    pub fn is_client_abort(&self) -> bool {
        match self {
            OwsError::ClientAborted => true,
            OwsError::Fault(se) => se
                .source
                .as_deref()
                .map(|e| chain_has_abort(e))
                .unwrap_or(false),
            OwsError::Security(e) | OwsError::Other(e) => chain_has_abort(e.as_ref()),
            _ => false,
        }
    }

    /// Surfaces the inner cause of an execution failure, one level deep.
    pub fn unwrap_execution(self) -> OwsError {
        match self {
            OwsError::Other(e) => match e.downcast::<OwsError>() {
                Ok(inner) => *inner,
                Err(e) => match e.downcast::<ServiceException>() {
                    Ok(se) => OwsError::Fault(*se),
                    Err(e) => OwsError::Other(e),
                },
            },
            other => other,
        }
    }

    /// Classifies this failure for fault reporting.
    ///
    /// Walks the cause chain of opaque errors for the first recognized fault
    /// type; synthesizes a generic `ServiceException` when none is found.
    pub fn into_fault(self) -> FaultKind {
        match self {
            OwsError::Fault(se) => FaultKind::Service(se),
            OwsError::HttpStatus { status, message } => FaultKind::Status { status, message },
            OwsError::Configuration(message) => FaultKind::Service(ServiceException::new(message)),
            OwsError::ClientAborted => {
                FaultKind::Service(ServiceException::new("client aborted the connection"))
            }
            OwsError::Security(e) | OwsError::Other(e) => {
                let mut current: Option<&(dyn StdError + 'static)> = Some(e.as_ref());
                while let Some(err) = current {
                    if let Some(se) = err.downcast_ref::<ServiceException>() {
                        return FaultKind::Service(se.to_reported());
                    }
                    if let Some(ows) = err.downcast_ref::<OwsError>() {
                        match ows {
                            OwsError::Fault(se) => return FaultKind::Service(se.to_reported()),
                            OwsError::HttpStatus { status, message } => {
                                return FaultKind::Status {
                                    status: *status,
                                    message: message.clone(),
                                };
                            }
                            _ => {}
                        }
                    }
                    current = err.source();
                }
                let message = e.to_string();
                FaultKind::Service(ServiceException::new(message).with_source(e))
            }
        }
    }
}

fn chain_has_abort(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            ) {
                return true;
            }
        }
        if let Some(OwsError::ClientAborted) = err.downcast_ref::<OwsError>() {
            return true;
        }
        current = err.source();
    }
    false
}

impl From<quick_xml::Error> for OwsError {
    fn from(err: quick_xml::Error) -> Self {
        OwsError::Other(Box::new(err))
    }
}

impl From<quick_xml::events::attributes::AttrError> for OwsError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        OwsError::Other(Box::new(err))
    }
}

impl From<io::Error> for OwsError {
    fn from(err: io::Error) -> Self {
        if matches!(
            err.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
        ) {
            OwsError::ClientAborted
        } else {
            OwsError::Other(Box::new(err))
        }
    }
}

impl From<serde_json::Error> for OwsError {
    fn from(err: serde_json::Error) -> Self {
        OwsError::Other(Box::new(err))
    }
}
