//! # HTTP OWS Server
//!
//! This crate provides the HTTP transport for OWS service dispatch: transport
//! classification (KVP, XML, SOAP), buffered request bodies with charset
//! detection, the dispatch pipeline itself, and a small hyper-based server
//! loop.
//!
//! ## Features
//! - GET/KVP, POST/XML and SOAP-wrapped request ingestion
//! - Service, version and operation negotiation per the OWS rules
//! - Negotiated response encoding with streaming or buffered bodies
//! - Protocol-correct fault documents, SOAP-wrapped where applicable

pub mod body;
pub mod dispatcher;
pub mod output;
pub mod server;
pub mod soap;

#[cfg(test)]
mod tests;

// Re-export main types
pub use body::buffer_body;
pub use dispatcher::Dispatcher;
pub use output::{ChannelOutput, OwsBody};
pub use server::{OwsServer, OwsServerBuilder, ServerConfig};

// Re-export foundational types
pub use tellus_ows::*;

/// Result type for HTTP server operations
pub type Result<T> = std::result::Result<T, HttpOwsError>;

/// HTTP transport specific errors
#[derive(Debug, thiserror::Error)]
pub enum HttpOwsError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] tellus_ows::OwsError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
