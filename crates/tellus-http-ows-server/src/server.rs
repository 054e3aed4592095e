//! OWS server configuration, builder and accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use tellus_ows::callback::DispatcherCallback;
use tellus_ows::fault::ExceptionHandler;
use tellus_ows::kvp::KvpParser;
use tellus_ows::reader::{KvpRequestReader, XmlRequestReader};
use tellus_ows::response::ResponseEncoder;
use tellus_ows::service::ServiceDescriptor;
use tellus_ows::{
    CallbackChain, ExceptionHandlerRegistry, KvpParserRegistry, KvpReaderRegistry,
    ResponseEncoderRegistry, ServiceRegistry, XmlReaderRegistry,
};

use crate::dispatcher::Dispatcher;
use crate::output::OwsBody;
use crate::{HttpOwsError, Result};

/// Configuration for the HTTP OWS server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_address: SocketAddr,
    /// Path the dispatch endpoint is mounted on
    pub service_path: String,
    /// Maximum request body size
    pub max_body_size: usize,
    /// Look-ahead window for charset sniffing and root-element detection
    pub xml_lookahead: usize,
    /// CITE-compliance strictness: mandatory parameters are enforced and
    /// context-path inference is disabled
    pub strict: bool,
    /// Append the cause chain to fault documents
    pub verbose_exceptions: bool,
    /// Stream response bodies instead of buffering them
    pub stream_responses: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".parse().unwrap(),
            service_path: "/ows".to_string(),
            max_body_size: 1024 * 1024, // 1MB
            xml_lookahead: 8 * 1024,
            strict: false,
            verbose_exceptions: false,
            stream_responses: false,
        }
    }
}

/// Builder assembling the registries behind a [`Dispatcher`].
///
/// All registrations happen here, before startup; the built registries are
/// immutable snapshots shared by every exchange. Duplicate service
/// descriptors fail `build()`, not the first dispatch.
pub struct OwsServerBuilder {
    config: ServerConfig,
    services: Vec<Arc<ServiceDescriptor>>,
    kvp_parsers: Vec<Arc<dyn KvpParser>>,
    kvp_readers: Vec<Arc<dyn KvpRequestReader>>,
    xml_readers: Vec<Arc<dyn XmlRequestReader>>,
    encoders: Vec<Arc<dyn ResponseEncoder>>,
    callbacks: Vec<Arc<dyn DispatcherCallback>>,
    exception_handlers: Vec<Arc<dyn ExceptionHandler>>,
}

impl OwsServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            services: Vec::new(),
            kvp_parsers: Vec::new(),
            kvp_readers: Vec::new(),
            xml_readers: Vec::new(),
            encoders: Vec::new(),
            callbacks: Vec::new(),
            exception_handlers: Vec::new(),
        }
    }

    /// Set the bind address
    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.config.bind_address = addr;
        self
    }

    /// Set the dispatch endpoint path
    pub fn service_path(mut self, path: impl Into<String>) -> Self {
        self.config.service_path = path.into();
        self
    }

    /// Set maximum request body size
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Set the XML look-ahead window
    pub fn xml_lookahead(mut self, bytes: usize) -> Self {
        self.config.xml_lookahead = bytes;
        self
    }

    /// Enable or disable CITE-compliance strictness
    pub fn strict(mut self, enable: bool) -> Self {
        self.config.strict = enable;
        self
    }

    /// Enable or disable verbose fault documents
    pub fn verbose_exceptions(mut self, enable: bool) -> Self {
        self.config.verbose_exceptions = enable;
        self
    }

    /// Enable or disable streamed response bodies
    pub fn stream_responses(mut self, enable: bool) -> Self {
        self.config.stream_responses = enable;
        self
    }

    /// Register a service descriptor
    pub fn service(mut self, descriptor: ServiceDescriptor) -> Self {
        self.services.push(Arc::new(descriptor));
        self
    }

    /// Register a typed KVP parser
    pub fn kvp_parser(mut self, parser: Arc<dyn KvpParser>) -> Self {
        self.kvp_parsers.push(parser);
        self
    }

    /// Register a KVP request reader
    pub fn kvp_reader(mut self, reader: Arc<dyn KvpRequestReader>) -> Self {
        self.kvp_readers.push(reader);
        self
    }

    /// Register an XML request reader
    pub fn xml_reader(mut self, reader: Arc<dyn XmlRequestReader>) -> Self {
        self.xml_readers.push(reader);
        self
    }

    /// Register a response encoder
    pub fn encoder(mut self, encoder: Arc<dyn ResponseEncoder>) -> Self {
        self.encoders.push(encoder);
        self
    }

    /// Register a dispatcher callback
    pub fn callback(mut self, callback: Arc<dyn DispatcherCallback>) -> Self {
        self.callbacks.push(callback);
        self
    }

    /// Register a per-service exception handler
    pub fn exception_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.exception_handlers.push(handler);
        self
    }

    /// Build the HTTP OWS server
    pub fn build(self) -> Result<OwsServer> {
        let services = ServiceRegistry::new(self.services).map_err(HttpOwsError::Dispatch)?;
        let dispatcher = Arc::new(Dispatcher::new(
            services,
            KvpParserRegistry::new(self.kvp_parsers),
            KvpReaderRegistry::new(self.kvp_readers),
            XmlReaderRegistry::new(self.xml_readers),
            ResponseEncoderRegistry::new(self.encoders),
            CallbackChain::new(self.callbacks),
            ExceptionHandlerRegistry::new(self.exception_handlers),
            Arc::new(self.config.clone()),
        ));
        Ok(OwsServer {
            config: self.config,
            dispatcher,
        })
    }
}

impl Default for OwsServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// HTTP OWS server: a hyper accept loop in front of a [`Dispatcher`].
#[derive(Clone)]
pub struct OwsServer {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
}

impl std::fmt::Debug for OwsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwsServer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl OwsServer {
    pub fn builder() -> OwsServerBuilder {
        OwsServerBuilder::new()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The dispatcher, for embedding into an existing HTTP stack.
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Run the accept loop
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_address).await?;
        info!("HTTP OWS server listening on {}", self.config.bind_address);
        info!("Dispatch endpoint available at: {}", self.config.service_path);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            debug!("New connection from {}", peer_addr);

            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service =
                    service_fn(move |req| handle_request(req, Arc::clone(&dispatcher)));

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    // Filter out common client disconnection errors that aren't actual problems
                    let err_str = err.to_string();
                    if err_str.contains("connection closed before message completed") {
                        debug!("Client disconnected (normal): {}", err);
                    } else {
                        error!("Error serving connection: {}", err);
                    }
                }
            });
        }
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    dispatcher: Arc<Dispatcher>,
) -> std::result::Result<Response<OwsBody>, std::convert::Infallible> {
    match dispatcher.dispatch(req).await {
        Ok(response) => Ok(response),
        Err(err) => {
            // Only security failures escape dispatch; the real security layer
            // sits outside this bundled loop, so answer a bare 500.
            error!("Unhandled dispatch failure: {}", err);
            Ok(Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(OwsBody::full(Bytes::from("Internal Server Error")))
                .unwrap())
        }
    }
}
