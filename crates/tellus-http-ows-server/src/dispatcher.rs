//! The dispatch pipeline.
//!
//! One entry point carries an exchange end to end: transport classification,
//! KVP/XML/SOAP ingestion, service and operation resolution, parameter
//! binding, execution, negotiated response encoding and fault reporting.
//! Every stage receives the exchange-local [`RequestContext`] explicitly.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ALLOW, CONTENT_TYPE};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use tracing::{debug, error, warn};
use url::form_urlencoded;

use tellus_ows::error::{BoxError, FaultKind, OwsError, ServiceException};
use tellus_ows::kvp;
use tellus_ows::operation::Operation;
use tellus_ows::output::{OutputStrategy, VecOutput};
use tellus_ows::reader::verify_strict;
use tellus_ows::request::RequestContext;
use tellus_ows::response::{BoxedResult, ContentDisposition, ResponseEncoder};
use tellus_ows::service::{resolve_operation, ServiceDescriptor, ServiceRegistry};
use tellus_ows::version::Version;
use tellus_ows::{
    reserved, CallbackChain, ExceptionHandlerRegistry, KvpParserRegistry, KvpReaderRegistry,
    OwsResult, ResponseEncoderRegistry, XmlReaderRegistry, SOAP_MIME,
};

use crate::body::{buffer_body, decode_text};
use crate::output::{ChannelOutput, OwsBody};
use crate::server::ServerConfig;
use crate::soap;

const ALLOWED_METHODS: &str = "GET, POST, OPTIONS";
const FORM_MIME: &str = "application/x-www-form-urlencoded";
const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Orchestrates the OWS dispatch pipeline over the registered services,
/// parsers, readers, encoders and callbacks.
pub struct Dispatcher {
    services: ServiceRegistry,
    kvp_parsers: KvpParserRegistry,
    kvp_readers: KvpReaderRegistry,
    xml_readers: XmlReaderRegistry,
    encoders: ResponseEncoderRegistry,
    callbacks: CallbackChain,
    exception_handlers: ExceptionHandlerRegistry,
    config: Arc<ServerConfig>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        services: ServiceRegistry,
        kvp_parsers: KvpParserRegistry,
        kvp_readers: KvpReaderRegistry,
        xml_readers: XmlReaderRegistry,
        encoders: ResponseEncoderRegistry,
        callbacks: CallbackChain,
        exception_handlers: ExceptionHandlerRegistry,
        config: Arc<ServerConfig>,
    ) -> Self {
        Self {
            services,
            kvp_parsers,
            kvp_readers,
            xml_readers,
            encoders,
            callbacks,
            exception_handlers,
            config,
        }
    }

    pub fn services(&self) -> &ServiceRegistry {
        &self.services
    }

    /// Handles one HTTP exchange.
    ///
    /// Every outcome short of a security failure is answered in-band: a
    /// negotiated response body, a protocol fault document, a bare HTTP
    /// status, or nothing at all for a peer that already went away.
    /// `Err` is returned only for [`OwsError::Security`], which belongs to
    /// an outer layer and is rethrown untouched.
    pub async fn dispatch<B>(&self, req: Request<B>) -> Result<Response<OwsBody>, OwsError>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        match req.method() {
            &Method::GET | &Method::POST => {}
            &Method::OPTIONS => return Ok(preflight()),
            _ => return Ok(method_not_allowed()),
        }

        let Some(path) = mount_relative(req.uri().path(), &self.config.service_path) else {
            return Ok(not_found());
        };

        let mut ctx = RequestContext::new();
        ctx.method = req.method().as_str().to_string();
        ctx.path = path;
        ctx.is_get = req.method() == Method::GET;
        ctx.headers = req
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let outcome = self.run_pipeline(&mut ctx, req).await;
        let response = match outcome {
            Ok(response) => Ok(response),
            Err(err) => self.report_failure(&ctx, err),
        };
        self.callbacks.finished(&ctx);
        response
    }

    async fn run_pipeline<B>(
        &self,
        ctx: &mut RequestContext,
        req: Request<B>,
    ) -> Result<Response<OwsBody>, OwsError>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        self.ingest(ctx, req).await?;
        self.callbacks.initialized(ctx);
        self.parse_kvp(ctx)?;

        let descriptor = self.resolve_service(ctx)?;
        let descriptor = self.callbacks.service_dispatched(ctx, descriptor)?;
        ctx.descriptor = Some(Arc::clone(&descriptor));

        let requested = ctx
            .request
            .clone()
            .ok_or_else(|| ServiceException::missing_parameter("request"))?;
        let (name, spec) = resolve_operation(&descriptor, &requested)?;
        let args =
            tellus_ows::reader::bind_parameters(ctx, &spec, &self.kvp_readers, &self.xml_readers)
                .await?;
        let operation = Operation::new(name, Arc::clone(&descriptor), Arc::clone(&spec), args);
        let operation = self.callbacks.operation_dispatched(ctx, operation)?;

        if self.config.strict && !operation.name.eq_ignore_ascii_case("GetCapabilities") {
            verify_strict(ctx, &self.services.versions_of(&descriptor.id))?;
        }

        let result = operation
            .spec
            .handler
            .invoke(ctx, &operation.args)
            .await
            .map_err(OwsError::unwrap_execution)?;
        let result = self.callbacks.operation_executed(ctx, &operation, result)?;

        let Some(result) = result else {
            return Ok(empty_ok());
        };

        let encoder =
            self.encoders
                .select(result.as_ref(), &operation, ctx.output_format.as_deref())?;
        let encoder =
            self.callbacks
                .response_dispatched(ctx, &operation, result.as_ref(), encoder)?;

        self.write_response(ctx, operation, result, encoder).await
    }

    /// Classifies the transport and buffers the request input.
    ///
    /// GET is always KVP. A POST body is KVP when form-encoded, a SOAP
    /// envelope when the content type says so (the payload child becomes the
    /// effective XML body), and a plain XML document otherwise. An empty
    /// POST body skips XML parsing entirely.
    async fn ingest<B>(&self, ctx: &mut RequestContext, req: Request<B>) -> OwsResult<()>
    where
        B: http_body::Body + Send,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let query = req.uri().query().unwrap_or("").to_string();
        let query_pairs: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();

        if ctx.is_get {
            ctx.raw_kvp = kvp::normalize(query_pairs);
            self.apply_reserved(ctx);
            return Ok(());
        }

        let content_type = ctx.header("content-type").unwrap_or("").to_string();
        let bytes = collect_body(req, self.config.max_body_size).await?;

        if content_type
            .trim_start()
            .to_ascii_lowercase()
            .starts_with(FORM_MIME)
        {
            // Body pairs shadow query pairs.
            let pairs = form_urlencoded::parse(&bytes)
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .chain(query_pairs);
            ctx.raw_kvp = kvp::normalize(pairs);
            self.apply_reserved(ctx);
            return Ok(());
        }

        ctx.raw_kvp = kvp::normalize(query_pairs);
        self.apply_reserved(ctx);

        let bytes = if soap::is_soap(&content_type) {
            ctx.is_soap = true;
            let text = decode_text(&bytes, self.config.xml_lookahead)?;
            Bytes::from(soap::unwrap_envelope(&text)?)
        } else {
            bytes
        };

        ctx.body = buffer_body(bytes, self.config.xml_lookahead)?;
        Ok(())
    }

    /// Moves the reserved keys out of the raw KVP mapping into the context.
    ///
    /// A malformed version is recorded as a soft failure so classification
    /// can still finish and the fault be reported in protocol-correct form.
    fn apply_reserved(&self, ctx: &mut RequestContext) {
        let service = ctx.raw_kvp(reserved::SERVICE).map(str::to_string);
        if let Some(service) = service.filter(|s| !s.is_empty()) {
            ctx.service = Some(service);
        }
        let version = ctx.raw_kvp(reserved::VERSION).map(str::to_string);
        if let Some(version) = version {
            match Version::normalize(&version) {
                Ok(version) => ctx.version = version,
                Err(err) => ctx.soft_fail(err),
            }
        }
        let request = ctx.raw_kvp(reserved::REQUEST).map(str::to_string);
        if let Some(request) = request.filter(|r| !r.is_empty()) {
            ctx.request = Some(request);
        }
        let format = ctx.raw_kvp(reserved::OUTPUT_FORMAT).map(str::to_string);
        if let Some(format) = format.filter(|f| !f.is_empty()) {
            ctx.output_format = Some(format);
        }
        let namespace = ctx.raw_kvp(reserved::NAMESPACE).map(str::to_string);
        if let Some(namespace) = namespace.filter(|n| !n.is_empty()) {
            ctx.namespace = Some(namespace);
        }
    }

    fn parse_kvp(&self, ctx: &mut RequestContext) -> OwsResult<()> {
        if ctx.raw_kvp.is_empty() {
            return Ok(());
        }
        let (parsed, soft_error) = self.kvp_parsers.parse(
            &ctx.raw_kvp,
            ctx.service.as_deref(),
            ctx.version,
            ctx.request.as_deref(),
        )?;
        ctx.kvp = parsed;
        if let Some(err) = soft_error {
            ctx.soft_fail(err);
        }
        Ok(())
    }

    /// Resolves the service from KVP values, then XML root attributes, then
    /// the context path, and looks up the matching descriptor.
    fn resolve_service(&self, ctx: &mut RequestContext) -> OwsResult<Arc<ServiceDescriptor>> {
        if let Some(body) = &ctx.body {
            let root = body.root.clone();
            if ctx.service.is_none() {
                if let Some(service) = root.attribute("service").filter(|s| !s.is_empty()) {
                    ctx.service = Some(service.to_string());
                }
            }
            if ctx.version.is_none() {
                if let Some(version) = root.attribute("version") {
                    match Version::normalize(version) {
                        Ok(version) => ctx.version = version,
                        Err(err) => ctx.soft_fail(err),
                    }
                }
            }
            if ctx.request.is_none() {
                let name = root
                    .attribute("request")
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| root.local_name.clone());
                ctx.request = Some(name);
            }
            if ctx.output_format.is_none() {
                if let Some(format) = root.attribute("outputFormat").filter(|f| !f.is_empty()) {
                    ctx.output_format = Some(format.to_string());
                }
            }
            if ctx.namespace.is_none() {
                ctx.namespace = root
                    .attribute("namespace")
                    .map(str::to_string)
                    .or_else(|| root.namespace.clone());
            }
        }

        let segments: Vec<String> = ctx.path_segments().iter().map(|s| s.to_string()).collect();
        if !self.config.strict {
            // Backward-compatible <service>/<request> path form.
            if ctx.service.is_none() {
                if let Some(first) = segments.first() {
                    ctx.service = Some(first.clone());
                }
            }
            if ctx.request.is_none() && segments.len() >= 2 {
                ctx.request = segments.last().cloned();
            }
        }

        let id = ctx
            .service
            .clone()
            .ok_or_else(|| ServiceException::missing_parameter("service"))?;
        if let Some(descriptor) = self
            .services
            .lookup(&id, ctx.version, ctx.namespace.as_deref())
        {
            return Ok(descriptor);
        }

        // Retry with the path segment before giving up.
        if let Some(first) = segments.first() {
            if !first.eq_ignore_ascii_case(&id) {
                if let Some(descriptor) =
                    self.services
                        .lookup(first, ctx.version, ctx.namespace.as_deref())
                {
                    ctx.service = Some(first.clone());
                    return Ok(descriptor);
                }
            }
        }

        Err(ServiceException::invalid_parameter(
            "service",
            format!("No service matches '{}'", id),
        )
        .into())
    }

    async fn write_response(
        &self,
        ctx: &RequestContext,
        operation: Operation,
        result: BoxedResult,
        encoder: Arc<dyn ResponseEncoder>,
    ) -> Result<Response<OwsBody>, OwsError> {
        let mime = if ctx.is_soap {
            SOAP_MIME.to_string()
        } else {
            encoder.mime_type(result.as_ref(), &operation)?
        };

        let (mut disposition, mut filename) =
            encoder.content_disposition(result.as_ref(), &operation);
        let mut explicit = false;
        if let Some(choice) = ctx
            .raw_kvp(reserved::CONTENT_DISPOSITION)
            .and_then(ContentDisposition::parse)
        {
            disposition = choice;
            explicit = true;
        }
        if let Some(name) = ctx.raw_kvp(reserved::FILENAME).filter(|n| !n.is_empty()) {
            filename = Some(name.to_string());
            explicit = true;
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, header_value(&mime)?);
        if filename.is_some() || explicit {
            let value = match &filename {
                Some(name) => format!("{}; filename={}", disposition.as_str(), name),
                None => disposition.as_str().to_string(),
            };
            headers.insert(http::header::CONTENT_DISPOSITION, header_value(&value)?);
        }
        for (name, value) in encoder.headers(result.as_ref(), &operation) {
            // An explicit disposition choice is never overridden by the
            // encoder's own headers.
            if explicit && name.eq_ignore_ascii_case("content-disposition") {
                continue;
            }
            headers.insert(header_name(&name)?, header_value(&value)?);
        }

        let is_soap = ctx.is_soap;
        let soap_body_type = encoder.soap_body_type();

        let body = if self.config.stream_responses {
            let (mut output, body) = ChannelOutput::new(STREAM_CHANNEL_CAPACITY);
            tokio::spawn(async move {
                if let Err(err) =
                    write_payload(encoder, result, &mut output, operation, is_soap, soap_body_type)
                        .await
                {
                    if err.is_client_abort() {
                        debug!("client aborted mid-stream");
                    } else {
                        warn!(error = %err, "response streaming failed");
                    }
                }
            });
            body
        } else {
            let mut output = VecOutput::new();
            write_payload(
                encoder,
                result,
                &mut output,
                operation,
                is_soap,
                soap_body_type,
            )
            .await?;
            OwsBody::full(output.into_bytes())
        };

        let mut response = Response::builder()
            .status(StatusCode::OK)
            .body(body)
            .unwrap();
        *response.headers_mut() = headers;
        Ok(response)
    }

    /// Classifies a failed exchange and renders it for the client.
    fn report_failure(
        &self,
        ctx: &RequestContext,
        err: OwsError,
    ) -> Result<Response<OwsBody>, OwsError> {
        if err.is_client_abort() {
            debug!(path = %ctx.path, "client aborted the exchange; suppressing fault report");
            return Ok(empty_ok());
        }
        if matches!(err, OwsError::Security(_)) {
            return Err(err);
        }

        match err.into_fault() {
            FaultKind::Status { status, message } => {
                if status < 400 {
                    debug!(status, "answering with bare HTTP status");
                } else {
                    warn!(status, message = message.as_deref().unwrap_or(""), "answering with bare HTTP status");
                }
                let code =
                    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let body = match message {
                    Some(message) => OwsBody::full(Bytes::from(message)),
                    None => OwsBody::empty(),
                };
                Ok(Response::builder()
                    .status(code)
                    .header(CONTENT_TYPE, "text/plain")
                    .body(body)
                    .unwrap())
            }
            FaultKind::Service(exception) => {
                warn!(
                    code = exception
                        .code
                        .as_deref()
                        .unwrap_or(ServiceException::NO_APPLICABLE_CODE),
                    locator = exception.locator.as_deref().unwrap_or(""),
                    "reporting service fault: {}",
                    exception.message
                );
                let handler = self.exception_handlers.resolve(ctx.service.as_deref());
                let document =
                    match handler.handle(&exception, ctx, self.config.verbose_exceptions) {
                        Ok(document) => document,
                        Err(render_err) => {
                            error!(error = %render_err, "fault document rendering failed");
                            return Ok(Response::builder()
                                .status(StatusCode::INTERNAL_SERVER_ERROR)
                                .body(OwsBody::empty())
                                .unwrap());
                        }
                    };
                let (content_type, body) = if ctx.is_soap {
                    (
                        SOAP_MIME.to_string(),
                        soap::wrap_fault(document.body_fragment()),
                    )
                } else {
                    (document.content_type.clone(), document.body.clone())
                };
                // Faults are reported in-band with HTTP 200 per OWS convention.
                Ok(Response::builder()
                    .status(StatusCode::OK)
                    .header(CONTENT_TYPE, content_type)
                    .body(OwsBody::full(body))
                    .unwrap())
            }
        }
    }
}

async fn write_payload(
    encoder: Arc<dyn ResponseEncoder>,
    result: BoxedResult,
    output: &mut dyn OutputStrategy,
    operation: Operation,
    is_soap: bool,
    soap_body_type: Option<String>,
) -> OwsResult<()> {
    if is_soap {
        soap::write_envelope_open(output, soap_body_type.as_deref()).await?;
    }
    encoder.write(result.as_ref(), output, &operation).await?;
    if is_soap {
        soap::write_envelope_close(output).await?;
    }
    output.flush().await
}

async fn collect_body<B>(req: Request<B>, max_body_size: usize) -> OwsResult<Bytes>
where
    B: http_body::Body + Send,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let bytes = req
        .into_body()
        .collect()
        .await
        .map_err(|err| OwsError::Other(err.into()))?
        .to_bytes();
    if bytes.len() > max_body_size {
        return Err(OwsError::http_status(
            413,
            format!("Request body exceeds {} bytes", max_body_size),
        ));
    }
    Ok(bytes)
}

/// The request path relative to the mount point, or `None` when the request
/// is outside it.
fn mount_relative(path: &str, mount: &str) -> Option<String> {
    let mount = mount.trim_end_matches('/');
    if mount.is_empty() {
        return Some(path.to_string());
    }
    if path == mount {
        return Some(String::new());
    }
    path.strip_prefix(mount)
        .filter(|rest| rest.starts_with('/'))
        .map(str::to_string)
}

fn header_value(value: &str) -> OwsResult<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| OwsError::Configuration(format!("Invalid header value '{}'", value)))
}

fn header_name(name: &str) -> OwsResult<HeaderName> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| OwsError::Configuration(format!("Invalid header name '{}'", name)))
}

fn empty_ok() -> Response<OwsBody> {
    Response::builder()
        .status(StatusCode::OK)
        .body(OwsBody::empty())
        .unwrap()
}

fn preflight() -> Response<OwsBody> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(ALLOW, ALLOWED_METHODS)
        .body(OwsBody::empty())
        .unwrap()
}

fn method_not_allowed() -> Response<OwsBody> {
    Response::builder()
        .status(StatusCode::METHOD_NOT_ALLOWED)
        .header(ALLOW, ALLOWED_METHODS)
        .body(OwsBody::full(Bytes::from_static(b"Method Not Allowed")))
        .unwrap()
}

fn not_found() -> Response<OwsBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(OwsBody::full(Bytes::from_static(b"Not Found")))
        .unwrap()
}
