//! Fault document encoders.
//!
//! Two structurally different schemas are supported: the current
//! `ows:ExceptionReport` (OWS 1.1 / 2.0, selected per negotiated version)
//! and the legacy `ServiceExceptionReport`. Handlers are registered per
//! service, with a default handler bound to no specific service.

use std::sync::Arc;

use bytes::Bytes;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use crate::OwsResult;
use crate::error::ServiceException;
use crate::request::RequestContext;

const OWS_11_NAMESPACE: &str = "http://www.opengis.net/ows/1.1";
const OWS_20_NAMESPACE: &str = "http://www.opengis.net/ows/2.0";
const OGC_NAMESPACE: &str = "http://www.opengis.net/ogc";

/// A rendered fault document.
#[derive(Debug, Clone)]
pub struct FaultDocument {
    pub content_type: String,
    pub body: Bytes,
}

impl FaultDocument {
    /// The document body with any leading XML declaration stripped, for
    /// embedding into an outer envelope.
    pub fn body_fragment(&self) -> &[u8] {
        let body = &self.body[..];
        if body.starts_with(b"<?") {
            if let Some(end) = body.windows(2).position(|w| w == b"?>") {
                let rest = &body[end + 2..];
                let trimmed = rest
                    .iter()
                    .position(|b| !b.is_ascii_whitespace())
                    .unwrap_or(rest.len());
                return &rest[trimmed..];
            }
        }
        body
    }
}

/// Serializes a [`ServiceException`] into a protocol fault document.
pub trait ExceptionHandler: Send + Sync {
    /// The service this handler is registered for; `None` for the default.
    fn service(&self) -> Option<&str> {
        None
    }

    fn handle(
        &self,
        exception: &ServiceException,
        ctx: &RequestContext,
        verbose: bool,
    ) -> OwsResult<FaultDocument>;
}

/// Per-service handler resolution with a default fallback.
#[derive(Clone)]
pub struct ExceptionHandlerRegistry {
    handlers: Vec<Arc<dyn ExceptionHandler>>,
    default_handler: Arc<dyn ExceptionHandler>,
}

impl ExceptionHandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn ExceptionHandler>>) -> Self {
        Self {
            handlers,
            default_handler: Arc::new(OwsExceptionHandler),
        }
    }

    pub fn with_default(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.default_handler = handler;
        self
    }

    pub fn resolve(&self, service: Option<&str>) -> Arc<dyn ExceptionHandler> {
        if let Some(id) = service {
            for handler in &self.handlers {
                if handler
                    .service()
                    .map(|s| s.eq_ignore_ascii_case(id))
                    .unwrap_or(false)
                {
                    return Arc::clone(handler);
                }
            }
        }
        Arc::clone(&self.default_handler)
    }
}

impl Default for ExceptionHandlerRegistry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Collects the reportable text lines of an exception.
fn text_lines(exception: &ServiceException, verbose: bool) -> Vec<String> {
    let mut lines = vec![exception.message.clone()];
    lines.extend(exception.texts.iter().cloned());
    if verbose {
        let mut source: Option<&(dyn std::error::Error + 'static)> = exception
            .source
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static));
        while let Some(err) = source {
            lines.push(format!("caused by: {}", err));
            source = err.source();
        }
    }
    lines
}

/// The current `ows:ExceptionReport` schema.
///
/// The OWS 2.0 namespace is used for negotiated 2.x service versions, the
/// OWS 1.1 namespace otherwise.
pub struct OwsExceptionHandler;

impl ExceptionHandler for OwsExceptionHandler {
    fn handle(
        &self,
        exception: &ServiceException,
        ctx: &RequestContext,
        verbose: bool,
    ) -> OwsResult<FaultDocument> {
        let ows2 = ctx.version.map(|v| v.major >= 2).unwrap_or(false);
        let (namespace, report_version) = if ows2 {
            (OWS_20_NAMESPACE, "2.0.0")
        } else {
            (OWS_11_NAMESPACE, "1.1.0")
        };

        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut report = BytesStart::new("ows:ExceptionReport");
        report.push_attribute(("version", report_version));
        report.push_attribute(("xmlns:ows", namespace));
        writer.write_event(Event::Start(report))?;

        let mut element = BytesStart::new("ows:Exception");
        let code = exception
            .code
            .as_deref()
            .unwrap_or(ServiceException::NO_APPLICABLE_CODE);
        element.push_attribute(("exceptionCode", code));
        if let Some(locator) = exception.locator.as_deref() {
            element.push_attribute(("locator", locator));
        }
        writer.write_event(Event::Start(element))?;

        for line in text_lines(exception, verbose) {
            writer.write_event(Event::Start(BytesStart::new("ows:ExceptionText")))?;
            writer.write_event(Event::Text(BytesText::new(&line)))?;
            writer.write_event(Event::End(BytesEnd::new("ows:ExceptionText")))?;
        }

        writer.write_event(Event::End(BytesEnd::new("ows:Exception")))?;
        writer.write_event(Event::End(BytesEnd::new("ows:ExceptionReport")))?;

        Ok(FaultDocument {
            content_type: "application/xml".to_string(),
            body: Bytes::from(writer.into_inner()),
        })
    }
}

/// The legacy `ServiceExceptionReport` schema.
pub struct LegacyExceptionHandler {
    service: Option<String>,
}

impl LegacyExceptionHandler {
    pub fn new() -> Self {
        Self { service: None }
    }

    /// Binds this handler to one service id.
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: Some(service.into()),
        }
    }
}

impl Default for LegacyExceptionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionHandler for LegacyExceptionHandler {
    fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    fn handle(
        &self,
        exception: &ServiceException,
        _ctx: &RequestContext,
        verbose: bool,
    ) -> OwsResult<FaultDocument> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let mut report = BytesStart::new("ServiceExceptionReport");
        report.push_attribute(("version", "1.2.0"));
        report.push_attribute(("xmlns", OGC_NAMESPACE));
        writer.write_event(Event::Start(report))?;

        let mut element = BytesStart::new("ServiceException");
        if let Some(code) = exception.code.as_deref() {
            element.push_attribute(("code", code));
        }
        if let Some(locator) = exception.locator.as_deref() {
            element.push_attribute(("locator", locator));
        }
        writer.write_event(Event::Start(element))?;
        let text = text_lines(exception, verbose).join("\n");
        writer.write_event(Event::Text(BytesText::new(&text)))?;
        writer.write_event(Event::End(BytesEnd::new("ServiceException")))?;

        writer.write_event(Event::End(BytesEnd::new("ServiceExceptionReport")))?;

        Ok(FaultDocument {
            content_type: "application/vnd.ogc.se_xml".to_string(),
            body: Bytes::from(writer.into_inner()),
        })
    }
}
