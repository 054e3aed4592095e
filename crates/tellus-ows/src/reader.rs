//! Request-bean readers and parameter binding.
//!
//! A request bean is a `serde_json::Value` object built from the parsed KVP
//! map and/or the XML body. KVP-stage failures are deferred until the XML
//! binding attempt has also run, so a body can still rescue the exchange.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::OwsResult;
use crate::error::{OwsError, ServiceException};
use crate::kvp::specificity;
use crate::operation::Argument;
use crate::request::{RequestContext, XmlBody, XmlRoot};
use crate::service::{OperationSpec, ParamSlot};
use crate::version::Version;

/// Builds a request bean from the parsed KVP entries.
#[async_trait]
pub trait KvpRequestReader: Send + Sync {
    /// The operation name this reader binds, matched case-insensitively.
    fn request(&self) -> &str;

    fn service(&self) -> Option<&str> {
        None
    }

    fn version(&self) -> Option<Version> {
        None
    }

    async fn read(&self, ctx: &RequestContext) -> OwsResult<Value>;
}

/// Fallback reader: the bean is the parsed KVP map as a JSON object.
pub struct DefaultKvpReader;

#[async_trait]
impl KvpRequestReader for DefaultKvpReader {
    fn request(&self) -> &str {
        "*"
    }

    async fn read(&self, ctx: &RequestContext) -> OwsResult<Value> {
        let mut bean = Map::new();
        for (key, value) in &ctx.kvp {
            bean.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(bean))
    }
}

/// Registered KVP request readers with specificity tie-breaks.
#[derive(Clone)]
pub struct KvpReaderRegistry {
    readers: Vec<Arc<dyn KvpRequestReader>>,
    fallback: Arc<dyn KvpRequestReader>,
}

impl KvpReaderRegistry {
    pub fn new(readers: Vec<Arc<dyn KvpRequestReader>>) -> Self {
        Self {
            readers,
            fallback: Arc::new(DefaultKvpReader),
        }
    }

    /// Finds the most specific reader for an operation; the default reader
    /// applies when nothing matches.
    pub fn find(
        &self,
        request: &str,
        service: Option<&str>,
        version: Option<Version>,
    ) -> OwsResult<Arc<dyn KvpRequestReader>> {
        let mut best: Option<(u32, &Arc<dyn KvpRequestReader>)> = None;
        let mut tied = false;

        for reader in &self.readers {
            if !reader.request().eq_ignore_ascii_case(request) {
                continue;
            }
            let score = match specificity(
                reader.service(),
                reader.version(),
                None,
                service,
                version,
                None,
            ) {
                Some(score) => score,
                None => continue,
            };
            match &best {
                Some((top, _)) if *top == score => tied = true,
                Some((top, _)) if *top > score => {}
                _ => {
                    best = Some((score, reader));
                    tied = false;
                }
            }
        }

        if tied {
            return Err(OwsError::Configuration(format!(
                "Multiple equally specific KVP readers registered for request '{}'",
                request
            )));
        }
        Ok(best
            .map(|(_, r)| Arc::clone(r))
            .unwrap_or_else(|| Arc::clone(&self.fallback)))
    }
}

/// Produces a typed request bean from an XML document.
#[async_trait]
pub trait XmlRequestReader: Send + Sync + std::fmt::Debug {
    /// The root element local name this reader handles.
    fn element(&self) -> &str;

    /// The namespace of the root element, if this reader is namespaced.
    fn namespace(&self) -> Option<&str> {
        None
    }

    fn service(&self) -> Option<&str> {
        None
    }

    fn version(&self) -> Option<Version> {
        None
    }

    /// Reads the body into a bean. A bean already built from KVP is passed
    /// in so the reader can further populate it rather than replace it.
    async fn read(
        &self,
        ctx: &RequestContext,
        body: &XmlBody,
        bean: Option<Value>,
    ) -> OwsResult<Value>;
}

/// Registered XML request readers.
#[derive(Clone)]
pub struct XmlReaderRegistry {
    readers: Vec<Arc<dyn XmlRequestReader>>,
}

impl XmlReaderRegistry {
    pub fn new(readers: Vec<Arc<dyn XmlRequestReader>>) -> Self {
        Self { readers }
    }

    /// Finds a reader for the document root.
    ///
    /// An exact (namespace, element) match is preferred. When that fails,
    /// readers are searched by element local name alone; every lax match
    /// must then belong to one single service. That fallback exists for
    /// clients that omit the request namespace and is deliberately kept
    /// as-is, ambiguity included.
    pub fn find(
        &self,
        root: &XmlRoot,
        service: Option<&str>,
        version: Option<Version>,
    ) -> OwsResult<Option<Arc<dyn XmlRequestReader>>> {
        if let Some(reader) = self.find_qualified(root, service, version)? {
            return Ok(Some(reader));
        }
        self.find_lax(root, service, version)
    }

    fn find_qualified(
        &self,
        root: &XmlRoot,
        service: Option<&str>,
        version: Option<Version>,
    ) -> OwsResult<Option<Arc<dyn XmlRequestReader>>> {
        let mut best: Option<(u32, &Arc<dyn XmlRequestReader>)> = None;
        let mut tied = false;

        for reader in &self.readers {
            if !reader.element().eq_ignore_ascii_case(&root.local_name) {
                continue;
            }
            if reader.namespace() != root.namespace.as_deref() {
                continue;
            }
            let score = match specificity(
                reader.service(),
                reader.version(),
                None,
                service,
                version,
                None,
            ) {
                Some(score) => score,
                None => continue,
            };
            match &best {
                Some((top, _)) if *top == score => tied = true,
                Some((top, _)) if *top > score => {}
                _ => {
                    best = Some((score, reader));
                    tied = false;
                }
            }
        }

        if tied {
            return Err(OwsError::Configuration(format!(
                "Multiple equally specific XML readers registered for element '{}'",
                root.local_name
            )));
        }
        Ok(best.map(|(_, r)| Arc::clone(r)))
    }

    fn find_lax(
        &self,
        root: &XmlRoot,
        service: Option<&str>,
        version: Option<Version>,
    ) -> OwsResult<Option<Arc<dyn XmlRequestReader>>> {
        let candidates: Vec<&Arc<dyn XmlRequestReader>> = self
            .readers
            .iter()
            .filter(|r| r.element().eq_ignore_ascii_case(&root.local_name))
            .collect();
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut services = candidates
            .iter()
            .map(|r| r.service().map(str::to_ascii_lowercase));
        let first = services.next().unwrap();
        if first.is_none() || services.any(|s| s != first) {
            return Err(OwsError::Configuration(format!(
                "Multiple services claim element '{}'; a namespace is required",
                root.local_name
            )));
        }

        let mut best: Option<(u32, &Arc<dyn XmlRequestReader>)> = None;
        for reader in candidates {
            let score = match specificity(
                reader.service(),
                reader.version(),
                None,
                service,
                version,
                None,
            ) {
                Some(score) => score,
                None => continue,
            };
            match &best {
                Some((top, _)) if *top >= score => {}
                _ => best = Some((score, reader)),
            }
        }
        Ok(best.map(|(_, r)| Arc::clone(r)))
    }
}

/// Binds the declared parameter slots of an operation.
///
/// Request-bean slots are populated from the KVP reader (failures deferred),
/// then the XML reader when a body is present. A deferred KVP failure
/// surfaces only when no bean could be produced at all.
pub async fn bind_parameters(
    ctx: &mut RequestContext,
    spec: &OperationSpec,
    kvp_readers: &KvpReaderRegistry,
    xml_readers: &XmlReaderRegistry,
) -> OwsResult<Vec<Argument>> {
    let mut args = Vec::with_capacity(spec.params.len());

    for slot in &spec.params {
        match slot {
            ParamSlot::RawBody => {
                let raw = ctx
                    .body
                    .as_ref()
                    .map(|b| b.raw.clone())
                    .unwrap_or_default();
                args.push(Argument::RawBody(raw));
            }
            ParamSlot::HttpHeaders => {
                args.push(Argument::HttpHeaders(ctx.headers.clone()));
            }
            ParamSlot::RequestBean => {
                let bean = read_bean(ctx, &spec.name, kvp_readers, xml_readers).await?;
                backfill_from_bean(ctx, &bean)?;
                args.push(Argument::Bean(bean));
            }
        }
    }

    Ok(args)
}

async fn read_bean(
    ctx: &mut RequestContext,
    request: &str,
    kvp_readers: &KvpReaderRegistry,
    xml_readers: &XmlReaderRegistry,
) -> OwsResult<Value> {
    let mut bean: Option<Value> = None;
    let mut deferred: Option<OwsError> = None;

    if ctx.is_get || !ctx.raw_kvp.is_empty() {
        if let Some(error) = ctx.error.take() {
            deferred = Some(error);
        } else {
            let reader = kvp_readers.find(request, ctx.service.as_deref(), ctx.version)?;
            match reader.read(ctx).await {
                Ok(value) => bean = Some(value),
                Err(err) => deferred = Some(err),
            }
        }
    }

    if let Some(body) = ctx.body.clone() {
        match xml_readers.find(&body.root, ctx.service.as_deref(), ctx.version)? {
            Some(reader) => {
                bean = Some(reader.read(ctx, &body, bean.take()).await?);
            }
            None => {
                if bean.is_none() && deferred.is_none() {
                    return Err(OwsError::Configuration(format!(
                        "No request reader for element '{}' (namespace {:?})",
                        body.root.local_name, body.root.namespace
                    )));
                }
            }
        }
    }

    match bean {
        Some(bean) => Ok(bean),
        None => match deferred {
            Some(error) => Err(error),
            None => Err(OwsError::Configuration(format!(
                "No request reader produced a bean for operation '{}'",
                request
            ))),
        },
    }
}

/// Backfills context coordinates from bean properties, for clients that only
/// declare them inside the body.
fn backfill_from_bean(ctx: &mut RequestContext, bean: &Value) -> OwsResult<()> {
    let Some(object) = bean.as_object() else {
        return Ok(());
    };

    if ctx.service.is_none() {
        if let Some(service) = object.get("service").and_then(Value::as_str) {
            ctx.service = Some(service.to_string());
        }
    }
    if ctx.version.is_none() {
        if let Some(version) = object.get("version").and_then(Value::as_str) {
            ctx.version = Version::normalize(version)?;
        }
    }
    if ctx.output_format.is_none() {
        // KVP-built beans carry the normalized lower-case key, XML-built
        // beans the attribute name.
        if let Some(format) = object
            .get("outputFormat")
            .or_else(|| object.get("outputformat"))
            .and_then(Value::as_str)
        {
            ctx.output_format = Some(format.to_string());
        }
    }
    Ok(())
}

/// Strict-mode verification applied after binding succeeded.
pub fn verify_strict(ctx: &RequestContext, registered_versions: &[Version]) -> OwsResult<()> {
    if ctx.service.is_none() {
        return Err(ServiceException::missing_parameter("service").into());
    }
    match ctx.version {
        None => Err(ServiceException::missing_parameter("version").into()),
        Some(version) => {
            if !version.is_cite_compliant() {
                return Err(ServiceException::invalid_parameter(
                    "version",
                    format!("Invalid version '{}'", version),
                )
                .into());
            }
            if !registered_versions.contains(&version) {
                return Err(ServiceException::invalid_parameter(
                    "version",
                    format!("Version '{}' is not supported", version),
                )
                .into());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug)]
    struct StubXmlReader {
        element: &'static str,
        namespace: Option<&'static str>,
        service: Option<&'static str>,
    }

    #[async_trait]
    impl XmlRequestReader for StubXmlReader {
        fn element(&self) -> &str {
            self.element
        }

        fn namespace(&self) -> Option<&str> {
            self.namespace
        }

        fn service(&self) -> Option<&str> {
            self.service
        }

        async fn read(
            &self,
            _ctx: &RequestContext,
            body: &XmlBody,
            bean: Option<Value>,
        ) -> OwsResult<Value> {
            let mut object = match bean {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            object.insert("element".to_string(), json!(body.root.local_name));
            Ok(Value::Object(object))
        }
    }

    fn xml_body(local: &str, namespace: Option<&str>) -> XmlBody {
        XmlBody {
            raw: bytes::Bytes::new(),
            text: String::new(),
            root: XmlRoot {
                namespace: namespace.map(str::to_string),
                local_name: local.to_string(),
                attributes: Default::default(),
            },
        }
    }

    #[test]
    fn test_qualified_lookup_prefers_matching_namespace() {
        let registry = XmlReaderRegistry::new(vec![
            Arc::new(StubXmlReader {
                element: "GetCapabilities",
                namespace: Some("http://acme.example/wfs"),
                service: Some("wfs"),
            }),
            Arc::new(StubXmlReader {
                element: "GetCapabilities",
                namespace: Some("http://acme.example/wcs"),
                service: Some("wcs"),
            }),
        ]);

        let root = xml_body("GetCapabilities", Some("http://acme.example/wcs")).root;
        let reader = registry.find(&root, None, None).unwrap().unwrap();
        assert_eq!(reader.service(), Some("wcs"));
    }

    #[test]
    fn test_element_only_fallback_requires_single_service() {
        // Documented quirk: with no namespace match the search falls back to
        // the bare element name, and that is only allowed when every
        // candidate belongs to the same service.
        let single = XmlReaderRegistry::new(vec![Arc::new(StubXmlReader {
            element: "GetCapabilities",
            namespace: Some("http://acme.example/wfs"),
            service: Some("wfs"),
        })]);
        let root = xml_body("GetCapabilities", None).root;
        assert!(single.find(&root, None, None).unwrap().is_some());

        let mixed = XmlReaderRegistry::new(vec![
            Arc::new(StubXmlReader {
                element: "GetCapabilities",
                namespace: Some("http://acme.example/wfs"),
                service: Some("wfs"),
            }),
            Arc::new(StubXmlReader {
                element: "GetCapabilities",
                namespace: Some("http://acme.example/wcs"),
                service: Some("wcs"),
            }),
        ]);
        let err = mixed.find(&root, None, None).unwrap_err();
        assert!(matches!(err, OwsError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_xml_reader_populates_existing_bean() {
        let mut ctx = RequestContext::new();
        ctx.raw_kvp.insert("service".to_string(), "wfs".to_string());
        ctx.kvp.insert("service".to_string(), json!("wfs"));
        ctx.body = Some(xml_body("GetFeature", Some("http://acme.example/wfs")));

        let spec = OperationSpec::new(
            "GetFeature",
            vec![ParamSlot::RequestBean],
            Arc::new(crate::service::FunctionOperation::new(|_, _| {
                Box::pin(async { Ok(None) })
            })),
        );
        let kvp_readers = KvpReaderRegistry::new(vec![]);
        let xml_readers = XmlReaderRegistry::new(vec![Arc::new(StubXmlReader {
            element: "GetFeature",
            namespace: Some("http://acme.example/wfs"),
            service: Some("wfs"),
        })]);

        let args = bind_parameters(&mut ctx, &spec, &kvp_readers, &xml_readers)
            .await
            .unwrap();
        let bean = args[0].as_bean().unwrap();
        // KVP-built properties survive; the XML reader only adds to them.
        assert_eq!(bean["service"], json!("wfs"));
        assert_eq!(bean["element"], json!("GetFeature"));
    }

    #[tokio::test]
    async fn test_deferred_kvp_error_surfaces_without_body() {
        let mut ctx = RequestContext::new();
        ctx.raw_kvp.insert("bbox".to_string(), "junk".to_string());
        ctx.soft_fail(ServiceException::invalid_parameter("bbox", "unparsable").into());

        let spec = OperationSpec::new(
            "GetFeature",
            vec![ParamSlot::RequestBean],
            Arc::new(crate::service::FunctionOperation::new(|_, _| {
                Box::pin(async { Ok(None) })
            })),
        );
        let err = bind_parameters(
            &mut ctx,
            &spec,
            &KvpReaderRegistry::new(vec![]),
            &XmlReaderRegistry::new(vec![]),
        )
        .await
        .unwrap_err();
        match err {
            OwsError::Fault(se) => assert_eq!(se.locator.as_deref(), Some("bbox")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backfill_from_bean() {
        let mut ctx = RequestContext::new();
        ctx.raw_kvp
            .insert("service".to_string(), "wfs".to_string());
        ctx.kvp.insert("service".to_string(), json!("wfs"));
        ctx.kvp.insert("version".to_string(), json!("1.1"));
        ctx.kvp
            .insert("outputFormat".to_string(), json!("text/xml"));

        let spec = OperationSpec::new(
            "GetCapabilities",
            vec![ParamSlot::RequestBean],
            Arc::new(crate::service::FunctionOperation::new(|_, _| {
                Box::pin(async { Ok(None) })
            })),
        );
        bind_parameters(
            &mut ctx,
            &spec,
            &KvpReaderRegistry::new(vec![]),
            &XmlReaderRegistry::new(vec![]),
        )
        .await
        .unwrap();

        assert_eq!(ctx.service.as_deref(), Some("wfs"));
        assert_eq!(ctx.version, Some(Version::new(1, 1, 0)));
        assert_eq!(ctx.output_format.as_deref(), Some("text/xml"));
    }
}
