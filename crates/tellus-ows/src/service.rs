//! Service descriptors, the service registry, and operation specs.
//!
//! Operations are explicit per-operation descriptors: a declared parameter
//! list plus a handler, decided at registration time. Nothing is discovered
//! at call time.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::OwsResult;
use crate::error::{OwsError, ServiceException};
use crate::operation::Argument;
use crate::request::RequestContext;
use crate::response::BoxedResult;
use crate::version::Version;

/// One registered service: id, version, optional namespace, operation names
/// and the bound implementation.
pub struct ServiceDescriptor {
    /// Service id, matched case-insensitively.
    pub id: String,
    pub version: Version,
    pub namespace: Option<String>,
    /// Declared operation names.
    pub operations: Vec<String>,
    pub implementation: Arc<dyn OwsService>,
}

impl ServiceDescriptor {
    pub fn new(
        id: impl Into<String>,
        version: Version,
        operations: Vec<String>,
        implementation: Arc<dyn OwsService>,
    ) -> Self {
        Self {
            id: id.into(),
            version,
            namespace: None,
            operations,
            implementation,
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("namespace", &self.namespace)
            .field("operations", &self.operations)
            .finish()
    }
}

/// A bound service implementation: a lookup from operation name to spec.
pub trait OwsService: Send + Sync {
    /// Case-insensitive operation lookup.
    fn operation(&self, name: &str) -> Option<Arc<OperationSpec>>;
}

/// Parameter categories an operation can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSlot {
    /// A request bean populated from KVP and/or an XML body.
    RequestBean,
    /// The raw incoming body bytes, injected directly.
    RawBody,
    /// The request header snapshot, injected directly.
    HttpHeaders,
}

/// The explicit descriptor of one callable operation.
pub struct OperationSpec {
    pub name: String,
    pub params: Vec<ParamSlot>,
    pub handler: Arc<dyn OperationHandler>,
}

impl OperationSpec {
    pub fn new(
        name: impl Into<String>,
        params: Vec<ParamSlot>,
        handler: Arc<dyn OperationHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            params,
            handler,
        }
    }
}

impl fmt::Debug for OperationSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationSpec")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish()
    }
}

/// Invokes one operation with its bound argument list.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// A `None` result means "no body to write".
    async fn invoke(
        &self,
        ctx: &RequestContext,
        args: &[Argument],
    ) -> OwsResult<Option<BoxedResult>>;
}

/// A simple function-based operation handler.
pub struct FunctionOperation<F>
where
    F: Fn(&RequestContext, &[Argument]) -> BoxFuture<'static, OwsResult<Option<BoxedResult>>>
        + Send
        + Sync,
{
    handler_fn: F,
}

impl<F> FunctionOperation<F>
where
    F: Fn(&RequestContext, &[Argument]) -> BoxFuture<'static, OwsResult<Option<BoxedResult>>>
        + Send
        + Sync,
{
    pub fn new(handler_fn: F) -> Self {
        Self { handler_fn }
    }
}

#[async_trait]
impl<F> OperationHandler for FunctionOperation<F>
where
    F: Fn(&RequestContext, &[Argument]) -> BoxFuture<'static, OwsResult<Option<BoxedResult>>>
        + Send
        + Sync,
{
    async fn invoke(
        &self,
        ctx: &RequestContext,
        args: &[Argument],
    ) -> OwsResult<Option<BoxedResult>> {
        (self.handler_fn)(ctx, args).await
    }
}

/// An [`OwsService`] backed by a plain list of operation specs.
pub struct SimpleService {
    operations: Vec<Arc<OperationSpec>>,
}

impl SimpleService {
    pub fn new(operations: Vec<Arc<OperationSpec>>) -> Self {
        Self { operations }
    }
}

impl OwsService for SimpleService {
    fn operation(&self, name: &str) -> Option<Arc<OperationSpec>> {
        self.operations
            .iter()
            .find(|op| op.name.eq_ignore_ascii_case(name))
            .cloned()
    }
}

/// The read-only set of registered services.
///
/// Built once at startup; duplicate `(id, version, namespace)` registrations
/// fail construction rather than the first dispatch.
#[derive(Clone)]
pub struct ServiceRegistry {
    descriptors: Vec<Arc<ServiceDescriptor>>,
}

impl ServiceRegistry {
    pub fn new(descriptors: Vec<Arc<ServiceDescriptor>>) -> OwsResult<Self> {
        let mut seen = HashSet::new();
        for descriptor in &descriptors {
            let key = (
                descriptor.id.to_ascii_lowercase(),
                descriptor.version,
                descriptor.namespace.clone(),
            );
            if !seen.insert(key) {
                return Err(OwsError::Configuration(format!(
                    "Duplicate service registration: {} {} ({:?})",
                    descriptor.id, descriptor.version, descriptor.namespace
                )));
            }
        }
        Ok(Self { descriptors })
    }

    pub fn descriptors(&self) -> &[Arc<ServiceDescriptor>] {
        &self.descriptors
    }

    /// Versions registered for a service id.
    pub fn versions_of(&self, id: &str) -> Vec<Version> {
        self.descriptors
            .iter()
            .filter(|d| d.id.eq_ignore_ascii_case(id))
            .map(|d| d.version)
            .collect()
    }

    /// Resolves a descriptor by id, with version and namespace tie-breaks.
    ///
    /// A workspace-prefixed id ("topp/wfs") matches on the segment after the
    /// last separator. A requested version that matches nothing falls back
    /// to the unfiltered candidate set; a requested namespace only ever
    /// drops descriptors declaring an incompatible namespace. Remaining
    /// ambiguity resolves to the highest version.
    pub fn lookup(
        &self,
        id: &str,
        version: Option<Version>,
        namespace: Option<&str>,
    ) -> Option<Arc<ServiceDescriptor>> {
        let effective = id.rsplit('/').next().unwrap_or(id);

        let mut matches: Vec<&Arc<ServiceDescriptor>> = self
            .descriptors
            .iter()
            .filter(|d| d.id.eq_ignore_ascii_case(effective))
            .collect();
        if matches.is_empty() {
            return None;
        }

        if let Some(requested) = version {
            let filtered: Vec<_> = matches
                .iter()
                .copied()
                .filter(|d| d.version == requested)
                .collect();
            if !filtered.is_empty() {
                matches = filtered;
            }
        }

        if matches.len() > 1 {
            if let Some(requested) = namespace {
                let filtered: Vec<_> = matches
                    .iter()
                    .copied()
                    .filter(|d| d.namespace.as_deref().map(|ns| ns == requested).unwrap_or(true))
                    .collect();
                if filtered.is_empty() {
                    return None;
                }
                matches = filtered;
            }
        }

        matches.into_iter().max_by_key(|d| d.version).cloned()
    }
}

/// Verifies the requested operation against a resolved service.
///
/// The name must be declared on the descriptor and a matching callable must
/// exist on the bound implementation; anything else is an
/// `OperationNotSupported` fault.
pub fn resolve_operation(
    descriptor: &Arc<ServiceDescriptor>,
    request: &str,
) -> OwsResult<(String, Arc<OperationSpec>)> {
    let declared = descriptor
        .operations
        .iter()
        .find(|name| name.eq_ignore_ascii_case(request));
    let spec = descriptor.implementation.operation(request);

    match (declared, spec) {
        (Some(name), Some(spec)) => Ok((name.clone(), spec)),
        _ => Err(ServiceException::operation_not_supported(request).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_spec(name: &str) -> Arc<OperationSpec> {
        Arc::new(OperationSpec::new(
            name,
            vec![ParamSlot::RequestBean],
            Arc::new(FunctionOperation::new(|_, _| {
                Box::pin(async { Ok(None) })
            })),
        ))
    }

    fn descriptor(id: &str, version: &str, namespace: Option<&str>) -> Arc<ServiceDescriptor> {
        let implementation = Arc::new(SimpleService::new(vec![noop_spec("GetCapabilities")]));
        let mut d = ServiceDescriptor::new(
            id,
            version.parse().unwrap(),
            vec!["GetCapabilities".to_string()],
            implementation,
        );
        if let Some(ns) = namespace {
            d = d.with_namespace(ns);
        }
        Arc::new(d)
    }

    #[test]
    fn test_duplicate_registration_fails_at_build() {
        let result = ServiceRegistry::new(vec![
            descriptor("wfs", "1.1.0", None),
            descriptor("WFS", "1.1.0", None),
        ]);
        assert!(matches!(result, Err(OwsError::Configuration(_))));
    }

    #[test]
    fn test_lookup_without_version_picks_highest() {
        let registry = ServiceRegistry::new(vec![
            descriptor("wfs", "1.1.0", None),
            descriptor("wfs", "2.0.0", None),
        ])
        .unwrap();

        let resolved = registry.lookup("wfs", None, None).unwrap();
        assert_eq!(resolved.version, Version::new(2, 0, 0));
    }

    #[test]
    fn test_lookup_version_mismatch_falls_back_to_highest() {
        let registry = ServiceRegistry::new(vec![
            descriptor("wfs", "1.1.0", None),
            descriptor("wfs", "2.0.0", None),
        ])
        .unwrap();

        let resolved = registry
            .lookup("wfs", Some(Version::new(1, 0, 0)), None)
            .unwrap();
        assert_eq!(resolved.version, Version::new(2, 0, 0));
    }

    #[test]
    fn test_lookup_strips_workspace_prefix() {
        let registry = ServiceRegistry::new(vec![descriptor("wfs", "1.1.0", None)]).unwrap();
        assert!(registry.lookup("topp/wfs", None, None).is_some());
    }

    #[test]
    fn test_namespace_filter_keeps_undeclared_descriptors() {
        let registry = ServiceRegistry::new(vec![
            descriptor("wfs", "1.1.0", Some("http://acme.example/ns")),
            descriptor("wfs", "1.0.0", None),
        ])
        .unwrap();

        // Incompatible declared namespace is dropped; the namespace-less
        // descriptor survives.
        let resolved = registry
            .lookup("wfs", None, Some("http://other.example/ns"))
            .unwrap();
        assert_eq!(resolved.version, Version::new(1, 0, 0));
    }

    #[test]
    fn test_operation_resolution_is_case_insensitive() {
        let d = descriptor("wfs", "1.1.0", None);
        let (name, _) = resolve_operation(&d, "getcapabilities").unwrap();
        assert_eq!(name, "GetCapabilities");

        let err = resolve_operation(&d, "GetMap").unwrap_err();
        match err {
            OwsError::Fault(se) => {
                assert_eq!(se.code.as_deref(), Some("OperationNotSupported"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
