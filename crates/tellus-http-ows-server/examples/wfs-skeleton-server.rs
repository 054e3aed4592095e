//! # WFS Skeleton Server
//!
//! A minimal OWS endpoint exposing a skeleton WFS with a GetCapabilities
//! operation, useful for poking the dispatch pipeline by hand.
//!
//! ## Usage
//! ```bash
//! # Start server on default port (8080)
//! cargo run --example wfs-skeleton-server
//! ```
//!
//! ## Try it
//! ```bash
//! curl 'http://127.0.0.1:8080/ows?service=WFS&request=GetCapabilities'
//! curl -X POST -H 'Content-Type: text/xml' \
//!      -d '<GetCapabilities service="WFS"/>' http://127.0.0.1:8080/ows
//! ```

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use tellus_http_ows_server::{OwsServer, RequestLoggingCallback};
use tellus_ows::operation::Operation;
use tellus_ows::output::OutputStrategy;
use tellus_ows::response::{BoxedResult, OperationResult, ResponseEncoder};
use tellus_ows::service::{
    FunctionOperation, OperationSpec, ParamSlot, ServiceDescriptor, SimpleService,
};
use tellus_ows::OwsResult;

struct CapabilitiesDocument;

impl OperationResult for CapabilitiesDocument {
    fn tags(&self) -> &'static [&'static str] {
        &["wfs-capabilities", "capabilities", "xml"]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct CapabilitiesEncoder;

#[async_trait]
impl ResponseEncoder for CapabilitiesEncoder {
    fn accepts(&self) -> &'static str {
        "capabilities"
    }

    fn mime_type(
        &self,
        _result: &dyn OperationResult,
        _operation: &Operation,
    ) -> OwsResult<String> {
        Ok("application/xml".to_string())
    }

    async fn write(
        &self,
        _result: &dyn OperationResult,
        output: &mut dyn OutputStrategy,
        operation: &Operation,
    ) -> OwsResult<()> {
        let document = format!(
            "<WFS_Capabilities version=\"{}\">\n  <OperationsMetadata>\n    <Operation name=\"GetCapabilities\"/>\n  </OperationsMetadata>\n</WFS_Capabilities>\n",
            operation.descriptor.version
        );
        output.write(Bytes::from(document)).await
    }
}

fn capabilities_operation() -> Arc<OperationSpec> {
    Arc::new(OperationSpec::new(
        "GetCapabilities",
        vec![ParamSlot::RequestBean],
        Arc::new(FunctionOperation::new(|_, _| {
            Box::pin(async { Ok(Some(Box::new(CapabilitiesDocument) as BoxedResult)) })
        })),
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    let wfs = ServiceDescriptor::new(
        "wfs",
        "2.0.0".parse()?,
        vec!["GetCapabilities".to_string()],
        Arc::new(SimpleService::new(vec![capabilities_operation()])),
    );

    let server = OwsServer::builder()
        .service(wfs)
        .encoder(Arc::new(CapabilitiesEncoder))
        .callback(Arc::new(RequestLoggingCallback))
        .build()?;

    info!("Starting WFS skeleton server");
    server.run().await?;
    Ok(())
}
