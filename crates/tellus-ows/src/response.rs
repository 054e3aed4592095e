//! Response encoders and negotiated encoder selection.
//!
//! Operation results carry an explicit list of variant tags, most specific
//! first; encoders declare the single tag they accept. Selection ranks
//! candidates by tag specificity, and an ambiguity is a detectable error,
//! never a registration-order artifact.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use crate::OwsResult;
use crate::error::OwsError;
use crate::operation::Operation;
use crate::output::OutputStrategy;

/// A value produced by a service operation.
pub trait OperationResult: Send + Sync + 'static {
    /// Variant tags from most to least specific, e.g.
    /// `["wfs-capabilities", "capabilities", "xml"]`.
    fn tags(&self) -> &'static [&'static str];

    fn as_any(&self) -> &dyn Any;
}

pub type BoxedResult = Box<dyn OperationResult>;

/// The two allowed content-disposition values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentDisposition {
    #[default]
    Inline,
    Attachment,
}

impl ContentDisposition {
    /// Parses an explicit override; anything but the two allowed values is
    /// ignored by returning `None`.
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("inline") {
            Some(ContentDisposition::Inline)
        } else if value.eq_ignore_ascii_case("attachment") {
            Some(ContentDisposition::Attachment)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentDisposition::Inline => "inline",
            ContentDisposition::Attachment => "attachment",
        }
    }
}

/// Serializes one kind of operation result.
#[async_trait]
pub trait ResponseEncoder: Send + Sync + std::fmt::Debug {
    /// The result tag this encoder accepts.
    fn accepts(&self) -> &'static str;

    /// Output formats this encoder produces; empty means "any".
    fn output_formats(&self) -> Vec<String> {
        Vec::new()
    }

    /// Operation-level applicability check.
    fn can_handle(&self, operation: &Operation) -> bool {
        let _ = operation;
        true
    }

    fn mime_type(&self, result: &dyn OperationResult, operation: &Operation) -> OwsResult<String>;

    /// Preferred disposition and filename; overridable by explicit KVP
    /// parameters.
    fn content_disposition(
        &self,
        result: &dyn OperationResult,
        operation: &Operation,
    ) -> (ContentDisposition, Option<String>) {
        let _ = (result, operation);
        (ContentDisposition::Inline, None)
    }

    /// Extra response headers.
    fn headers(&self, result: &dyn OperationResult, operation: &Operation) -> Vec<(String, String)> {
        let _ = (result, operation);
        Vec::new()
    }

    /// Optional `type` attribute for the SOAP body wrapper.
    fn soap_body_type(&self) -> Option<String> {
        None
    }

    async fn write(
        &self,
        result: &dyn OperationResult,
        output: &mut dyn OutputStrategy,
        operation: &Operation,
    ) -> OwsResult<()>;
}

/// Registered response encoders.
#[derive(Clone)]
pub struct ResponseEncoderRegistry {
    encoders: Vec<Arc<dyn ResponseEncoder>>,
}

impl ResponseEncoderRegistry {
    pub fn new(encoders: Vec<Arc<dyn ResponseEncoder>>) -> Self {
        Self { encoders }
    }

    /// Selects exactly one encoder for a result.
    ///
    /// Candidates must accept one of the result's tags, pass `can_handle`,
    /// and (when they declare formats) match the requested output format
    /// case-insensitively. The most specific tag wins; two candidates on the
    /// same tag are a fatal ambiguity.
    pub fn select(
        &self,
        result: &dyn OperationResult,
        operation: &Operation,
        output_format: Option<&str>,
    ) -> OwsResult<Arc<dyn ResponseEncoder>> {
        let tags = result.tags();
        let mut best: Option<(usize, &Arc<dyn ResponseEncoder>)> = None;
        let mut ambiguous = false;

        for encoder in &self.encoders {
            let Some(rank) = tags.iter().position(|t| *t == encoder.accepts()) else {
                continue;
            };
            if !encoder.can_handle(operation) {
                continue;
            }
            if let Some(format) = output_format {
                let formats = encoder.output_formats();
                if !formats.is_empty()
                    && !formats.iter().any(|f| f.eq_ignore_ascii_case(format))
                {
                    continue;
                }
            }
            match &best {
                Some((top, _)) if *top == rank => ambiguous = true,
                Some((top, _)) if *top < rank => {}
                _ => {
                    best = Some((rank, encoder));
                    ambiguous = false;
                }
            }
        }

        if ambiguous {
            let (rank, _) = best.unwrap();
            return Err(OwsError::Configuration(format!(
                "Multiple response encoders accept '{}' for operation '{}'",
                tags[rank], operation.name
            )));
        }
        match best {
            Some((_, encoder)) => Ok(Arc::clone(encoder)),
            None => Err(OwsError::Configuration(format!(
                "No response encoder for result tagged {:?} and output format {:?}",
                tags, output_format
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::VecOutput;
    use crate::service::{FunctionOperation, OperationSpec, ServiceDescriptor, SimpleService};
    use crate::version::Version;
    use bytes::Bytes;

    struct CapabilitiesResult;

    impl OperationResult for CapabilitiesResult {
        fn tags(&self) -> &'static [&'static str] {
            &["wfs-capabilities", "capabilities", "xml"]
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    struct StubEncoder {
        accepts: &'static str,
        formats: Vec<String>,
    }

    #[async_trait]
    impl ResponseEncoder for StubEncoder {
        fn accepts(&self) -> &'static str {
            self.accepts
        }

        fn output_formats(&self) -> Vec<String> {
            self.formats.clone()
        }

        fn mime_type(
            &self,
            _result: &dyn OperationResult,
            _operation: &Operation,
        ) -> OwsResult<String> {
            Ok("text/xml".to_string())
        }

        async fn write(
            &self,
            _result: &dyn OperationResult,
            output: &mut dyn OutputStrategy,
            _operation: &Operation,
        ) -> OwsResult<()> {
            output.write(Bytes::from_static(b"<caps/>")).await
        }
    }

    fn operation() -> Operation {
        let spec = Arc::new(OperationSpec::new(
            "GetCapabilities",
            vec![],
            Arc::new(FunctionOperation::new(|_, _| {
                Box::pin(async { Ok(None) })
            })),
        ));
        let descriptor = Arc::new(ServiceDescriptor::new(
            "wfs",
            Version::new(2, 0, 0),
            vec!["GetCapabilities".to_string()],
            Arc::new(SimpleService::new(vec![Arc::clone(&spec)])),
        ));
        Operation::new("GetCapabilities", descriptor, spec, vec![])
    }

    #[test]
    fn test_more_specific_tag_wins() {
        let registry = ResponseEncoderRegistry::new(vec![
            Arc::new(StubEncoder {
                accepts: "capabilities",
                formats: vec![],
            }),
            Arc::new(StubEncoder {
                accepts: "wfs-capabilities",
                formats: vec![],
            }),
        ]);

        let encoder = registry
            .select(&CapabilitiesResult, &operation(), None)
            .unwrap();
        assert_eq!(encoder.accepts(), "wfs-capabilities");
    }

    #[test]
    fn test_identical_accepted_tag_is_ambiguous() {
        let registry = ResponseEncoderRegistry::new(vec![
            Arc::new(StubEncoder {
                accepts: "capabilities",
                formats: vec![],
            }),
            Arc::new(StubEncoder {
                accepts: "capabilities",
                formats: vec![],
            }),
        ]);

        let err = registry
            .select(&CapabilitiesResult, &operation(), None)
            .unwrap_err();
        assert!(matches!(err, OwsError::Configuration(_)));
    }

    #[test]
    fn test_output_format_filter() {
        let registry = ResponseEncoderRegistry::new(vec![
            Arc::new(StubEncoder {
                accepts: "capabilities",
                formats: vec!["text/xml".to_string()],
            }),
            Arc::new(StubEncoder {
                accepts: "wfs-capabilities",
                formats: vec!["application/json".to_string()],
            }),
        ]);

        // The more specific encoder loses on format, so the generic one is
        // chosen; format comparison ignores case.
        let encoder = registry
            .select(&CapabilitiesResult, &operation(), Some("TEXT/XML"))
            .unwrap();
        assert_eq!(encoder.accepts(), "capabilities");

        let err = registry
            .select(&CapabilitiesResult, &operation(), Some("image/png"))
            .unwrap_err();
        assert!(matches!(err, OwsError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_encoder_writes_through_output_strategy() {
        let encoder = StubEncoder {
            accepts: "capabilities",
            formats: vec![],
        };
        let mut output = VecOutput::new();
        encoder
            .write(&CapabilitiesResult, &mut output, &operation())
            .await
            .unwrap();
        output.flush().await.unwrap();
        assert_eq!(output.as_bytes(), b"<caps/>");
        assert_eq!(output.flushed(), 7);
    }

    #[test]
    fn test_content_disposition_parse() {
        assert_eq!(
            ContentDisposition::parse("ATTACHMENT"),
            Some(ContentDisposition::Attachment)
        );
        assert_eq!(ContentDisposition::parse("nonsense"), None);
    }
}
