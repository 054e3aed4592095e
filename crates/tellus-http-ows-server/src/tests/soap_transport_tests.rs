//! SOAP transport and client-abort behavior over the full pipeline.

use std::sync::Arc;

use http::StatusCode;

use super::fixtures::*;

const SOAP_CAPS: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
  <soap:Header/>
  <soap:Body>
    <GetCapabilities service="WFS" version="2.0.0"/>
  </soap:Body>
</soap:Envelope>"#;

#[tokio::test]
async fn test_soap_round_trip() {
    let dispatcher = dispatcher();
    let response = dispatcher
        .dispatch(post("/ows", "application/soap+xml", SOAP_CAPS))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/soap+xml"
    );

    let body = body_text(response).await;
    assert_eq!(body.matches("<soap:Envelope").count(), 1, "body: {}", body);
    assert_eq!(body.matches("<Capabilities").count(), 1, "body: {}", body);
    assert!(body.contains("<soap:Header/>"), "body: {}", body);
    // The encoder declared a body type attribute.
    assert!(body.contains("<soap:Body type=\"xml\">"), "body: {}", body);
    assert!(body.ends_with("</soap:Body></soap:Envelope>"), "body: {}", body);
}

#[tokio::test]
async fn test_soap_fault_is_soap_wrapped() {
    let dispatcher = dispatcher();
    let envelope = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
        <soap:Body><GetMap service="WFS"/></soap:Body>
    </soap:Envelope>"#;

    let response = dispatcher
        .dispatch(post("/ows", "application/soap+xml", envelope))
        .await
        .unwrap();

    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/soap+xml"
    );
    let body = body_text(response).await;
    assert_eq!(body.matches("<soap:Envelope").count(), 1, "body: {}", body);
    assert!(body.contains("OperationNotSupported"), "body: {}", body);
    // The embedded report carries no XML declaration of its own.
    assert!(!body.contains("<?xml"), "body: {}", body);
}

#[tokio::test]
async fn test_malformed_envelope_is_a_fault() {
    let dispatcher = dispatcher();
    let envelope = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
        <soap:Header/>
    </soap:Envelope>"#;

    let response = dispatcher
        .dispatch(post("/ows", "application/soap+xml", envelope))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_text(response).await;
    assert!(body.contains("ExceptionReport"), "body: {}", body);
    assert!(body.contains("soap:Envelope"), "body: {}", body);
}

#[tokio::test]
async fn test_write_failure_is_a_client_abort_not_a_fault() {
    let dispatcher = base_builder()
        .encoder(Arc::new(CapabilitiesEncoder))
        .encoder(Arc::new(AbortingFeatureEncoder))
        .build()
        .unwrap()
        .dispatcher();

    let response = dispatcher
        .dispatch(get("/ows?service=wfs&request=GetFeature&typeNames=roads:all"))
        .await
        .unwrap();

    // The peer is gone: nothing is reported, nothing propagates.
    let body = body_text(response).await;
    assert!(body.is_empty(), "body: {}", body);
    assert!(!body.contains("ExceptionReport"));
}
