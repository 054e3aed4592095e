//! SOAP envelope processing.
//!
//! Incoming SOAP requests carry exactly one `Body` element with exactly one
//! payload child; the payload subtree becomes the effective XML body, with
//! the namespace declarations of the stripped ancestors re-applied to its
//! root. Outgoing responses are wrapped in an envelope using the same
//! namespace.

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;
use quick_xml::{Reader, Writer};
use quick_xml::events::{BytesStart, Event};

use tellus_ows::error::ServiceException;
use tellus_ows::output::OutputStrategy;
use tellus_ows::{OwsResult, SOAP_MIME, SOAP_NAMESPACE};

fn fault(message: impl Into<String>) -> tellus_ows::OwsError {
    ServiceException::new(message.into()).into()
}

/// Whether a POST content type selects the SOAP transport.
pub fn is_soap(content_type: &str) -> bool {
    content_type
        .trim_start()
        .to_ascii_lowercase()
        .starts_with(SOAP_MIME)
}

/// Extracts the payload of a SOAP envelope as a standalone document.
pub fn unwrap_envelope(text: &str) -> OwsResult<String> {
    let mut reader = Reader::from_str(text);
    let mut writer = Writer::new(Vec::new());

    let mut depth = 0usize;
    let mut envelope_decls: Vec<(String, String)> = Vec::new();
    let mut body_decls: Vec<(String, String)> = Vec::new();
    let mut body_count = 0;
    let mut in_body = false;
    let mut payload_open = 0usize;
    let mut payload_done = false;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| fault(format!("Malformed SOAP envelope: {}", e)))?;
        match event {
            Event::Eof => break,
            Event::Start(e) => {
                depth += 1;
                if depth == 1 {
                    if local_name(&e) != "Envelope" {
                        return Err(fault("Root element is not a SOAP Envelope"));
                    }
                    envelope_decls = xmlns_decls(&e)?;
                } else if depth == 2 && local_name(&e) == "Body" {
                    body_count += 1;
                    if body_count > 1 {
                        return Err(fault("SOAP envelope contains more than one Body"));
                    }
                    in_body = true;
                    body_decls = xmlns_decls(&e)?;
                } else if in_body && payload_open == 0 && !payload_done && depth == 3 {
                    payload_open = 1;
                    let root = payload_root(&e, &envelope_decls, &body_decls)?;
                    writer.write_event(Event::Start(root))?;
                } else if payload_open > 0 {
                    payload_open += 1;
                    writer.write_event(Event::Start(e))?;
                }
            }
            Event::Empty(e) => {
                if depth == 1 && local_name(&e) == "Body" {
                    body_count += 1;
                    if body_count > 1 {
                        return Err(fault("SOAP envelope contains more than one Body"));
                    }
                } else if in_body && payload_open == 0 && !payload_done && depth == 2 {
                    let root = payload_root(&e, &envelope_decls, &body_decls)?;
                    writer.write_event(Event::Empty(root))?;
                    payload_done = true;
                } else if payload_open > 0 {
                    writer.write_event(Event::Empty(e))?;
                }
            }
            Event::End(e) => {
                if payload_open > 0 {
                    writer.write_event(Event::End(e))?;
                    payload_open -= 1;
                    if payload_open == 0 {
                        payload_done = true;
                    }
                } else if in_body && depth == 2 {
                    in_body = false;
                }
                depth = depth.saturating_sub(1);
            }
            Event::Text(e) => {
                if payload_open > 0 {
                    writer.write_event(Event::Text(e))?;
                }
            }
            Event::CData(e) => {
                if payload_open > 0 {
                    writer.write_event(Event::CData(e))?;
                }
            }
            _ => {}
        }
    }

    if body_count == 0 {
        return Err(fault("SOAP envelope has no Body"));
    }
    if !payload_done {
        return Err(fault("SOAP Body has no payload element"));
    }

    String::from_utf8(writer.into_inner())
        .map_err(|_| fault("SOAP payload is not valid UTF-8"))
}

/// Writes the opening envelope and body wrapper of a SOAP response.
pub async fn write_envelope_open(
    output: &mut dyn OutputStrategy,
    body_type: Option<&str>,
) -> OwsResult<()> {
    let mut open = format!(
        "<soap:Envelope xmlns:soap=\"{}\"><soap:Header/><soap:Body",
        SOAP_NAMESPACE
    );
    if let Some(body_type) = body_type {
        open.push_str(" type=\"");
        open.push_str(body_type);
        open.push('"');
    }
    open.push('>');
    output.write(Bytes::from(open)).await
}

/// Writes the closing wrapper of a SOAP response.
pub async fn write_envelope_close(output: &mut dyn OutputStrategy) -> OwsResult<()> {
    output
        .write(Bytes::from_static(b"</soap:Body></soap:Envelope>"))
        .await
}

/// Wraps an already rendered fault document in a SOAP envelope.
pub fn wrap_fault(fragment: &[u8]) -> Bytes {
    let mut body = format!(
        "<soap:Envelope xmlns:soap=\"{}\"><soap:Header/><soap:Body>",
        SOAP_NAMESPACE
    )
    .into_bytes();
    body.extend_from_slice(fragment);
    body.extend_from_slice(b"</soap:Body></soap:Envelope>");
    Bytes::from(body)
}

fn local_name(element: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(element.local_name().as_ref()).to_string()
}

fn xmlns_decls(element: &BytesStart<'_>) -> OwsResult<Vec<(String, String)>> {
    let mut decls = Vec::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| fault(format!("Malformed attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        if key == "xmlns" || key.starts_with("xmlns:") {
            let value = attr
                .unescape_value()
                .map_err(|e| fault(format!("Malformed attribute value: {}", e)))?
                .into_owned();
            decls.push((key, value));
        }
    }
    Ok(decls)
}

/// Rebuilds the payload root, re-applying in-scope namespace declarations
/// that were declared on the stripped Envelope or Body.
fn payload_root<'a>(
    element: &BytesStart<'a>,
    envelope_decls: &[(String, String)],
    body_decls: &[(String, String)],
) -> OwsResult<BytesStart<'static>> {
    let name = String::from_utf8_lossy(element.name().as_ref()).to_string();
    let mut root = BytesStart::new(name);

    let mut declared: HashSet<String> = HashSet::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| fault(format!("Malformed attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| fault(format!("Malformed attribute value: {}", e)))?
            .into_owned();
        if key == "xmlns" || key.starts_with("xmlns:") {
            declared.insert(key.clone());
        }
        root.push_attribute((key.as_str(), value.as_str()));
    }

    // Inner declarations shadow outer ones.
    let mut inherited: BTreeMap<&str, &str> = BTreeMap::new();
    for (key, value) in envelope_decls.iter().chain(body_decls.iter()) {
        inherited.insert(key.as_str(), value.as_str());
    }
    for (key, value) in inherited {
        if key != "xmlns" && !key.starts_with("xmlns:") {
            continue;
        }
        // The SOAP namespace itself has no business on the payload.
        if value == SOAP_NAMESPACE {
            continue;
        }
        if !declared.contains(key) {
            root.push_attribute((key, value));
        }
    }

    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::sniff_root;

    const ENVELOPE: &str = r#"<?xml version="1.0"?>
<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope"
               xmlns:wfs="http://acme.example/wfs">
  <soap:Header/>
  <soap:Body>
    <wfs:GetFeature service="WFS" version="2.0.0">
      <wfs:Query typeNames="roads"/>
    </wfs:GetFeature>
  </soap:Body>
</soap:Envelope>"#;

    #[test]
    fn test_unwrap_reapplies_namespace_declarations() {
        let payload = unwrap_envelope(ENVELOPE).unwrap();
        let root = sniff_root(&payload, 8192).unwrap();
        assert_eq!(root.local_name, "GetFeature");
        assert_eq!(root.namespace.as_deref(), Some("http://acme.example/wfs"));
        assert_eq!(root.attribute("service"), Some("WFS"));
        assert!(payload.contains("typeNames=\"roads\""));
        // The envelope itself is gone.
        assert!(!payload.contains("soap:Envelope"));
    }

    #[test]
    fn test_self_closing_payload() {
        let envelope = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
            <soap:Body><GetCapabilities service="WFS"/></soap:Body>
        </soap:Envelope>"#;
        let payload = unwrap_envelope(envelope).unwrap();
        let root = sniff_root(&payload, 8192).unwrap();
        assert_eq!(root.local_name, "GetCapabilities");
    }

    #[test]
    fn test_missing_body_is_a_fault() {
        let envelope = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
            <soap:Header/>
        </soap:Envelope>"#;
        let err = unwrap_envelope(envelope).unwrap_err();
        assert!(err.to_string().contains("no Body"));
    }

    #[test]
    fn test_duplicate_body_is_a_fault() {
        let envelope = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
            <soap:Body><A/></soap:Body>
            <soap:Body><B/></soap:Body>
        </soap:Envelope>"#;
        let err = unwrap_envelope(envelope).unwrap_err();
        assert!(err.to_string().contains("more than one Body"));
    }

    #[test]
    fn test_empty_body_is_a_fault() {
        let envelope = r#"<soap:Envelope xmlns:soap="http://www.w3.org/2003/05/soap-envelope">
            <soap:Body>   </soap:Body>
        </soap:Envelope>"#;
        let err = unwrap_envelope(envelope).unwrap_err();
        assert!(err.to_string().contains("no payload"));
    }

    #[tokio::test]
    async fn test_envelope_wrapping() {
        let mut output = tellus_ows::output::VecOutput::new();
        write_envelope_open(&mut output, Some("xml")).await.unwrap();
        output
            .write(Bytes::from_static(b"<Caps/>"))
            .await
            .unwrap();
        write_envelope_close(&mut output).await.unwrap();

        let text = String::from_utf8(output.as_bytes().to_vec()).unwrap();
        assert!(text.starts_with("<soap:Envelope"));
        assert!(text.contains("<soap:Body type=\"xml\"><Caps/></soap:Body>"));
        assert!(text.ends_with("</soap:Envelope>"));
    }
}
