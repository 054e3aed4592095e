//! Buffered request bodies.
//!
//! The whole XML payload is buffered so it can be re-read by any request
//! reader. Charset detection looks at the byte-order mark first, then the
//! XML declaration inside the look-ahead window, and defaults to UTF-8. The
//! root element must begin within the look-ahead; exceeding it is malformed
//! input, never a silent truncation.

use std::collections::HashMap;

use bytes::Bytes;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};

use tellus_ows::error::ServiceException;
use tellus_ows::request::{XmlBody, XmlRoot};
use tellus_ows::OwsResult;

fn malformed(message: impl Into<String>) -> tellus_ows::OwsError {
    ServiceException::new(message.into()).into()
}

/// Buffers and decodes a request body.
///
/// A zero-byte body is tolerated and yields `None`: XML parsing is simply
/// skipped for the exchange.
pub fn buffer_body(bytes: Bytes, lookahead: usize) -> OwsResult<Option<XmlBody>> {
    if bytes.is_empty() {
        return Ok(None);
    }
    let text = decode_text(&bytes, lookahead)?;
    let root = sniff_root(&text, lookahead)?;
    Ok(Some(XmlBody {
        raw: bytes,
        text,
        root,
    }))
}

/// Decodes body bytes to text, honoring BOM and XML-declaration charsets.
pub fn decode_text(bytes: &[u8], lookahead: usize) -> OwsResult<String> {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return utf8(&bytes[3..]);
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return utf16(&bytes[2..], false);
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return utf16(&bytes[2..], true);
    }

    let window = &bytes[..bytes.len().min(lookahead)];
    match declared_encoding(window) {
        Some(name) => {
            let name = name.to_ascii_lowercase();
            match name.as_str() {
                "utf-8" | "utf8" => utf8(bytes),
                "iso-8859-1" | "latin1" => Ok(bytes.iter().map(|&b| b as char).collect()),
                "utf-16" | "utf-16le" | "utf-16be" => Err(malformed(
                    "UTF-16 request body without a byte-order mark",
                )),
                other => Err(malformed(format!(
                    "Unsupported request body encoding '{}'",
                    other
                ))),
            }
        }
        None => utf8(bytes),
    }
}

fn utf8(bytes: &[u8]) -> OwsResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| malformed("Request body is not valid UTF-8"))
}

fn utf16(bytes: &[u8], big_endian: bool) -> OwsResult<String> {
    if bytes.len() % 2 != 0 {
        return Err(malformed("Truncated UTF-16 request body"));
    }
    let units = bytes.chunks_exact(2).map(|pair| {
        if big_endian {
            u16::from_be_bytes([pair[0], pair[1]])
        } else {
            u16::from_le_bytes([pair[0], pair[1]])
        }
    });
    char::decode_utf16(units)
        .collect::<std::result::Result<String, _>>()
        .map_err(|_| malformed("Request body is not valid UTF-16"))
}

/// Extracts the `encoding` pseudo-attribute of an XML declaration, if the
/// window starts with one.
fn declared_encoding(window: &[u8]) -> Option<String> {
    let text: String = window.iter().map(|&b| b as char).collect();
    let trimmed = text.trim_start();
    if !trimmed.starts_with("<?xml") {
        return None;
    }
    let end = trimmed.find("?>")?;
    let decl = &trimmed[..end];
    let at = decl.find("encoding")?;
    let rest = &decl[at + "encoding".len()..];
    let rest = rest.trim_start().strip_prefix('=')?.trim_start();
    let quote = rest.chars().next()?;
    if quote != '"' && quote != '\'' {
        return None;
    }
    let rest = &rest[1..];
    let close = rest.find(quote)?;
    Some(rest[..close].to_string())
}

/// Extracts the root element within the look-ahead window.
pub fn sniff_root(text: &str, lookahead: usize) -> OwsResult<XmlRoot> {
    let mut reader = Reader::from_str(text);
    loop {
        let position = reader.buffer_position() as u64;
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if position > lookahead as u64 {
                    return Err(malformed(format!(
                        "Root element does not start within the first {} bytes",
                        lookahead
                    )));
                }
                return root_of(&e);
            }
            Ok(Event::Text(t)) => {
                if !t.as_ref().iter().all(u8::is_ascii_whitespace) {
                    return Err(malformed("Content before the root element"));
                }
            }
            Ok(Event::Eof) => return Err(malformed("Request body has no root element")),
            Ok(_) => {}
            Err(err) => return Err(malformed(format!("Malformed XML request: {}", err))),
        }
    }
}

fn root_of(element: &BytesStart<'_>) -> OwsResult<XmlRoot> {
    let qname = String::from_utf8_lossy(element.name().as_ref()).to_string();
    let (prefix, local_name) = match qname.split_once(':') {
        Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
        None => (None, qname.clone()),
    };

    let mut attributes = HashMap::new();
    let mut default_ns = None;
    let mut prefixed_ns: HashMap<String, String> = HashMap::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| malformed(format!("Malformed attribute: {}", e)))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| malformed(format!("Malformed attribute value: {}", e)))?
            .into_owned();
        if key == "xmlns" {
            default_ns = Some(value);
        } else if let Some(p) = key.strip_prefix("xmlns:") {
            prefixed_ns.insert(p.to_string(), value);
        } else {
            attributes.insert(key, value);
        }
    }

    let namespace = match prefix {
        Some(p) => prefixed_ns.get(&p).cloned(),
        None => default_ns,
    };

    Ok(XmlRoot {
        namespace,
        local_name,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOOKAHEAD: usize = 8192;

    #[test]
    fn test_empty_body_skips_xml() {
        assert!(buffer_body(Bytes::new(), LOOKAHEAD).unwrap().is_none());
    }

    #[test]
    fn test_root_with_namespace_and_attributes() {
        let xml = r#"<?xml version="1.0"?>
            <!-- a leading comment -->
            <wfs:GetFeature xmlns:wfs="http://acme.example/wfs"
                service="WFS" version="2.0.0"/>"#;
        let body = buffer_body(Bytes::from(xml), LOOKAHEAD).unwrap().unwrap();
        assert_eq!(body.root.local_name, "GetFeature");
        assert_eq!(
            body.root.namespace.as_deref(),
            Some("http://acme.example/wfs")
        );
        assert_eq!(body.root.attribute("service"), Some("WFS"));
        assert_eq!(body.root.attribute("version"), Some("2.0.0"));
    }

    #[test]
    fn test_default_namespace() {
        let xml = r#"<GetCapabilities xmlns="http://acme.example/wcs" service="WCS"/>"#;
        let root = sniff_root(xml, LOOKAHEAD).unwrap();
        assert_eq!(root.namespace.as_deref(), Some("http://acme.example/wcs"));
    }

    #[test]
    fn test_utf16_little_endian_bom() {
        let xml = "<GetCapabilities service=\"WFS\"/>";
        let mut bytes = vec![0xFF, 0xFE];
        for unit in xml.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let body = buffer_body(Bytes::from(bytes), LOOKAHEAD).unwrap().unwrap();
        assert_eq!(body.root.local_name, "GetCapabilities");
    }

    #[test]
    fn test_declared_latin1_encoding() {
        let xml = b"<?xml version=\"1.0\" encoding=\"ISO-8859-1\"?><Caf\xe9/>".to_vec();
        let text = decode_text(&xml, LOOKAHEAD).unwrap();
        assert!(text.contains("Caf\u{e9}"));
    }

    #[test]
    fn test_root_beyond_lookahead_is_malformed() {
        let mut xml = String::from("<?xml version=\"1.0\"?><!--");
        xml.push_str(&"x".repeat(64));
        xml.push_str("--><GetCapabilities/>");
        let err = sniff_root(&xml, 32).unwrap_err();
        assert!(err.to_string().contains("within the first"));
    }

    #[test]
    fn test_garbage_body_is_malformed() {
        assert!(buffer_body(Bytes::from_static(b"not xml at all"), LOOKAHEAD).is_err());
        assert!(buffer_body(Bytes::from_static(b"   "), LOOKAHEAD).is_err());
    }
}
