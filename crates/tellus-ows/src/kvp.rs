//! KVP normalization, tokenization and typed parameter parsing.
//!
//! Keys are trimmed and lower-cased; value casing is never touched. Parsed
//! values use `serde_json::Value` as the common currency, so a key with no
//! registered parser simply stays a string.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::OwsResult;
use crate::error::OwsError;
use crate::version::Version;

/// Produces the case-insensitive KVP mapping from raw query pairs.
///
/// The first value wins for repeated keys.
pub fn normalize<I, K, V>(pairs: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    let mut map = HashMap::new();
    for (key, value) in pairs {
        let key = key.as_ref().trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        map.entry(key).or_insert_with(|| value.into());
    }
    map
}

/// Splits a flat list on a delimiter, trimming each token.
pub fn flat_tokens(value: &str, delimiter: char) -> Vec<String> {
    value
        .split(delimiter)
        .map(|t| t.trim().to_string())
        .collect()
}

/// Splits nested "(a,b)(c,d)" groups, stripping the surrounding parentheses.
///
/// A value with no leading parenthesis is a single group.
pub fn grouped_tokens(value: &str) -> OwsResult<Vec<String>> {
    let value = value.trim();
    if !value.starts_with('(') {
        return Ok(vec![value.to_string()]);
    }

    let mut groups = Vec::new();
    let mut rest = value;
    while !rest.is_empty() {
        if !rest.starts_with('(') {
            return Err(OwsError::from(
                crate::error::ServiceException::invalid_parameter(
                    "value",
                    format!("Malformed nested value '{}'", value),
                ),
            ));
        }
        match rest.find(')') {
            Some(end) => {
                groups.push(rest[1..end].to_string());
                rest = rest[end + 1..].trim_start();
            }
            None => {
                return Err(OwsError::from(
                    crate::error::ServiceException::invalid_parameter(
                        "value",
                        format!("Unbalanced parenthesis in '{}'", value),
                    ),
                ));
            }
        }
    }
    Ok(groups)
}

/// Splits on a delimiter while honoring backslash escapes.
///
/// Escape sequences are preserved unresolved; resolve them with [`unescape`]
/// in a separate pass.
pub fn escaped_tokens(value: &str, delimiter: char) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == delimiter {
            tokens.push(current);
            current = String::new();
        } else {
            current.push(c);
        }
    }
    tokens.push(current);
    tokens
}

/// Resolves backslash escapes produced by [`escaped_tokens`].
pub fn unescape(value: &str) -> OwsResult<String> {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next) => out.push(next),
                None => {
                    return Err(OwsError::from(
                        crate::error::ServiceException::invalid_parameter(
                            "value",
                            format!("Dangling escape in '{}'", value),
                        ),
                    ));
                }
            }
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Converts the string value of one KVP key into a typed value.
pub trait KvpParser: Send + Sync {
    /// The key this parser handles, matched case-insensitively.
    fn key(&self) -> &str;

    /// Restricts this parser to one service id.
    fn service(&self) -> Option<&str> {
        None
    }

    /// Restricts this parser to one service version.
    fn version(&self) -> Option<Version> {
        None
    }

    /// Restricts this parser to one operation name.
    fn request(&self) -> Option<&str> {
        None
    }

    fn parse(&self, value: &str) -> OwsResult<Value>;
}

/// Registered KVP parsers, looked up by key with specificity tie-breaks.
#[derive(Clone)]
pub struct KvpParserRegistry {
    parsers: Vec<Arc<dyn KvpParser>>,
}

impl KvpParserRegistry {
    pub fn new(parsers: Vec<Arc<dyn KvpParser>>) -> Self {
        Self { parsers }
    }

    /// Parses every entry of the normalized raw mapping.
    ///
    /// Individual value failures are collected softly (the first is returned
    /// alongside the parsed map) so that service classification can finish
    /// before faulting. An ambiguous parser registration is a hard
    /// configuration error raised immediately.
    pub fn parse(
        &self,
        raw: &HashMap<String, String>,
        service: Option<&str>,
        version: Option<Version>,
        request: Option<&str>,
    ) -> OwsResult<(HashMap<String, Value>, Option<OwsError>)> {
        let mut parsed = HashMap::new();
        let mut first_error = None;

        for (key, value) in raw {
            match self.find(key, service, version, request)? {
                Some(parser) => match parser.parse(value) {
                    Ok(v) => {
                        parsed.insert(key.clone(), v);
                    }
                    Err(err) => {
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                        parsed.insert(key.clone(), Value::String(value.clone()));
                    }
                },
                None => {
                    parsed.insert(key.clone(), Value::String(value.clone()));
                }
            }
        }

        Ok((parsed, first_error))
    }

    /// Finds the most specific parser for a key, if any.
    pub fn find(
        &self,
        key: &str,
        service: Option<&str>,
        version: Option<Version>,
        request: Option<&str>,
    ) -> OwsResult<Option<&Arc<dyn KvpParser>>> {
        let mut best: Option<(u32, &Arc<dyn KvpParser>)> = None;
        let mut tied = false;

        for parser in &self.parsers {
            if !parser.key().eq_ignore_ascii_case(key) {
                continue;
            }
            let score = match specificity(
                parser.service(),
                parser.version(),
                parser.request(),
                service,
                version,
                request,
            ) {
                Some(score) => score,
                None => continue,
            };
            match &best {
                Some((top, _)) if *top == score => tied = true,
                Some((top, _)) if *top > score => {}
                _ => {
                    best = Some((score, parser));
                    tied = false;
                }
            }
        }

        if tied {
            return Err(OwsError::Configuration(format!(
                "Multiple equally specific KVP parsers registered for key '{}'",
                key
            )));
        }
        Ok(best.map(|(_, p)| p))
    }
}

/// Scores how specifically a registration matches the negotiated request.
///
/// `None` means the registration is not applicable at all; otherwise a
/// declared-and-matched service beats a declared-and-matched version beats a
/// declared-and-matched request name.
pub(crate) fn specificity(
    decl_service: Option<&str>,
    decl_version: Option<Version>,
    decl_request: Option<&str>,
    service: Option<&str>,
    version: Option<Version>,
    request: Option<&str>,
) -> Option<u32> {
    let mut score = 0;
    if let Some(decl) = decl_service {
        match service {
            Some(s) if decl.eq_ignore_ascii_case(s) => score += 4,
            _ => return None,
        }
    }
    if let Some(decl) = decl_version {
        match version {
            Some(v) if decl == v => score += 2,
            _ => return None,
        }
    }
    if let Some(decl) = decl_request {
        match request {
            Some(r) if decl.eq_ignore_ascii_case(r) => score += 1,
            _ => return None,
        }
    }
    Some(score)
}
