//! Proxied-request parsing
//!
//! The gateway sits behind a reverse proxy that forwards the original
//! request in `X-Original-*` headers; those override whatever the proxy
//! connection itself carries. The parsed form feeds both the policy
//! input's `request` block and the orchestrator's routing decisions.

use axum::http::{HeaderMap, Method, Uri};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{GatewayError, Result};

/// Semantic operation derived from the HTTP verb and path shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    List,
    Read,
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::List => "LIST",
            Self::Read => "READ",
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }

    fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LIST" => Ok(Self::List),
            "READ" => Ok(Self::Read),
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(GatewayError::BadRequest(format!(
                "unknown operation {other:?}"
            ))),
        }
    }

    /// Verb alias table
    fn from_method(method: &str) -> Result<Self> {
        match method {
            "GET" => Ok(Self::Read),
            "POST" => Ok(Self::Create),
            "PATCH" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(GatewayError::BadRequest(format!(
                "method {other:?} is not proxied"
            ))),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fully parsed inbound request
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub action: Action,
    pub method: String,
    pub host: String,
    pub remote_addr: String,
    /// Every path segment of the (original) URI, in order
    pub path: Vec<String>,
    pub query: BTreeMap<String, Vec<String>>,
    /// TMF API family, first trimmed segment
    pub api: String,
    /// Resource name, second trimmed segment
    pub resource: String,
    /// Object id, third trimmed segment when present
    pub id: Option<String>,
    /// Raw `Authorization` header value, if any
    pub authorization: Option<String>,
}

impl ProxiedRequest {
    /// Parse a request, honoring `X-Original-*` overrides
    ///
    /// `require_original` is set on the pure-PDP endpoint, where the
    /// request's own URI is the PDP path and only the header carries the
    /// proxied one.
    pub fn parse(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        require_original: bool,
    ) -> Result<Self> {
        let original_uri = header_str(headers, "X-Original-URI");
        if require_original && original_uri.is_none() {
            return Err(GatewayError::BadRequest(
                "X-Original-URI header is required".into(),
            ));
        }

        let (raw_path, raw_query) = match original_uri {
            Some(orig) => split_uri(orig)?,
            None => (
                uri.path().to_string(),
                uri.query().unwrap_or("").to_string(),
            ),
        };

        let method = header_str(headers, "X-Original-Method")
            .map(|m| m.to_ascii_uppercase())
            .unwrap_or_else(|| method.as_str().to_string());

        let path = path_segments(&raw_path);
        let trimmed = trim_segments(&path);
        if trimmed.len() < 2 {
            return Err(GatewayError::BadRequest(format!(
                "path {raw_path:?} has fewer than two segments"
            )));
        }
        let api = trimmed[0].clone();
        let resource = trimmed[1].clone();
        let id = trimmed.get(2).cloned();

        let mut action = match header_str(headers, "X-Original-Operation") {
            Some(op) => Action::parse(op)?,
            None => Action::from_method(&method)?,
        };
        // A collection READ is a LIST.
        if action == Action::Read && id.is_none() {
            action = Action::List;
        }

        let host = header_str(headers, "X-Original-Host")
            .map(str::to_string)
            .or_else(|| header_str(headers, "Host").map(str::to_string))
            .unwrap_or_default();
        let remote_addr = header_str(headers, "X-Original-Remote-Addr")
            .map(str::to_string)
            .unwrap_or_default();

        Ok(Self {
            action,
            method,
            host,
            remote_addr,
            path,
            query: parse_query(&raw_query)?,
            api,
            resource,
            id,
            authorization: header_str(headers, "Authorization").map(str::to_string),
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
}

/// Split an absolute or path-relative URI into path and query
fn split_uri(raw: &str) -> Result<(String, String)> {
    let uri: Uri = raw
        .parse()
        .map_err(|_| GatewayError::BadRequest(format!("malformed X-Original-URI {raw:?}")))?;
    Ok((
        uri.path().to_string(),
        uri.query().unwrap_or("").to_string(),
    ))
}

fn path_segments(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Strip the `tmf-api` prefix and the version segment, leaving
/// `[api, resource, id?]`
fn trim_segments(segments: &[String]) -> Vec<String> {
    let mut out: Vec<String> = segments
        .iter()
        .filter(|s| *s != "tmf-api")
        .cloned()
        .collect();
    if out.len() > 1 && is_version_segment(&out[1]) {
        out.remove(1);
    }
    out
}

fn is_version_segment(s: &str) -> bool {
    let mut chars = s.chars();
    chars.next() == Some('v') && chars.as_str().chars().all(|c| c.is_ascii_digit())
        && s.len() > 1
}

/// Parse a query string into a map of key → values
///
/// Repeated keys and comma-separated values both flatten into the value
/// sequence. A semicolon separator is rejected rather than guessed at.
pub fn parse_query(raw: &str) -> Result<BTreeMap<String, Vec<String>>> {
    let mut query: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if raw.is_empty() {
        return Ok(query);
    }
    if raw.contains(';') {
        return Err(GatewayError::BadRequest(
            "semicolon query separators are not supported".into(),
        ));
    }
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_decode(key)?;
        let value = percent_decode(value)?;
        let slot = query.entry(key).or_default();
        if value.is_empty() {
            continue;
        }
        for part in value.split(',') {
            if !part.is_empty() {
                slot.push(part.to_string());
            }
        }
    }
    Ok(query)
}

/// Inverse of [`parse_query`]: keys sorted, one `k=v` pair per value
pub fn marshal_query(query: &BTreeMap<String, Vec<String>>) -> String {
    let mut pairs = Vec::new();
    for (key, values) in query {
        if values.is_empty() {
            pairs.push(percent_encode(key));
            continue;
        }
        for value in values {
            pairs.push(format!("{}={}", percent_encode(key), percent_encode(value)));
        }
    }
    pairs.join("&")
}

fn percent_decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).ok_or_else(|| {
                    GatewayError::BadRequest(format!("truncated percent escape in {s:?}"))
                })?;
                let hex = std::str::from_utf8(hex)
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        GatewayError::BadRequest(format!("bad percent escape in {s:?}"))
                    })?;
                out.push(hex);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out)
        .map_err(|_| GatewayError::BadRequest(format!("query value {s:?} is not UTF-8")))
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b':' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}
