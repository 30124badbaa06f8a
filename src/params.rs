//! Request parameter extraction.
//!
//! GET requests carry no explicit parameters here: their query string rides
//! the target URL and feeds key derivation verbatim. POST bodies are decoded
//! according to the declared content type (`application/x-www-form-urlencoded`
//! or `multipart/form-data`); any other content type contributes no
//! parameters. A field that appears more than once is flattened into a single
//! comma-joined value before it is sent upstream or used in the cache key.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use thiserror::Error;
use url::form_urlencoded;

use crate::http::{Method, Request};

/// Parameter map keyed in sorted order, so serializing it is independent of
/// insertion order.
pub type ParamMap = BTreeMap<String, String>;

/// Errors raised by POST body decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BodyError {
    #[error("multipart content type is missing its boundary parameter")]
    MissingBoundary,

    #[error("malformed multipart payload")]
    MalformedMultipart,
}

/// Extracts the explicit parameter map from a request.
///
/// # Errors
///
/// [`BodyError`] for multipart bodies that cannot be decoded. Urlencoded
/// decoding is total and never fails.
pub fn from_request(req: &Request) -> Result<ParamMap, BodyError> {
    if *req.method() != Method::Post {
        return Ok(ParamMap::new());
    }
    let Some(content_type) = req.content_type() else {
        return Ok(ParamMap::new());
    };

    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    match media_type.as_str() {
        "application/x-www-form-urlencoded" => Ok(flatten(parse_urlencoded(req.body()))),
        "multipart/form-data" => {
            let boundary = boundary_param(content_type).ok_or(BodyError::MissingBoundary)?;
            Ok(flatten(parse_multipart(req.body(), &boundary)?))
        }
        _ => Ok(ParamMap::new()),
    }
}

/// Decodes `k=v&k2=v2` pairs, percent-encoding and `+` included. Blank values
/// are kept: `a=&b` yields `a=""` and `b=""`.
fn parse_urlencoded(body: &[u8]) -> Vec<(String, String)> {
    form_urlencoded::parse(body)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Pulls the `boundary` parameter out of a `multipart/form-data` content type.
fn boundary_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_owned())
    })
}

/// Minimal `multipart/form-data` decoder: walks `--boundary` delimiters,
/// takes the `name` from each part's `Content-Disposition`, and returns the
/// part bodies as (lossy) strings. Nested multipart and transfer encodings
/// are not supported.
fn parse_multipart(body: &[u8], boundary: &str) -> Result<Vec<(String, String)>, BodyError> {
    let delimiter = format!("--{boundary}");
    let delim = delimiter.as_bytes();

    let start = find(body, delim).ok_or(BodyError::MalformedMultipart)?;
    let mut rest = &body[start + delim.len()..];

    let mut fields = Vec::new();
    loop {
        if rest.starts_with(b"--") {
            // Closing delimiter.
            break;
        }
        let part_start = rest
            .strip_prefix(b"\r\n")
            .ok_or(BodyError::MalformedMultipart)?;
        let end = find(part_start, delim).ok_or(BodyError::MalformedMultipart)?;
        let part = &part_start[..end];
        rest = &part_start[end + delim.len()..];

        // The CRLF before the next delimiter belongs to the framing, not the value.
        let part = part.strip_suffix(b"\r\n").unwrap_or(part);
        if let Some(field) = parse_part(part) {
            fields.push(field);
        }
    }
    Ok(fields)
}

/// Splits one part into its headers and value; yields the field only if a
/// `Content-Disposition` names it.
fn parse_part(part: &[u8]) -> Option<(String, String)> {
    let sep = find(part, b"\r\n\r\n")?;
    let head = String::from_utf8_lossy(&part[..sep]);
    let value = String::from_utf8_lossy(&part[sep + 4..]).into_owned();

    head.split("\r\n")
        .find(|line| {
            line.to_ascii_lowercase()
                .starts_with("content-disposition:")
        })
        .and_then(field_name)
        .map(|name| (name, value))
}

/// Extracts `name="..."` from a `Content-Disposition` line. Parameters are
/// matched whole, so a `filename` parameter cannot shadow the field name.
fn field_name(line: &str) -> Option<String> {
    line.split(';').find_map(|param| {
        let (name, value) = param.trim().split_once('=')?;
        (name.trim() == "name").then(|| value.trim().trim_matches('"').to_owned())
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Groups repeated field names into one comma-joined value, preserving the
/// order the values appeared in.
fn flatten(pairs: Vec<(String, String)>) -> ParamMap {
    let mut map = ParamMap::new();
    for (key, value) in pairs {
        match map.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(mut slot) => {
                let joined = slot.get_mut();
                joined.push(',');
                joined.push_str(&value);
            }
        }
    }
    map
}
