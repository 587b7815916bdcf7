//! Request matching logic.
//!
//! Walks the compiled rule list in declaration order and returns the first
//! rule whose method, path, header and body predicates all accept, together
//! with the variable environment captured from the body.

use crate::rules::{CompiledHeaderRule, CompiledRule, Env};
use bytes::Bytes;
use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::debug;

/// The parts of an incoming request the engine looks at. Built by the
/// server layer; the body is buffered in full and headers are flattened to
/// one `"Key: Value"` line per value.
#[derive(Debug, Clone, Default)]
pub struct RequestParts {
    pub method: String,
    pub path: String,
    pub header_lines: Vec<String>,
    pub body: Bytes,
}

/// Find the first rule matching the request.
///
/// `Ok(None)` means no rule matched and the caller responds 404. `Err` is an
/// internal matcher failure and surfaces as a 500.
pub fn find_match<'a>(
    rules: &'a [CompiledRule],
    request: &RequestParts,
) -> anyhow::Result<Option<(&'a CompiledRule, Env)>> {
    for rule in rules {
        if rule.method != request.method {
            debug!(
                rule = %rule.display_name(),
                expected = %rule.method,
                got = %request.method,
                "method does not match"
            );
            continue;
        }

        if !path_matches(&rule.path_segments, &request.path) {
            debug!(rule = %rule.display_name(), path = %request.path, "path does not match");
            continue;
        }

        if !headers_match(&rule.headers, &request.header_lines) {
            debug!(rule = %rule.display_name(), "headers do not match");
            continue;
        }

        let mut env = Env::new();
        match &rule.body {
            None => return Ok(Some((rule, env))),
            Some(matcher) => {
                let observed = parse_body(&request.body);
                if matcher.matches(&observed, &mut env)? {
                    return Ok(Some((rule, env)));
                }
                // Partial bindings of a failed match die with this env.
                debug!(rule = %rule.display_name(), "body does not match");
            }
        }
    }

    Ok(None)
}

/// Segment-wise path match. Counts must agree after trimming one leading
/// slash; each compiled segment regex is applied to the corresponding
/// request segment (unanchored).
fn path_matches(segments: &[Regex], path: &str) -> bool {
    let request_segments: Vec<&str> = path.strip_prefix('/').unwrap_or(path).split('/').collect();

    if request_segments.len() != segments.len() {
        return false;
    }

    segments
        .iter()
        .zip(&request_segments)
        .all(|(regex, segment)| regex.is_match(segment))
}

fn headers_match(rules: &[CompiledHeaderRule], lines: &[String]) -> bool {
    rules.iter().all(|rule| match rule {
        CompiledHeaderRule::Include(regex) => lines.iter().any(|line| regex.is_match(line)),
        CompiledHeaderRule::Exclude(regex) => !lines.iter().any(|line| regex.is_match(line)),
    })
}

/// Interpret the buffered body for the matcher: a JSON object, array or
/// number parses as itself; everything else (including bare strings,
/// booleans and malformed JSON) is fed through as the raw body text.
fn parse_body(body: &[u8]) -> JsonValue {
    let text = String::from_utf8_lossy(body);
    match serde_json::from_str::<JsonValue>(&text) {
        Ok(value @ (JsonValue::Object(_) | JsonValue::Array(_) | JsonValue::Number(_))) => value,
        _ => JsonValue::String(text.into_owned()),
    }
}
