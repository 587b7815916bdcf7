//! Response rendering with variable interpolation.
//!
//! Turns the response template of a matched rule into status, headers and
//! body. String leaves of the body tree are scanned for `{{name}}`
//! references: a leaf that is exactly one reference becomes the variable's
//! typed JSON value, embedded references are replaced by their decimal text.

use crate::rules::{CompiledRule, Env};
use regex::Regex;
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use std::path::PathBuf;
use std::sync::LazyLock;

/// A rendered response, ready to be written by the HTTP layer.
#[derive(Debug)]
pub struct RenderedResponse {
    /// Configured status, `None` when the config said 0 and the HTTP layer
    /// default (200) applies.
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: RenderedBody,
}

/// The body of a rendered response.
#[derive(Debug)]
pub enum RenderedBody {
    Empty,
    /// File attachment; bytes are streamed from disk at write time.
    File {
        path: PathBuf,
        size: u64,
        file_name: String,
    },
    /// Serialised JSON document.
    Json(Vec<u8>),
}

/// Render the response of a matched rule with the captured environment.
/// Failures surface as HTTP 500.
pub fn render(rule: &CompiledRule, env: &Env) -> anyhow::Result<RenderedResponse> {
    let response = &rule.response;

    let mut headers = Vec::with_capacity(response.headers.len());
    for header in &response.headers {
        let parts: Vec<&str> = header.split(':').collect();
        if parts.len() != 2 {
            anyhow::bail!(
                "response header must contain exactly one colon, got {header:?}"
            );
        }
        headers.push((parts[0].trim().to_string(), parts[1].trim().to_string()));
    }

    let status = (response.status != 0).then_some(response.status);

    if !response.file.is_empty() {
        let path = PathBuf::from(&response.file);
        let meta = std::fs::metadata(&path).map_err(|e| {
            anyhow::anyhow!("failed to stat response file {}: {}", response.file, e)
        })?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| response.file.clone());
        return Ok(RenderedResponse {
            status,
            headers,
            body: RenderedBody::File {
                path,
                size: meta.len(),
                file_name,
            },
        });
    }

    if let Some(body) = &response.body {
        let json = convert_value(body, env)?;
        let bytes = serde_json::to_vec(&json)?;
        return Ok(RenderedResponse {
            status,
            headers,
            body: RenderedBody::Json(bytes),
        });
    }

    Ok(RenderedResponse {
        status,
        headers,
        body: RenderedBody::Empty,
    })
}

/// Convert a YAML template tree into its JSON wire form, substituting
/// variable references in string leaves.
fn convert_value(value: &YamlValue, env: &Env) -> anyhow::Result<JsonValue> {
    match value {
        YamlValue::Null => Ok(JsonValue::Null),
        YamlValue::Bool(b) => Ok(JsonValue::Bool(*b)),
        YamlValue::Number(n) => Ok(serde_json::to_value(n)?),
        YamlValue::String(s) => Ok(interpolate(s, env)),
        YamlValue::Sequence(items) => items
            .iter()
            .map(|item| convert_value(item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        YamlValue::Mapping(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                let YamlValue::String(key) = key else {
                    anyhow::bail!("key of response body map must be a string");
                };
                out.insert(key.clone(), convert_value(item, env)?);
            }
            Ok(JsonValue::Object(out))
        }
        _ => anyhow::bail!("unsupported value shape in response body"),
    }
}

static WHOLE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\{\{(\w+)\}\}$").expect("variable reference regex"));

fn interpolate(text: &str, env: &Env) -> JsonValue {
    // A leaf that is exactly one reference keeps the variable's type.
    // Unbound references render as JSON null.
    if let Some(name) = WHOLE_REF.captures(text).and_then(|caps| caps.get(1)) {
        return match env.get(name.as_str()).and_then(|v| v.value.as_ref()) {
            Some(value) => value.to_json(),
            None => JsonValue::Null,
        };
    }

    // Embedded references are textual. Unknown names stay literal.
    let mut out = text.to_string();
    for (name, variable) in env {
        if let Some(value) = &variable.value {
            let placeholder = format!("{{{{{name}}}}}");
            if out.contains(&placeholder) {
                out = out.replace(&placeholder, &value.to_text());
            }
        }
    }
    JsonValue::String(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{compile_rule, Variable, VariableType, VariableValue};
    use std::io::Write;

    fn compiled(yaml: &str) -> CompiledRule {
        compile_rule(&serde_yaml::from_str(yaml).unwrap()).unwrap()
    }

    fn env_with(entries: &[(&str, VariableValue)]) -> Env {
        entries
            .iter()
            .map(|(name, value)| {
                let vtype = match value {
                    VariableValue::Int(_) => VariableType::Int,
                    VariableValue::Float(_) => VariableType::Float,
                    VariableValue::Str(_) => VariableType::String,
                };
                (
                    name.to_string(),
                    Variable {
                        name: name.to_string(),
                        vtype,
                        value: Some(value.clone()),
                    },
                )
            })
            .collect()
    }

    fn rendered_json(rule: &CompiledRule, env: &Env) -> JsonValue {
        match render(rule, env).unwrap().body {
            RenderedBody::Json(bytes) => serde_json::from_slice(&bytes).unwrap(),
            other => panic!("expected JSON body, got {other:?}"),
        }
    }

    #[test]
    fn test_whole_reference_keeps_variable_type() {
        let rule = compiled(
            r#"
request: {method: POST, path: /api/book}
response:
  body:
    echo: "{{id}}"
    v: "{{f}}"
    s: "{{name}}"
"#,
        );
        let env = env_with(&[
            ("id", VariableValue::Int(5)),
            ("f", VariableValue::Float(3.5)),
            ("name", VariableValue::Str("dune".to_string())),
        ]);
        let json = rendered_json(&rule, &env);
        assert_eq!(json["echo"], JsonValue::from(5));
        assert_eq!(json["v"], JsonValue::from(3.5));
        assert_eq!(json["s"], JsonValue::from("dune"));
    }

    #[test]
    fn test_embedded_reference_renders_as_text() {
        let rule = compiled(
            r#"
request: {method: POST, path: /api/book}
response:
  body:
    v: "val={{f}}"
"#,
        );
        let env = env_with(&[("f", VariableValue::Float(3.5))]);
        let json = rendered_json(&rule, &env);
        assert_eq!(json["v"], JsonValue::from("val=3.5"));
    }

    #[test]
    fn test_unbound_whole_reference_is_null() {
        let rule = compiled(
            r#"
request: {method: GET, path: /x}
response:
  body:
    missing: "{{nope}}"
"#,
        );
        let json = rendered_json(&rule, &Env::new());
        assert_eq!(json["missing"], JsonValue::Null);
    }

    #[test]
    fn test_unknown_embedded_reference_stays_literal() {
        let rule = compiled(
            r#"
request: {method: GET, path: /x}
response:
  body:
    text: "keep {{unknown}} as is"
"#,
        );
        let json = rendered_json(&rule, &Env::new());
        assert_eq!(json["text"], JsonValue::from("keep {{unknown}} as is"));
    }

    #[test]
    fn test_scalars_pass_through() {
        let rule = compiled(
            r#"
request: {method: GET, path: /x}
response:
  body:
    n: 42
    f: 1.5
    b: true
    nil: ~
    list: [1, two]
"#,
        );
        let json = rendered_json(&rule, &Env::new());
        assert_eq!(json["n"], JsonValue::from(42));
        assert_eq!(json["f"], JsonValue::from(1.5));
        assert_eq!(json["b"], JsonValue::from(true));
        assert_eq!(json["nil"], JsonValue::Null);
        assert_eq!(json["list"], serde_json::json!([1, "two"]));
    }

    #[test]
    fn test_malformed_header_is_an_error() {
        let rule = compiled(
            r#"
request: {method: GET, path: /x}
response:
  headers: ["X-Time: 10:30"]
"#,
        );
        assert!(render(&rule, &Env::new()).is_err());
    }

    #[test]
    fn test_headers_are_trimmed() {
        let rule = compiled(
            r#"
request: {method: GET, path: /x}
response:
  status: 200
  headers: ["Content-Type:  application/json "]
"#,
        );
        let rendered = render(&rule, &Env::new()).unwrap();
        assert_eq!(rendered.status, Some(200));
        assert_eq!(
            rendered.headers,
            vec![("Content-Type".to_string(), "application/json".to_string())]
        );
        assert!(matches!(rendered.body, RenderedBody::Empty));
    }

    #[test]
    fn test_zero_status_means_http_default() {
        let rule = compiled(
            r#"
request: {method: GET, path: /x}
response: {}
"#,
        );
        let rendered = render(&rule, &Env::new()).unwrap();
        assert_eq!(rendered.status, None);
    }

    #[test]
    fn test_file_body_reports_size_and_name() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"attachment payload").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let rule = compiled(&format!(
            r#"
request: {{method: GET, path: /download}}
response:
  status: 200
  file: "{path}"
"#
        ));
        let rendered = render(&rule, &Env::new()).unwrap();
        match rendered.body {
            RenderedBody::File {
                size, file_name, ..
            } => {
                assert_eq!(size, 18);
                assert_eq!(
                    file_name,
                    file.path().file_name().unwrap().to_string_lossy()
                );
            }
            other => panic!("expected file body, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let rule = compiled(
            r#"
request: {method: GET, path: /download}
response:
  file: /nonexistent/path/to/file
"#,
        );
        assert!(render(&rule, &Env::new()).is_err());
    }

    #[test]
    fn test_file_takes_precedence_over_body() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"x").unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let rule = compiled(&format!(
            r#"
request: {{method: GET, path: /download}}
response:
  file: "{path}"
  body:
    ignored: true
"#
        ));
        let rendered = render(&rule, &Env::new()).unwrap();
        assert!(matches!(rendered.body, RenderedBody::File { .. }));
    }
}
