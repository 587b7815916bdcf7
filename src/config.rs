//! Configuration for the stub server.
//!
//! Defines the YAML document shape: a list of listeners and an ordered list
//! of request/response rules. Decoding is deliberately non-strict so that
//! configs can carry annotations the server does not know about.

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Listeners to bind. At least one is required.
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Rules, evaluated in declaration order. First match wins.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate listener settings. Rule bodies are checked separately by the
    /// rule compiler.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.servers.is_empty() {
            anyhow::bail!("config must define at least one server");
        }
        for (i, server) in self.servers.iter().enumerate() {
            if server.cert_file.is_some() != server.key_file.is_some() {
                anyhow::bail!("server {}: cert_file and key_file must come in pair", i);
            }
        }
        Ok(())
    }
}

/// A single listener. TLS is enabled when both `cert_file` and `key_file`
/// are present; one without the other fails validation.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address, either `host:port` or `:port` for all interfaces.
    pub addr: String,

    /// Path to the PEM certificate chain.
    #[serde(default)]
    pub cert_file: Option<String>,

    /// Path to the PEM private key.
    #[serde(default)]
    pub key_file: Option<String>,
}

impl ServerConfig {
    /// Whether this listener serves TLS.
    pub fn is_tls(&self) -> bool {
        self.cert_file.is_some() && self.key_file.is_some()
    }
}

/// A request predicate paired with a response template.
#[derive(Debug, Clone, Deserialize)]
pub struct Rule {
    /// Optional display name, used only in logs.
    #[serde(default)]
    pub name: Option<String>,

    /// Request predicate.
    pub request: RequestRule,

    /// Response template.
    pub response: ResponseRule,
}

/// Request predicate: method, path, header and body constraints.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RequestRule {
    /// HTTP method, matched by exact equality.
    #[serde(default)]
    pub method: String,

    /// Slash-separated path pattern. Each segment is a regex applied to the
    /// corresponding request path segment.
    #[serde(default)]
    pub path: String,

    /// Header constraints. All must hold.
    #[serde(default)]
    pub headers: Vec<HeaderRule>,

    /// Body constraint.
    #[serde(default)]
    pub body: RequestBodyRule,
}

/// A single header constraint against the flattened `"Key: Value"` lines of
/// the request. Exactly one of `include` / `not` must be set.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct HeaderRule {
    /// Regex that must match at least one header line.
    #[serde(default)]
    pub include: Option<String>,

    /// Regex that must match no header line.
    #[serde(default)]
    pub not: Option<String>,
}

/// Body constraint: a match mode plus a heterogeneous value tree whose
/// string leaves may declare `{{name,type}}` capture variables.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RequestBodyRule {
    /// One of `""` (same as loose), `"loose"`, `"strict"`.
    #[serde(default)]
    pub match_rule: String,

    /// Expected body shape. Absent means the body is unconstrained.
    #[serde(default)]
    pub value: Option<serde_yaml::Value>,
}

/// Response template. String leaves of `body` may reference captured
/// variables as `{{name}}`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ResponseRule {
    /// Status code. Zero means the HTTP layer default (200).
    #[serde(default)]
    pub status: u16,

    /// Extra response headers, each `"Key: Value"`.
    #[serde(default)]
    pub headers: Vec<String>,

    /// Path of a file to attach. Non-empty takes precedence over `body`.
    #[serde(default)]
    pub file: String,

    /// Response body tree, serialised to JSON after interpolation.
    #[serde(default)]
    pub body: Option<serde_yaml::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r#"
servers:
  - addr: ":8080"
rules:
  - name: book-title
    request:
      method: GET
      path: /api/book/.+/title
    response:
      status: 200
      headers: ["Content-Type: application/json"]
      body:
        title: some book
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.servers.len(), 1);
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].name.as_deref(), Some("book-title"));
        assert_eq!(config.rules[0].request.method, "GET");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_header_and_body_rules() {
        let yaml = r#"
servers:
  - addr: "127.0.0.1:9090"
rules:
  - request:
      method: POST
      path: /api/book
      headers:
        - include: "^Authorization: Bearer .+"
        - not: "^X-Test:"
      body:
        match_rule: strict
        value:
          id: "{{id,int}}"
    response:
      status: 201
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let request = &config.rules[0].request;
        assert_eq!(request.headers.len(), 2);
        assert_eq!(
            request.headers[0].include.as_deref(),
            Some("^Authorization: Bearer .+")
        );
        assert_eq!(request.headers[1].not.as_deref(), Some("^X-Test:"));
        assert_eq!(request.body.match_rule, "strict");
        assert!(request.body.value.is_some());
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let yaml = r#"
servers:
  - addr: ":8080"
    comment: not a known field
rules: []
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.servers.len(), 1);
    }

    #[test]
    fn test_validate_requires_servers() {
        let config: Config = serde_yaml::from_str("rules: []").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unpaired_tls_files() {
        let yaml = r#"
servers:
  - addr: ":8443"
    cert_file: cert.pem
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("pair"), "unexpected error: {err}");
    }

    #[test]
    fn test_tls_detection() {
        let yaml = r#"
servers:
  - addr: ":8080"
  - addr: ":8443"
    cert_file: cert.pem
    key_file: key.pem
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(!config.servers[0].is_tls());
        assert!(config.servers[1].is_tls());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_response_defaults() {
        let yaml = r#"
servers:
  - addr: ":8080"
rules:
  - request:
      method: GET
      path: /ping
    response: {}
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let response = &config.rules[0].response;
        assert_eq!(response.status, 0);
        assert!(response.headers.is_empty());
        assert!(response.file.is_empty());
        assert!(response.body.is_none());
    }
}
