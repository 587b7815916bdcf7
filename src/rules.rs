//! Rule compilation and the body matcher tree.
//!
//! A declarative [`Rule`](crate::config::Rule) is compiled once into a
//! [`CompiledRule`]: method and path predicates, eagerly compiled header
//! regexes, and a [`BodyMatcher`] tree built from the rule's body value.
//! String leaves of the body value may declare typed capture variables with
//! `{{name,type}}`; matching binds them into a per-request [`Env`].

use crate::config::{Config, HeaderRule, RequestBodyRule, ResponseRule, Rule};
use regex::Regex;
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// Errors found while compiling a rule. All of them are configuration
/// mistakes; a ruleset that compiles never produces them at match time.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("match_rule must be one of \"loose\" and \"strict\", got {0:?}")]
    InvalidMatchRule(String),

    #[error("invalid variable type {0:?}, expected int, float or string")]
    InvalidVariableType(String),

    #[error("multiple variables named {0:?} in one rule")]
    DuplicateVariable(String),

    #[error("key of map value in rule must be a string")]
    NonStringMapKey,

    #[error("unsupported value shape in body rule")]
    UnsupportedShape,

    #[error("failed to compile {pattern:?} as regex: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("header rule must set exactly one of include and not")]
    HeaderRuleShape,
}

/// Type of a capture variable, declared in the pattern as the second
/// placeholder field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableType {
    Int,
    Float,
    String,
}

/// Value bound to a variable at match time.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    Int(i64),
    Float(f64),
    Str(String),
}

impl VariableValue {
    /// The typed JSON representation, used when a response leaf is exactly
    /// one placeholder.
    pub fn to_json(&self) -> JsonValue {
        match self {
            VariableValue::Int(i) => JsonValue::from(*i),
            VariableValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            VariableValue::Str(s) => JsonValue::String(s.clone()),
        }
    }

    /// Decimal text, used when a placeholder is embedded in a larger string.
    pub fn to_text(&self) -> String {
        match self {
            VariableValue::Int(i) => i.to_string(),
            VariableValue::Float(f) => format!("{f}"),
            VariableValue::Str(s) => s.clone(),
        }
    }
}

/// A typed name/value cell. Compiled rules hold unbound prototypes; the
/// matcher clones them and fills `value` from capture text.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub vtype: VariableType,
    pub value: Option<VariableValue>,
}

/// Per-request variable environment. Discarded wholesale when a rule fails
/// to match.
pub type Env = HashMap<String, Variable>;

/// A compiled predicate over a JSON value.
#[derive(Debug, Clone)]
pub enum BodyMatcher {
    /// Accepts any value, binds nothing. Compiled from a null leaf so that
    /// strict maps can declare unconstrained keys.
    Any,

    /// Exact boolean equality.
    Boolean(bool),

    /// Numeric equality. YAML integers and floats both land here because
    /// JSON carries all numbers as floating-point.
    Number(f64),

    /// Regex over the observed string, binding capture variables by
    /// position. `single_match` marks a pattern that is one whole-value
    /// placeholder, which additionally accepts numeric observed values.
    Pattern {
        regex: Regex,
        variables: Vec<Variable>,
        single_match: bool,
    },

    /// Positional element-wise match over an array of equal length.
    Sequence(Vec<BodyMatcher>),

    /// Keyed match over an object. In strict mode the key sets must
    /// coincide, except that `Any` entries are satisfied even when absent.
    Mapping {
        strict: bool,
        entries: HashMap<String, BodyMatcher>,
    },
}

impl BodyMatcher {
    /// Match an observed JSON value, binding captured variables into `env`.
    ///
    /// Returns `Ok(false)` on a mismatch. `Err` is reserved for broken
    /// matcher invariants and surfaces as a 500 upstream; the partial `env`
    /// of a failed match is discarded by the caller.
    pub fn matches(&self, value: &JsonValue, env: &mut Env) -> anyhow::Result<bool> {
        match self {
            BodyMatcher::Any => Ok(true),

            BodyMatcher::Boolean(expected) => Ok(value.as_bool() == Some(*expected)),

            BodyMatcher::Number(expected) => Ok(value.as_f64() == Some(*expected)),

            BodyMatcher::Pattern {
                regex,
                variables,
                single_match,
            } => match_pattern(regex, variables, *single_match, value, env),

            BodyMatcher::Sequence(subs) => {
                let Some(items) = value.as_array() else {
                    return Ok(false);
                };
                if items.len() != subs.len() {
                    return Ok(false);
                }
                for (sub, item) in subs.iter().zip(items) {
                    if !sub.matches(item, env)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }

            BodyMatcher::Mapping { strict, entries } => {
                let Some(object) = value.as_object() else {
                    return Ok(false);
                };
                let mut consumed: HashSet<&str> = HashSet::new();
                for (key, item) in object {
                    let Some(sub) = entries.get(key) else {
                        // Loose maps tolerate observed keys with no matcher;
                        // strict maps reject them.
                        if *strict {
                            return Ok(false);
                        }
                        continue;
                    };
                    if !sub.matches(item, env)? {
                        return Ok(false);
                    }
                    consumed.insert(key.as_str());
                }
                if *strict {
                    for (key, sub) in entries {
                        if !consumed.contains(key.as_str())
                            && !matches!(sub, BodyMatcher::Any)
                        {
                            return Ok(false);
                        }
                    }
                }
                Ok(true)
            }
        }
    }
}

fn match_pattern(
    regex: &Regex,
    variables: &[Variable],
    single_match: bool,
    value: &JsonValue,
    env: &mut Env,
) -> anyhow::Result<bool> {
    // A whole-value numeric placeholder also accepts a JSON number, matched
    // against its canonical decimal rendering. Integer placeholders reject
    // values with a fractional part.
    let text = match (single_match, variables.first(), value) {
        (true, Some(var), JsonValue::Number(n)) if var.vtype == VariableType::Int => {
            let Some(f) = n.as_f64() else {
                return Ok(false);
            };
            if f.fract() != 0.0 {
                return Ok(false);
            }
            format!("{f:.0}")
        }
        (true, Some(var), JsonValue::Number(n)) if var.vtype == VariableType::Float => {
            let Some(f) = n.as_f64() else {
                return Ok(false);
            };
            format!("{f}")
        }
        _ => match value.as_str() {
            Some(s) => s.to_string(),
            None => return Ok(false),
        },
    };

    // Only the first match of the regex is used.
    let Some(caps) = regex.captures(&text) else {
        return Ok(false);
    };

    for (i, proto) in variables.iter().enumerate() {
        let Some(group) = caps.get(i + 1) else {
            anyhow::bail!(
                "capture group {} missing for variable {:?}",
                i + 1,
                proto.name
            );
        };
        let parsed = match proto.vtype {
            VariableType::Int => match group.as_str().parse::<i64>() {
                Ok(v) => VariableValue::Int(v),
                Err(_) => return Ok(false),
            },
            VariableType::Float => match group.as_str().parse::<f64>() {
                Ok(v) => VariableValue::Float(v),
                Err(_) => return Ok(false),
            },
            VariableType::String => VariableValue::Str(group.as_str().to_string()),
        };
        // Clone the prototype so matching never mutates the compiled rule.
        env.insert(
            proto.name.clone(),
            Variable {
                name: proto.name.clone(),
                vtype: proto.vtype,
                value: Some(parsed),
            },
        );
    }

    Ok(true)
}

/// A compiled header constraint.
#[derive(Debug, Clone)]
pub enum CompiledHeaderRule {
    /// At least one header line must match.
    Include(Regex),
    /// No header line may match.
    Exclude(Regex),
}

/// A rule after compilation. Immutable; all regexes are compiled eagerly so
/// malformed patterns are startup errors rather than 500s at serving time.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub name: Option<String>,
    pub method: String,
    pub path_segments: Vec<Regex>,
    pub headers: Vec<CompiledHeaderRule>,
    pub body: Option<BodyMatcher>,
    pub response: ResponseRule,
}

impl CompiledRule {
    /// Name for logging.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}

/// Compile every rule of a configuration, in order.
pub fn compile_rules(config: &Config) -> Result<Vec<CompiledRule>, CompileError> {
    config.rules.iter().map(compile_rule).collect()
}

/// Compile a single rule. Deterministic, no I/O.
pub fn compile_rule(rule: &Rule) -> Result<CompiledRule, CompileError> {
    let path_segments = compile_path(&rule.request.path)?;
    let headers = rule
        .request
        .headers
        .iter()
        .map(compile_header_rule)
        .collect::<Result<Vec<_>, _>>()?;
    let body = compile_body_rule(&rule.request.body)?;

    Ok(CompiledRule {
        name: rule.name.clone(),
        method: rule.request.method.clone(),
        path_segments,
        headers,
        body,
        response: rule.response.clone(),
    })
}

/// Split a path pattern on `/` after trimming one leading slash and compile
/// each segment as a regex. Trailing slashes are significant through the
/// segment count.
fn compile_path(path: &str) -> Result<Vec<Regex>, CompileError> {
    path.strip_prefix('/')
        .unwrap_or(path)
        .split('/')
        .map(|segment| {
            Regex::new(segment).map_err(|source| CompileError::BadPattern {
                pattern: segment.to_string(),
                source,
            })
        })
        .collect()
}

fn compile_header_rule(rule: &HeaderRule) -> Result<CompiledHeaderRule, CompileError> {
    match (&rule.include, &rule.not) {
        (Some(pattern), None) => compile_regex(pattern).map(CompiledHeaderRule::Include),
        (None, Some(pattern)) => compile_regex(pattern).map(CompiledHeaderRule::Exclude),
        _ => Err(CompileError::HeaderRuleShape),
    }
}

fn compile_regex(pattern: &str) -> Result<Regex, CompileError> {
    Regex::new(pattern).map_err(|source| CompileError::BadPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Compile the body constraint of a rule, if any.
pub fn compile_body_rule(body: &RequestBodyRule) -> Result<Option<BodyMatcher>, CompileError> {
    let absent = matches!(body.value, None | Some(YamlValue::Null));
    if absent && body.match_rule.is_empty() {
        return Ok(None);
    }

    let strict = match body.match_rule.as_str() {
        "" | "loose" => false,
        "strict" => true,
        other => return Err(CompileError::InvalidMatchRule(other.to_string())),
    };

    match &body.value {
        None => Ok(None),
        Some(value) => {
            let mut seen = HashSet::new();
            compile_value(value, strict, &mut seen).map(Some)
        }
    }
}

/// Dispatch on the dynamic shape of a YAML value. The `strict` flag threads
/// unchanged into nested values.
fn compile_value(
    value: &YamlValue,
    strict: bool,
    seen: &mut HashSet<String>,
) -> Result<BodyMatcher, CompileError> {
    match value {
        // A null leaf means: key required, value unconstrained.
        YamlValue::Null => Ok(BodyMatcher::Any),

        YamlValue::Bool(b) => Ok(BodyMatcher::Boolean(*b)),

        YamlValue::Number(n) => n
            .as_f64()
            .map(BodyMatcher::Number)
            .ok_or(CompileError::UnsupportedShape),

        YamlValue::String(s) => compile_pattern(s, strict, seen),

        YamlValue::Sequence(items) => items
            .iter()
            .map(|item| compile_value(item, strict, seen))
            .collect::<Result<Vec<_>, _>>()
            .map(BodyMatcher::Sequence),

        YamlValue::Mapping(map) => {
            let mut entries = HashMap::with_capacity(map.len());
            for (key, item) in map {
                let YamlValue::String(key) = key else {
                    return Err(CompileError::NonStringMapKey);
                };
                entries.insert(key.clone(), compile_value(item, strict, seen)?);
            }
            Ok(BodyMatcher::Mapping { strict, entries })
        }

        _ => Err(CompileError::UnsupportedShape),
    }
}

static VAR_DECL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(\w+),(\w+)\}\}").expect("variable declaration regex"));

/// Compile a string leaf into a [`BodyMatcher::Pattern`].
///
/// Placeholders become capture groups; the literal text between them is
/// regex-escaped in strict mode and inserted verbatim in loose mode, where
/// it is itself a regex fragment. Strict patterns are anchored.
fn compile_pattern(
    text: &str,
    strict: bool,
    seen: &mut HashSet<String>,
) -> Result<BodyMatcher, CompileError> {
    let mut regex_str = String::new();
    let mut variables = Vec::new();
    let mut last_end = 0;
    let mut first_span = None;

    for caps in VAR_DECL.captures_iter(text) {
        let (Some(whole), Some(name), Some(vtype)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };

        push_literal(&mut regex_str, &text[last_end..whole.start()], strict);

        if !seen.insert(name.as_str().to_string()) {
            return Err(CompileError::DuplicateVariable(name.as_str().to_string()));
        }

        let (fragment, vtype) = match vtype.as_str() {
            "int" => (r"([-+]?\d+)", VariableType::Int),
            "float" => (r"([-+]?[0-9]*\.?[0-9]+)", VariableType::Float),
            "string" => (r"(.+)", VariableType::String),
            other => return Err(CompileError::InvalidVariableType(other.to_string())),
        };
        regex_str.push_str(fragment);
        variables.push(Variable {
            name: name.as_str().to_string(),
            vtype,
            value: None,
        });

        if first_span.is_none() {
            first_span = Some((whole.start(), whole.end()));
        }
        last_end = whole.end();
    }

    push_literal(&mut regex_str, &text[last_end..], strict);

    if strict {
        regex_str = format!("^{regex_str}$");
    }

    let single_match = variables.len() == 1 && first_span == Some((0, text.len()));

    let regex = Regex::new(&regex_str).map_err(|source| CompileError::BadPattern {
        pattern: regex_str.clone(),
        source,
    })?;

    Ok(BodyMatcher::Pattern {
        regex,
        variables,
        single_match,
    })
}

fn push_literal(out: &mut String, literal: &str, strict: bool) {
    if strict {
        for c in literal.chars() {
            if matches!(c, '.' | '*' | '[' | ']' | '(' | ')' | '\\') {
                out.push('\\');
            }
            out.push(c);
        }
    } else {
        out.push_str(literal);
    }
}
