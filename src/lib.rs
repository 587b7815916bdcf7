//! httpstub
//!
//! A configurable mock HTTP(S) server for exercising client code during
//! development and integration testing. Operators describe request/response
//! fixtures declaratively; for every incoming request the server picks the
//! first rule whose predicate matches and synthesises the configured
//! response.
//!
//! # Features
//!
//! - **Request matching**: method, per-segment path regexes, header
//!   include/exclude rules, structural JSON body matching
//! - **Variable capture**: `{{name,type}}` placeholders in body rules bind
//!   typed variables (int, float, string) from the request
//! - **Variable interpolation**: `{{name}}` references in the response body
//!   substitute captured values, preserving their type
//! - **Strict and loose matching**: anchored, literal patterns and exact
//!   key sets versus regex fragments and open maps
//! - **File attachments**: serve a file with `Content-Disposition` set
//! - **Hot reload**: atomically swap the ruleset when the config changes
//!
//! # Example Configuration
//!
//! ```yaml
//! servers:
//!   - addr: ":8080"
//! rules:
//!   - name: book-title
//!     request:
//!       method: GET
//!       path: /api/book/.+/title
//!       headers:
//!         - include: "^Authorization: Bearer .+"
//!       body:
//!         match_rule: strict
//!         value:
//!           id: "{{id,int}}"
//!     response:
//!       status: 200
//!       headers: ["Content-Type: application/json"]
//!       body:
//!         echoed_id: "{{id}}"
//! ```

pub mod config;
pub mod matcher;
pub mod reload;
pub mod render;
pub mod rules;
pub mod server;

pub use config::Config;
pub use matcher::{find_match, RequestParts};
pub use render::{render, RenderedBody, RenderedResponse};
pub use rules::{compile_rules, BodyMatcher, CompileError, CompiledRule, Env};
