//! Hot reload of the compiled ruleset.
//!
//! Watches the configuration file and swaps the shared ruleset on change.
//! A reload that fails to parse or compile is logged and the previous
//! ruleset stays live; reload failures never terminate the process.

use crate::config::Config;
use crate::rules;
use crate::server::SharedRules;
use notify::RecursiveMode;
use notify_debouncer_mini::new_debouncer;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tracing::{info, warn};

/// Load, validate and compile the config file, then swap the shared
/// ruleset. Returns the new rule count.
pub fn reload_rules(path: &Path, rules: &SharedRules) -> anyhow::Result<usize> {
    let config = Config::from_file(path)?;
    config.validate()?;
    let compiled = rules::compile_rules(&config)?;
    let count = compiled.len();
    *rules.blocking_lock() = compiled;
    Ok(count)
}

/// Watch the configuration file and reload rules on every write.
///
/// The watcher runs on its own thread. The parent directory is watched
/// (non-recursively) so editors that replace the file instead of writing in
/// place are still seen; events for other files are ignored.
pub fn watch_config(path: PathBuf, rules: SharedRules) -> anyhow::Result<()> {
    let (tx, rx) = mpsc::channel();
    let mut debouncer = new_debouncer(Duration::from_millis(300), tx)?;

    let watch_dir = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .to_path_buf();
    debouncer
        .watcher()
        .watch(&watch_dir, RecursiveMode::NonRecursive)?;

    info!(path = %path.display(), "watching config file for changes");

    std::thread::spawn(move || {
        // The debouncer must stay alive as long as events are consumed.
        let _debouncer = debouncer;
        let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());

        for events in rx.into_iter().flatten() {
            let touched = events.iter().any(|event| {
                event.path == path
                    || event
                        .path
                        .canonicalize()
                        .map(|p| p == canonical)
                        .unwrap_or(false)
            });
            if !touched {
                continue;
            }

            info!("config file changed, reloading rules");
            match reload_rules(&path, &rules) {
                Ok(count) => info!(rules = count, "config file reloaded"),
                Err(err) => {
                    warn!(error = %err, "failed to reload config, keeping previous rules")
                }
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    const VALID: &str = r#"
servers:
  - addr: ":8080"
rules:
  - name: ping
    request: {method: GET, path: /ping}
    response: {status: 200}
"#;

    const INVALID_RULE: &str = r#"
servers:
  - addr: ":8080"
rules:
  - request:
      method: GET
      path: /ping
      body: {match_rule: fuzzy, value: 1}
    response: {}
"#;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_reload_swaps_ruleset() {
        let file = write_config(VALID);
        let rules: SharedRules = Arc::new(Mutex::new(Vec::new()));

        let count = reload_rules(file.path(), &rules).unwrap();
        assert_eq!(count, 1);
        assert_eq!(rules.blocking_lock().len(), 1);
    }

    #[test]
    fn test_failed_reload_keeps_previous_ruleset() {
        let valid = write_config(VALID);
        let rules: SharedRules = Arc::new(Mutex::new(Vec::new()));
        reload_rules(valid.path(), &rules).unwrap();

        let invalid = write_config(INVALID_RULE);
        assert!(reload_rules(invalid.path(), &rules).is_err());

        // The previous generation is untouched.
        let guard = rules.blocking_lock();
        assert_eq!(guard.len(), 1);
        assert_eq!(guard[0].display_name(), "ping");
    }

    #[test]
    fn test_reload_rejects_missing_servers() {
        let file = write_config("rules: []");
        let rules: SharedRules = Arc::new(Mutex::new(Vec::new()));
        assert!(reload_rules(file.path(), &rules).is_err());
    }
}
