//! httpstub - CLI entry point.

use anyhow::Result;
use clap::{CommandFactory, Parser};
use httpstub::config::Config;
use httpstub::{reload, rules, server};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "httpstub",
    about = "Configurable mock HTTP(S) server - declarative request stubbing for client testing",
    version
)]
struct Args {
    /// Path to the rule configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Watch the configuration file and reload rules on change
    #[arg(long)]
    autoreload: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let Some(config_path) = args.config else {
        Args::command().print_help()?;
        std::process::exit(1);
    };

    // Load and compile configuration; any error here is fatal.
    let config = Config::from_file(&config_path)?;
    config.validate()?;
    let compiled = rules::compile_rules(&config)?;

    if args.validate {
        println!("configuration is valid ({} rules defined)", compiled.len());
        return Ok(());
    }

    info!(
        rules = compiled.len(),
        servers = config.servers.len(),
        "configuration loaded"
    );

    let shared: server::SharedRules = Arc::new(Mutex::new(compiled));

    if args.autoreload {
        reload::watch_config(config_path.clone(), Arc::clone(&shared))?;
    }

    let mut listeners = JoinSet::new();
    for server_config in config.servers {
        let rules = Arc::clone(&shared);
        listeners.spawn(async move { server::run_server(server_config, rules).await });
    }

    // Servers run until a fatal I/O error; the first one takes the process
    // down with it.
    while let Some(result) = listeners.join_next().await {
        result??;
    }

    Ok(())
}
