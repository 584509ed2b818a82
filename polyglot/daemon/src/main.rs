//! Polyglot Daemon - Multi-Bot Answer Server
//!
//! Hosts the orchestrator behind a Unix socket, and offers one-shot queries
//! from the command line.
//!
//! # Usage
//!
//! ```bash
//! # Serve on the default socket
//! polyglot-daemon serve
//!
//! # Serve with offline demo bots
//! polyglot-daemon serve --dry-run --socket-path /tmp/polyglot.sock
//!
//! # Ask once and print the merged answer
//! polyglot-daemon ask "How do I sear a steak?" --access-key "$POE_KEY"
//!
//! # Print the declared bots and their weights
//! polyglot-daemon deps
//!
//! # Verbose logging
//! RUST_LOG=debug polyglot-daemon serve
//! ```
//!
//! # Protocol
//!
//! A client writes one JSON `QueryRequest` line and reads JSON `Fragment`
//! lines until the server closes the connection.
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown

mod demo;
mod server;
mod transcript;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use polyglot_core::{
    load_config, load_config_from_path, Backend, ConfigOverrides, HttpBackend, Orchestrator,
    PolyglotConfig, QueryRequest,
};

use server::DaemonServer;
use transcript::Transcript;

/// Polyglot Daemon - ask several bots at once and merge their answers
#[derive(Parser, Debug)]
#[command(name = "polyglot-daemon")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long, global = true, env = "POLYGLOT_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short = 'l',
        long,
        global = true,
        env = "POLYGLOT_LOG_LEVEL",
        default_value = "info"
    )]
    log_level: String,

    #[command(flatten)]
    overrides: OverrideArgs,

    #[command(subcommand)]
    command: Command,
}

/// Command-line overrides of the loaded configuration
#[derive(Args, Debug)]
struct OverrideArgs {
    /// Bot server base URL
    #[arg(long, global = true, value_name = "URL")]
    base_url: Option<String>,

    /// Per-bot timeout in seconds (0 = none)
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Skip classification and query only the mandatory bots
    #[arg(long, global = true)]
    no_routing: bool,

    /// Enable web search enrichment
    #[arg(long, global = true)]
    web_search: bool,
}

impl OverrideArgs {
    fn to_overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ref url) = self.base_url {
            overrides = overrides.with_base_url(url.clone());
        }
        if let Some(secs) = self.timeout {
            overrides = overrides.with_request_timeout_secs(secs);
        }
        if self.no_routing {
            overrides = overrides.with_routing_enabled(false);
        }
        if self.web_search {
            overrides = overrides.with_web_search(true);
        }
        overrides
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve requests on a Unix socket
    Serve {
        /// Unix socket path for client connections
        #[arg(short = 's', long, env = "POLYGLOT_SOCKET", value_name = "PATH")]
        socket_path: Option<PathBuf>,

        /// Answer with offline demo bots instead of the bot server
        #[arg(long)]
        dry_run: bool,
    },

    /// Ask once and print the merged answer
    Ask {
        /// Question text
        #[arg(required = true)]
        text: Vec<String>,

        /// Credential forwarded to every bot
        #[arg(short = 'k', long, env = "POLYGLOT_ACCESS_KEY", default_value = "")]
        access_key: String,

        /// Answer with offline demo bots instead of the bot server
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the declared bots and their weights as JSON
    Deps,
}

/// Get the default socket path
///
/// Uses XDG_RUNTIME_DIR if available, otherwise /tmp/polyglot-$UID/
fn default_socket_path() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(runtime_dir)
            .join("polyglot")
            .join("polyglot.sock")
    } else {
        // SAFETY: getuid has no preconditions and cannot fail
        let uid = unsafe { libc::getuid() };
        PathBuf::from(format!("/tmp/polyglot-{uid}/polyglot.sock"))
    }
}

/// Initialize logging with the specified level
///
/// Logs go to stderr so `ask` and `deps` output stays clean on stdout.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "polyglot_daemon={level},polyglot_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Load configuration from the file, environment and command line
fn resolve_config(cli: &Cli) -> Result<PolyglotConfig> {
    let mut config = match cli.config {
        Some(ref path) => load_config_from_path(Some(path.clone()))
            .with_context(|| format!("Failed to load config from {path:?}"))?,
        None => load_config().context("Failed to load config")?,
    };
    cli.overrides.to_overrides().apply(&mut config);

    info!(
        source = %config.source(),
        base_url = %config.base_url,
        routing = config.routing.enabled,
        web_search = config.enrichment.web_search,
        "Configuration resolved"
    );
    Ok(config)
}

fn build_orchestrator(config: PolyglotConfig, dry_run: bool) -> Result<Orchestrator> {
    let backend: Arc<dyn Backend> = if dry_run {
        info!("Dry run, using offline demo bots");
        Arc::new(demo::demo_backend(&config))
    } else {
        Arc::new(HttpBackend::from_config(&config).context("Failed to create HTTP backend")?)
    };

    Orchestrator::new(backend, config).context("Invalid configuration")
}

/// Set a flag once SIGTERM or SIGINT arrives
fn install_shutdown_handler() -> Result<Arc<AtomicBool>> {
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    let flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
            _ = sigint.recv() => info!("Received SIGINT, initiating shutdown"),
        }
        flag.store(true, Ordering::SeqCst);
    });

    Ok(shutdown)
}

async fn serve(config: PolyglotConfig, socket_path: Option<PathBuf>, dry_run: bool) -> Result<()> {
    let socket_path = socket_path.unwrap_or_else(default_socket_path);
    info!(socket_path = ?socket_path, "Socket path");

    let orchestrator = build_orchestrator(config, dry_run)?;
    let shutdown = install_shutdown_handler()?;

    let mut server = DaemonServer::new(socket_path, orchestrator);
    match server.run(shutdown).await {
        Ok(()) => {
            info!("Polyglot daemon stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}

async fn ask(config: PolyglotConfig, text: &[String], access_key: String, dry_run: bool) -> Result<()> {
    let orchestrator = build_orchestrator(config, dry_run)?;
    let request = QueryRequest::from_text(text.join(" "), access_key);

    let mut merged = orchestrator.get_response(&request).await;
    let mut transcript = Transcript::new();
    while let Some(fragment) = merged.recv().await {
        transcript.observe(&fragment);
    }

    println!("{}", transcript.render());
    if !transcript.suggestions().is_empty() {
        println!();
        for suggestion in transcript.suggestions() {
            println!("> {suggestion}");
        }
    }
    Ok(())
}

fn deps(config: &PolyglotConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(&config.dependencies())?;
    println!("{json}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&cli.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "Polyglot daemon starting");

    let config = resolve_config(&cli)?;

    match cli.command {
        Command::Serve {
            socket_path,
            dry_run,
        } => serve(config, socket_path, dry_run).await,
        Command::Ask {
            ref text,
            ref access_key,
            dry_run,
        } => ask(config, text, access_key.clone(), dry_run).await,
        Command::Deps => {
            config.validate().context("Invalid configuration")?;
            deps(&config)
        }
    }
}
