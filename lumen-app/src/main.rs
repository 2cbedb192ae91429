//! lumen main binary.
//!
//! Minimal HTTP gateway in front of a hosted generative model, optionally
//! published through an ephemeral public tunnel.

mod config;
mod error;
mod routes;
mod server;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,lumen_llm=debug,lumen_tunnel=debug";

#[derive(Debug, Parser)]
#[command(name = "lumen", version, about = "lumen model gateway")]
struct Cli {
    /// Path to the TOML config file (default: ~/.lumen/config.toml, optional).
    #[arg(long, global = true, env = "LUMEN_CONFIG")]
    config: Option<PathBuf>,

    /// Prompt on stdin for secrets not found in the file or environment.
    #[arg(long, global = true)]
    interactive: bool,

    /// Log line format on stderr.
    #[arg(long, global = true, env = "LUMEN_LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the gateway server (default).
    Serve,
    /// List the models available to the configured key.
    Models,
    /// Send one prompt to the configured model and print the reply.
    Probe {
        #[arg(long, default_value = "Hello")]
        prompt: String,
    },
    /// Validate config and report which features are enabled.
    Doctor,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Compact,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);
    install_panic_hook();

    let command = cli.command.unwrap_or(Command::Serve);

    match command {
        Command::Serve => server::serve(cli.config, cli.interactive).await,
        Command::Models => server::list_models(cli.config, cli.interactive).await,
        Command::Probe { prompt } => server::probe(cli.config, cli.interactive, &prompt).await,
        Command::Doctor => server::doctor(cli.config, cli.interactive).await,
    }
}

/// Logs go to stderr; stdout is reserved for URLs and command output.
fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().flatten_event(true).init(),
    }
}

fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(
            location = %info.location().map_or_else(|| "unknown".to_string(), ToString::to_string),
            payload = info.payload_as_str().unwrap_or("non-string panic payload"),
            "panic"
        );
        default_hook(info);
    }));
}
