use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use clap::ValueEnum;
use termgate_core::GatewayConfig;
use termgate_core::config::LogConfig;
use termgate_core::config::LogFormat;
use termgate_core::session::RusshConnector;
use termgate_gateway::build_state;
use termgate_gateway::serve;
use termgate_gateway::shutdown::wait_for_signal;
use termgate_gateway::start_background;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Browser terminal gateway: WebSocket viewers in, SSH sessions out.
#[derive(Debug, Parser)]
#[command(name = "termgate", version)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides `server.listen`.
    #[arg(long, value_name = "ADDR")]
    listen: Option<SocketAddr>,

    /// Overrides `log.format`.
    #[arg(long, value_enum)]
    log_format: Option<LogFormatArg>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Text,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Text => LogFormat::Text,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    config.apply_env().context("applying environment overrides")?;
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if let Some(format) = cli.log_format {
        config.log.format = format.into();
    }
    config.validate().context("validating config")?;
    Ok(config)
}

fn setup_tracing(log: &LogConfig) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = match log.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    setup_tracing(&config.log);

    let state = build_state(&config, Arc::new(RusshConnector::new()))
        .context("building collaborator clients")?;
    start_background(&state);
    tokio::spawn(wait_for_signal(state.shutdown.clone()));

    let listener = TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    serve(state, listener, config.server.shutdown_grace())
        .await
        .context("serving")?;
    Ok(())
}
