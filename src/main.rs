//! `docgate` server binary.
//!
//! Serves the bundled in-memory backend — handy for demos, protocol
//! experiments and integration tests. Embedding hosts with a real storage
//! engine use the library API instead.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use docgate::logging::{LogFormat, init_logging};
use docgate::{Gateway, GatewayConfig, MemoryDb};

#[derive(Parser)]
#[command(name = "docgate", version, about = "JSON document database gateway")]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to bind to (overrides the config file).
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on (overrides the config file).
    #[arg(short, long)]
    port: Option<u16>,

    /// Access token clients must present in `X-Access-Token`.
    #[arg(long, env = "DOCGATE_ACCESS_TOKEN")]
    access_token: Option<String>,

    /// Admit token-less read-only requests.
    #[arg(long)]
    read_anon: bool,

    /// Emit logs as newline-delimited JSON.
    #[arg(long)]
    log_json: bool,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_config(self) -> Result<GatewayConfig, String> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| format!("cannot read {}: {e}", path.display()))?;
                serde_yaml::from_str(&text)
                    .map_err(|e| format!("cannot parse {}: {e}", path.display()))?
            }
            None => GatewayConfig::default(),
        };
        if let Some(bind) = self.bind {
            config.bind = bind;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.access_token.is_some() {
            config.access_token = self.access_token;
        }
        if self.read_anon {
            config.read_anon = true;
        }
        // The binary owns the process: run the gateway in the background
        // and keep this thread for signal handling.
        config.blocking = false;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Human
    };
    init_logging(format, cli.verbose.max(1));

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(message) => {
            error!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let db = Arc::new(MemoryDb::new());
    let Some(gateway) = Gateway::new(db, config) else {
        info!("gateway disabled by configuration, nothing to do");
        return ExitCode::SUCCESS;
    };
    if let Err(err) = gateway.start() {
        error!(error = %err, "startup failed");
        return ExitCode::FAILURE;
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("interrupt received, shutting down"),
        Err(err) => error!(error = %err, "signal listener failed, shutting down"),
    }
    gateway.shutdown();
    ExitCode::SUCCESS
}
