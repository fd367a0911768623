use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::admission::AdmissionEngine;
use turnstile::config::{LoggingConfig, TurnstileConfig};
use turnstile::ratelimit::{PolicyRegistry, RequestMeta};

/// Operator tool for the Turnstile rate limiting engine.
#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about)]
struct Cli {
    /// Configuration file (YAML or TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the resolved policy table
    Policies,

    /// Run admission decisions against the configured store
    Check {
        /// Endpoint class of the request
        #[arg(long)]
        class: String,

        /// Source address
        #[arg(long)]
        addr: IpAddr,

        /// Authenticated user id
        #[arg(long)]
        user: Option<String>,

        /// Session token
        #[arg(long)]
        session: Option<String>,

        #[arg(long, default_value = "/")]
        path: String,

        #[arg(long, default_value = "GET")]
        method: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 1)]
        repeat: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TurnstileConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "Turnstile starting");

    match cli.command {
        Command::Policies => {
            let registry = PolicyRegistry::from_config(&config.policies)?;
            let table = serde_json::json!({
                "default": registry.default_policy(),
                "classes": registry.policies(),
            });
            println!("{}", serde_json::to_string_pretty(&table)?);
        }
        Command::Check {
            class,
            addr,
            user,
            session,
            path,
            method,
            repeat,
        } => {
            let engine = AdmissionEngine::from_config(&config).await?;
            let meta = RequestMeta {
                user_id: user,
                session_token: session,
                remote_addr: addr,
                path,
                method,
            };

            for _ in 0..repeat {
                let decision = engine.admit(&meta, &class).await;
                println!("{}", serde_json::to_string(&decision)?);
            }
        }
    }

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
