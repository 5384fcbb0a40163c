//! estrace: a development proxy that instruments JavaScript on the fly.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use estrace::config::{ProxyConfig, TraceConfig};
use estrace::proxy;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Upstream origin, e.g. "http://localhost:3000"
    upstream: String,

    /// Bind address
    #[arg(short, long, env = "ESTRACE_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(short, long, env = "ESTRACE_PORT", default_value = "8080")]
    port: u16,

    /// JSON file naming the runtime globals (global_object, buffer_name, depth_name)
    #[arg(short, long, env = "ESTRACE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let trace = match &cli.config {
        Some(path) => TraceConfig::from_file(path)?,
        None => TraceConfig::default(),
    };
    let config = ProxyConfig::new(&cli.upstream, &cli.bind, cli.port, trace)?;

    let upstream = config.upstream.to_string();
    println!(
        "proxying http://{}/ to {}/",
        config.listen,
        upstream.trim_end_matches('/')
    );

    tokio::select! {
        result = proxy::serve(config) => {
            if let Err(e) = &result {
                error!(error = %e, "proxy stopped");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
