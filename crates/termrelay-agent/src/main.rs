mod connection;
mod terminal;
mod transfer;

use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "termrelay remote host agent")]
struct Args {
    /// Broker host listener address.
    #[arg(long, default_value = "127.0.0.1:4476")]
    server: String,

    /// Shell to run in each terminal. Defaults to $SHELL, then /bin/sh.
    #[arg(long)]
    shell: Option<String>,

    /// Seconds to wait before reconnecting after the broker goes away.
    #[arg(long, default_value = "5")]
    reconnect_secs: u64,

    /// Exit instead of reconnecting.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "termrelay_agent=info,libtermrelay=info".into()),
        )
        .init();

    let args = Args::parse();
    let shell = args
        .shell
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| "/bin/sh".to_string());
    let reconnect = Duration::from_secs(args.reconnect_secs);
    info!(server = %args.server, shell = %shell, "starting agent");

    loop {
        tokio::select! {
            result = connection::run_session(&args.server, &shell) => {
                if let Err(e) = result {
                    warn!(error = %e, "broker session ended");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
        if args.once {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(reconnect) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}
