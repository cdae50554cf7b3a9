mod config;
mod host_conn;
mod http;
mod server;
mod ws;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "termrelay_server=info,libtermrelay=info".into()),
        )
        .init();

    let config = config::ServerConfig::load()?;
    server::run(config).await
}
