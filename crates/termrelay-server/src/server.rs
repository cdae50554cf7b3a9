use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Context;
use libtermrelay::{BrokerHandle, FrontEndHandle, RelayLimits};
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::ServerConfig;
use crate::host_conn::{self, HostConnConfig};
use crate::http::{self, AppState};

/// Transport-level ids for remote host and app client connections.
#[derive(Debug, Default)]
pub struct ConnectionIds(AtomicU32);

impl ConnectionIds {
    pub fn next(&self) -> u32 {
        loop {
            let id = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }
}

pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let host_listener = TcpListener::bind(config.host_listen)
        .await
        .with_context(|| {
            format!("failed to bind remote host listener on {}", config.host_listen)
        })?;
    let web_listener = TcpListener::bind(config.web_listen)
        .await
        .with_context(|| format!("failed to bind web listener on {}", config.web_listen))?;

    let (broker, front_end) = libtermrelay::spawn_relay(RelayLimits {
        max_frame_bytes: config.max_frame_bytes,
        max_browse_bytes: config.max_browse_bytes,
    });

    tokio::spawn(accept_remote_hosts(
        host_listener,
        broker,
        front_end.clone(),
        HostConnConfig {
            ping_interval: config.ping_interval(),
            peer_timeout: config.peer_timeout(),
            max_frame_bytes: config.max_frame_bytes,
        },
    ));

    let state = Arc::new(AppState {
        front_end,
        client_ids: ConnectionIds::default(),
    });
    let app = http::router(state, &config.static_dir, &config.allow_origins)?;

    info!(
        web = %config.web_listen,
        hosts = %config.host_listen,
        static_dir = %config.static_dir.display(),
        "termrelay server started"
    );
    axum::serve(web_listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("termrelay server stopped");
    Ok(())
}

async fn accept_remote_hosts(
    listener: TcpListener,
    broker: BrokerHandle,
    front_end: FrontEndHandle,
    config: HostConnConfig,
) {
    let ids = ConnectionIds::default();
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let remote_host_id = ids.next();
                let broker = broker.clone();
                let front_end = front_end.clone();
                let config = config.clone();
                tokio::spawn(host_conn::handle_connection(
                    stream,
                    addr,
                    remote_host_id,
                    broker,
                    front_end,
                    config,
                ));
            }
            Err(e) => {
                error!("accept error: {e}");
            }
        }
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down...");
}
