use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use libtermrelay::OutputWatermark;
use termrelay_protocol::{HostCodec, HostMessage, Inbound};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::terminal::{TerminalEvent, Terminals};
use crate::transfer;

/// Pty events buffered between the reader threads and the connection.
const EVENT_BACKLOG: usize = 4;

/// Per-connection state of the agent: the shells plus output flow control.
pub struct HostAgent {
    server: String,
    terminals: Terminals,
    watermark: OutputWatermark,
}

impl HostAgent {
    pub fn new(server: impl Into<String>, terminals: Terminals) -> Self {
        Self {
            server: server.into(),
            terminals,
            watermark: OutputWatermark::new(),
        }
    }

    pub fn reading_enabled(&self) -> bool {
        self.watermark.reading_enabled()
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }

    /// Apply one broker message. Returns the reply to send, if any.
    pub fn handle(&mut self, msg: HostMessage) -> Option<HostMessage> {
        match msg {
            HostMessage::Ping => Some(HostMessage::Pong),
            HostMessage::Pong => None,
            HostMessage::CreateTerminal { terminal_id } => {
                let success = match self.terminals.create(terminal_id) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(terminal_id, error = %e, "failed to create terminal");
                        false
                    }
                };
                Some(HostMessage::TerminalCreated {
                    terminal_id,
                    success,
                })
            }
            HostMessage::ResizeTerminal {
                terminal_id,
                width,
                height,
            } => {
                if let Err(e) = self.terminals.resize(terminal_id, width, height) {
                    warn!(terminal_id, width, height, error = %e, "resize failed");
                }
                None
            }
            HostMessage::DeleteTerminal { terminal_id } => {
                if !self.terminals.remove(terminal_id) {
                    debug!(terminal_id, "delete for unknown terminal");
                }
                None
            }
            HostMessage::TerminalWrite { terminal_id, data } => {
                if let Err(e) = self.terminals.write(terminal_id, &data) {
                    warn!(terminal_id, error = %e, "terminal write failed");
                }
                None
            }
            HostMessage::TerminalReadAck => {
                if let Some(enabled) = self.watermark.on_acked() {
                    debug!(enabled, pending = self.watermark.pending(), "output reading toggled");
                }
                None
            }
            HostMessage::TransferRequest {
                request_id,
                direction,
                path,
            } => {
                debug!(request_id, ?direction, path = %path, "transfer requested");
                tokio::spawn(transfer::serve(self.server.clone(), request_id, direction, path));
                None
            }
            other => {
                warn!(kind = ?other.message_type(), "unexpected message from broker");
                None
            }
        }
    }

    /// Turn a pty event into the message for the broker.
    pub fn on_event(&mut self, event: TerminalEvent) -> Option<HostMessage> {
        match event {
            TerminalEvent::Output { terminal_id, data } => {
                if !self.terminals.contains(terminal_id) {
                    return None;
                }
                if let Some(enabled) = self.watermark.on_sent() {
                    debug!(enabled, pending = self.watermark.pending(), "output reading toggled");
                }
                Some(HostMessage::TerminalRead { terminal_id, data })
            }
            TerminalEvent::Exited { terminal_id } => {
                // deleted terminals were already reported by the broker
                if !self.terminals.remove(terminal_id) {
                    return None;
                }
                info!(terminal_id, "shell exited");
                Some(HostMessage::TerminalEnd { terminal_id })
            }
        }
    }
}

/// Serve one broker connection until it closes.
pub async fn run_session(server: &str, shell: &str) -> anyhow::Result<()> {
    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect to broker at {server}"))?;
    let mut conn = Framed::new(stream, HostCodec::new());
    info!(server, "connected to broker");

    conn.send(HostMessage::ClientInfo {
        user_name: user_name(),
        host_name: host_name(),
    })
    .await?;

    let (events_tx, mut events_rx) = mpsc::channel(EVENT_BACKLOG);
    let mut agent = HostAgent::new(server, Terminals::new(shell, events_tx));

    loop {
        tokio::select! {
            frame = conn.next() => {
                let reply = match frame {
                    Some(Ok(Inbound::Message(msg))) => agent.handle(msg),
                    Some(Ok(Inbound::Malformed(e))) => {
                        warn!(error = %e, "dropping malformed frame");
                        None
                    }
                    Some(Ok(Inbound::Raw(_))) => {
                        warn!("raw data on control connection");
                        None
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        info!(terminals = agent.terminal_count(), "broker closed the connection");
                        return Ok(());
                    }
                };
                if let Some(reply) = reply {
                    conn.send(reply).await?;
                }
            }
            Some(event) = events_rx.recv(), if agent.reading_enabled() => {
                if let Some(msg) = agent.on_event(event) {
                    conn.send(msg).await?;
                }
            }
        }
    }
}

fn user_name() -> String {
    std::env::var("USER").unwrap_or_else(|_| "unknown".to_string())
}

fn host_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|name| name.trim().to_string())
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}
