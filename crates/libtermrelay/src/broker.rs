//! Terminal broker: owns the remote host connections and the terminal
//! routing table.
//!
//! The broker runs as a single task. Everything reaches it as a
//! [`BrokerCommand`] through a [`BrokerHandle`], so its state is only ever
//! touched from one place and callers never wait on it.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use termrelay_protocol::{ClientId, HostMessage, RemoteHostId, TerminalId, TransferId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::RelayError;
use crate::front_end::FrontEndHandle;
use crate::ids::IdCounter;

/// Routing entry for one terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalInfo {
    pub terminal_id: TerminalId,
    pub remote_host_id: RemoteHostId,
    pub app_client_id: ClientId,
}

#[derive(Debug)]
pub enum BrokerCommand {
    HostConnected {
        remote_host_id: RemoteHostId,
        ip: String,
        tx: mpsc::UnboundedSender<HostMessage>,
    },
    HostMessage {
        remote_host_id: RemoteHostId,
        msg: HostMessage,
    },
    HostClosed {
        remote_host_id: RemoteHostId,
        unresponsive: bool,
    },
    /// The connection turned out to be a file transfer connection.
    HostDetached {
        remote_host_id: RemoteHostId,
    },
    CreateTerminal {
        app_client_id: ClientId,
        remote_host_id: RemoteHostId,
    },
    ResizeTerminal {
        remote_host_id: RemoteHostId,
        terminal_id: TerminalId,
        width: u16,
        height: u16,
    },
    DeleteTerminal {
        remote_host_id: RemoteHostId,
        terminal_id: TerminalId,
    },
    SendKeyEvent {
        remote_host_id: RemoteHostId,
        terminal_id: TerminalId,
        data: Bytes,
    },
    RequestFile {
        remote_host_id: RemoteHostId,
        request_id: TransferId,
        request: HostMessage,
    },
}

/// Cheap, cloneable sender side of the broker task.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    tx: mpsc::UnboundedSender<BrokerCommand>,
}

pub type BrokerInbox = mpsc::UnboundedReceiver<BrokerCommand>;

pub fn channel() -> (BrokerHandle, BrokerInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (BrokerHandle { tx }, rx)
}

impl BrokerHandle {
    pub fn post(&self, cmd: BrokerCommand) {
        if self.tx.send(cmd).is_err() {
            warn!("terminal broker is gone, dropping command");
        }
    }

    pub fn host_connected(
        &self,
        remote_host_id: RemoteHostId,
        ip: String,
        tx: mpsc::UnboundedSender<HostMessage>,
    ) {
        self.post(BrokerCommand::HostConnected {
            remote_host_id,
            ip,
            tx,
        });
    }

    pub fn host_message(&self, remote_host_id: RemoteHostId, msg: HostMessage) {
        self.post(BrokerCommand::HostMessage {
            remote_host_id,
            msg,
        });
    }

    pub fn host_closed(&self, remote_host_id: RemoteHostId, unresponsive: bool) {
        self.post(BrokerCommand::HostClosed {
            remote_host_id,
            unresponsive,
        });
    }

    pub fn host_detached(&self, remote_host_id: RemoteHostId) {
        self.post(BrokerCommand::HostDetached { remote_host_id });
    }

    pub fn create_terminal(&self, app_client_id: ClientId, remote_host_id: RemoteHostId) {
        self.post(BrokerCommand::CreateTerminal {
            app_client_id,
            remote_host_id,
        });
    }

    pub fn resize_terminal(
        &self,
        remote_host_id: RemoteHostId,
        terminal_id: TerminalId,
        width: u16,
        height: u16,
    ) {
        self.post(BrokerCommand::ResizeTerminal {
            remote_host_id,
            terminal_id,
            width,
            height,
        });
    }

    pub fn delete_terminal(&self, remote_host_id: RemoteHostId, terminal_id: TerminalId) {
        self.post(BrokerCommand::DeleteTerminal {
            remote_host_id,
            terminal_id,
        });
    }

    pub fn send_key_event(
        &self,
        remote_host_id: RemoteHostId,
        terminal_id: TerminalId,
        data: Bytes,
    ) {
        self.post(BrokerCommand::SendKeyEvent {
            remote_host_id,
            terminal_id,
            data,
        });
    }

    pub fn request_file(
        &self,
        remote_host_id: RemoteHostId,
        request_id: TransferId,
        request: HostMessage,
    ) {
        self.post(BrokerCommand::RequestFile {
            remote_host_id,
            request_id,
            request,
        });
    }
}

struct RemoteHost {
    tx: mpsc::UnboundedSender<HostMessage>,
    ip: String,
    terminals: HashSet<TerminalId>,
}

impl RemoteHost {
    fn send(&self, remote_host_id: RemoteHostId, msg: HostMessage) {
        if self.tx.send(msg).is_err() {
            debug!(remote_host_id, "remote host writer closed, message dropped");
        }
    }
}

pub struct TerminalBroker {
    front_end: FrontEndHandle,
    remote_hosts: HashMap<RemoteHostId, RemoteHost>,
    terminals: HashMap<TerminalId, TerminalInfo>,
    terminal_ids: IdCounter,
}

impl TerminalBroker {
    pub fn new(front_end: FrontEndHandle) -> Self {
        Self {
            front_end,
            remote_hosts: HashMap::new(),
            terminals: HashMap::new(),
            terminal_ids: IdCounter::new("terminal"),
        }
    }

    pub async fn run(mut self, mut inbox: BrokerInbox) {
        while let Some(cmd) = inbox.recv().await {
            self.handle(cmd);
        }
        debug!("terminal broker stopped");
    }

    pub fn handle(&mut self, cmd: BrokerCommand) {
        match cmd {
            BrokerCommand::HostConnected {
                remote_host_id,
                ip,
                tx,
            } => self.on_host_connected(remote_host_id, ip, tx),
            BrokerCommand::HostMessage {
                remote_host_id,
                msg,
            } => self.on_host_message(remote_host_id, msg),
            BrokerCommand::HostClosed {
                remote_host_id,
                unresponsive,
            } => self.on_host_closed(remote_host_id, unresponsive),
            BrokerCommand::HostDetached { remote_host_id } => {
                if let Some(host) = self.remote_hosts.remove(&remote_host_id) {
                    debug!(
                        remote_host_id,
                        terminals = host.terminals.len(),
                        "connection detached from remote hosts"
                    );
                }
            }
            BrokerCommand::CreateTerminal {
                app_client_id,
                remote_host_id,
            } => {
                self.create_terminal(app_client_id, remote_host_id);
            }
            BrokerCommand::ResizeTerminal {
                remote_host_id,
                terminal_id,
                width,
                height,
            } => self.forward(
                remote_host_id,
                terminal_id,
                HostMessage::ResizeTerminal {
                    terminal_id,
                    width,
                    height,
                },
            ),
            BrokerCommand::DeleteTerminal {
                remote_host_id,
                terminal_id,
            } => self.delete_terminal(remote_host_id, terminal_id),
            BrokerCommand::SendKeyEvent {
                remote_host_id,
                terminal_id,
                data,
            } => self.forward(
                remote_host_id,
                terminal_id,
                HostMessage::TerminalWrite { terminal_id, data },
            ),
            BrokerCommand::RequestFile {
                remote_host_id,
                request_id,
                request,
            } => match self.remote_hosts.get(&remote_host_id) {
                Some(host) => {
                    debug!(remote_host_id, request_id, "file transfer requested");
                    host.send(remote_host_id, request);
                }
                None => {
                    warn!(remote_host_id, request_id, "file transfer for unknown remote host");
                    self.front_end.transfer_unreachable(request_id);
                }
            },
        }
    }

    /// Allocate a terminal on `remote_host_id` for `app_client_id`.
    pub fn create_terminal(
        &mut self,
        app_client_id: ClientId,
        remote_host_id: RemoteHostId,
    ) -> Option<TerminalId> {
        let Some(host) = self.remote_hosts.get_mut(&remote_host_id) else {
            warn!(app_client_id, remote_host_id, "create terminal on unknown remote host");
            return None;
        };

        let mut terminal_id = self.terminal_ids.next();
        while self.terminals.contains_key(&terminal_id) {
            terminal_id = self.terminal_ids.next();
        }
        self.terminals.insert(
            terminal_id,
            TerminalInfo {
                terminal_id,
                remote_host_id,
                app_client_id,
            },
        );
        host.terminals.insert(terminal_id);
        host.send(remote_host_id, HostMessage::CreateTerminal { terminal_id });
        info!(terminal_id, remote_host_id, app_client_id, "terminal requested");
        Some(terminal_id)
    }

    pub fn delete_terminal(&mut self, remote_host_id: RemoteHostId, terminal_id: TerminalId) {
        if let Err(e) = self.check_route(remote_host_id, terminal_id) {
            warn!(error = %e, "delete terminal rejected");
            return;
        }
        self.remove_route(terminal_id);
        if let Some(host) = self.remote_hosts.get(&remote_host_id) {
            host.send(remote_host_id, HostMessage::DeleteTerminal { terminal_id });
        }
        info!(terminal_id, remote_host_id, "terminal deleted");
    }

    pub fn terminal(&self, terminal_id: TerminalId) -> Option<&TerminalInfo> {
        self.terminals.get(&terminal_id)
    }

    pub fn is_connected(&self, remote_host_id: RemoteHostId) -> bool {
        self.remote_hosts.contains_key(&remote_host_id)
    }

    fn forward(&self, remote_host_id: RemoteHostId, terminal_id: TerminalId, msg: HostMessage) {
        if let Err(e) = self.check_route(remote_host_id, terminal_id) {
            warn!(error = %e, "dropping terminal command");
            return;
        }
        if let Some(host) = self.remote_hosts.get(&remote_host_id) {
            host.send(remote_host_id, msg);
        }
    }

    fn check_route(
        &self,
        remote_host_id: RemoteHostId,
        terminal_id: TerminalId,
    ) -> Result<&TerminalInfo, RelayError> {
        let info = self
            .terminals
            .get(&terminal_id)
            .ok_or(RelayError::TerminalNotFound(terminal_id))?;
        if info.remote_host_id != remote_host_id {
            return Err(RelayError::TerminalHostMismatch {
                terminal_id,
                remote_host_id,
            });
        }
        if !self.remote_hosts.contains_key(&remote_host_id) {
            return Err(RelayError::RemoteHostNotFound(remote_host_id));
        }
        Ok(info)
    }

    fn remove_route(&mut self, terminal_id: TerminalId) -> Option<TerminalInfo> {
        let info = self.terminals.remove(&terminal_id)?;
        if let Some(host) = self.remote_hosts.get_mut(&info.remote_host_id) {
            host.terminals.remove(&terminal_id);
        }
        Some(info)
    }

    fn on_host_connected(
        &mut self,
        remote_host_id: RemoteHostId,
        ip: String,
        tx: mpsc::UnboundedSender<HostMessage>,
    ) {
        info!(remote_host_id, ip = %ip, "remote host connected");
        let host = RemoteHost {
            tx,
            ip,
            terminals: HashSet::new(),
        };
        if self.remote_hosts.insert(remote_host_id, host).is_some() {
            warn!(remote_host_id, "remote host id reused while still connected");
        }
    }

    fn on_host_message(&mut self, remote_host_id: RemoteHostId, msg: HostMessage) {
        let Some(host) = self.remote_hosts.get(&remote_host_id) else {
            debug!(remote_host_id, "message from closed remote host dropped");
            return;
        };

        match msg {
            HostMessage::Ping => host.send(remote_host_id, HostMessage::Pong),
            HostMessage::Pong => {}
            HostMessage::ClientInfo {
                user_name,
                host_name,
            } => {
                info!(
                    remote_host_id,
                    user_name = %user_name,
                    host_name = %host_name,
                    "remote host identified"
                );
                self.front_end
                    .remote_host_info(remote_host_id, host.ip.clone(), user_name, host_name);
            }
            HostMessage::TerminalCreated {
                terminal_id,
                success,
            } => {
                let info = match self.check_route(remote_host_id, terminal_id) {
                    Ok(info) => *info,
                    Err(e) => {
                        warn!(error = %e, "terminal created notification dropped");
                        return;
                    }
                };
                if !success {
                    warn!(terminal_id, remote_host_id, "remote host failed to create terminal");
                    self.remove_route(terminal_id);
                }
                self.front_end.terminal_created(info, success);
            }
            HostMessage::TerminalRead { terminal_id, data } => {
                host.send(remote_host_id, HostMessage::TerminalReadAck);
                match self.check_route(remote_host_id, terminal_id) {
                    Ok(info) => self.front_end.terminal_output(*info, data),
                    Err(e) => debug!(error = %e, "terminal output dropped"),
                }
            }
            HostMessage::TerminalEnd { terminal_id } => {
                if let Err(e) = self.check_route(remote_host_id, terminal_id) {
                    warn!(error = %e, "terminal end dropped");
                    return;
                }
                if let Some(info) = self.remove_route(terminal_id) {
                    info!(terminal_id, remote_host_id, "terminal ended");
                    self.front_end.terminal_closed(info);
                }
            }
            other => {
                warn!(
                    remote_host_id,
                    kind = ?other.message_type(),
                    "unexpected message from remote host"
                );
            }
        }
    }

    fn on_host_closed(&mut self, remote_host_id: RemoteHostId, unresponsive: bool) {
        let Some(host) = self.remote_hosts.remove(&remote_host_id) else {
            debug!(remote_host_id, "close for unknown remote host");
            return;
        };
        if unresponsive {
            warn!(remote_host_id, "remote host unresponsive, dropping it");
        } else {
            info!(remote_host_id, "remote host disconnected");
        }

        let mut closed: Vec<TerminalInfo> = host
            .terminals
            .iter()
            .filter_map(|terminal_id| self.terminals.remove(terminal_id))
            .collect();
        closed.sort_by_key(|info| info.terminal_id);
        self.front_end.remote_host_closed(remote_host_id, closed);
    }
}
