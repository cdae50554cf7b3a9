//! Front end: the app client side of the relay.
//!
//! Owns the app client sessions, checks that every terminal a client touches
//! is one it owns, and turns broker and file transfer events into
//! [`ServerMessage`]s. Like the broker it runs as one task fed through a
//! [`FrontEndHandle`].

use std::collections::{BTreeMap, HashMap};
use std::io;

use bytes::{Bytes, BytesMut};
use termrelay_protocol::{
    ClientId, ClientMessage, DEFAULT_MAX_FRAME_BYTES, HostMessage, RemoteHostId, ServerMessage,
    TerminalId, TransferId, TransferInit,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{BrokerHandle, TerminalInfo};
use crate::error::RelayError;
use crate::listing::decode_listing;
use crate::session::{ActiveSessions, ClientHandle, TransferPurpose};
use crate::transfer::{FailureReason, InitOutcome, TransferState};

/// Outbound side of one WebSocket connection.
#[derive(Debug)]
pub struct AppClient {
    id: ClientId,
    tx: mpsc::UnboundedSender<ServerMessage>,
    download_token: String,
}

impl AppClient {
    pub fn send(&self, msg: ServerMessage) {
        if self.tx.send(msg).is_err() {
            debug!(client_id = self.id, "app client writer closed, message dropped");
        }
    }

    pub fn download_token(&self) -> &str {
        &self.download_token
    }
}

impl ClientHandle for AppClient {
    fn client_id(&self) -> ClientId {
        self.id
    }
}

/// Largest file or listing delivered inline over the WebSocket (8 MiB).
pub const DEFAULT_MAX_BROWSE_BYTES: u64 = 8 * 1024 * 1024;

/// Download chunks buffered between the transfer connection and the HTTP body.
const DOWNLOAD_BACKLOG: usize = 8;

/// Size limits applied to what app clients ask for.
#[derive(Debug, Clone, Copy)]
pub struct RelayLimits {
    /// Largest frame body the host connections will encode.
    pub max_frame_bytes: usize,
    /// Largest payload a browse transfer may announce.
    pub max_browse_bytes: u64,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_browse_bytes: DEFAULT_MAX_BROWSE_BYTES,
        }
    }
}

/// Answer to a transfer connection that presented an init.
#[derive(Debug)]
pub enum InitDecision {
    /// Send the ack and switch to raw. Close right away if `completed`.
    ///
    /// Downloads carry the sink the connection writes payload into. Waiting
    /// on it is what throttles the connection to the HTTP client's pace.
    Accept {
        completed: bool,
        sink: Option<DownloadSink>,
    },
    /// Close the connection.
    Reject,
}

pub type DownloadBody = mpsc::Receiver<Result<Bytes, io::Error>>;
pub type DownloadSink = mpsc::Sender<Result<Bytes, io::Error>>;

#[derive(Debug)]
pub enum DownloadReply {
    Stream {
        content_length: u64,
        body: DownloadBody,
    },
    NotFound,
}

#[derive(Debug)]
pub enum FrontEndCommand {
    ClientConnected {
        client_id: ClientId,
        tx: mpsc::UnboundedSender<ServerMessage>,
    },
    ClientMessage {
        client_id: ClientId,
        msg: ClientMessage,
    },
    ClientClosed {
        client_id: ClientId,
    },
    Download {
        token: String,
        terminal_id: TerminalId,
        path: String,
        reply: oneshot::Sender<DownloadReply>,
    },
    RemoteHostInfo {
        remote_host_id: RemoteHostId,
        ip: String,
        user_name: String,
        host_name: String,
    },
    RemoteHostClosed {
        remote_host_id: RemoteHostId,
        closed: Vec<TerminalInfo>,
    },
    TerminalCreated {
        info: TerminalInfo,
        success: bool,
    },
    TerminalOutput {
        info: TerminalInfo,
        data: Bytes,
    },
    TerminalClosed {
        info: TerminalInfo,
    },
    TransferInit {
        init: TransferInit,
        cancel: CancellationToken,
        reply: oneshot::Sender<InitDecision>,
    },
    TransferData {
        request_id: TransferId,
        data: Bytes,
    },
    TransferClosed {
        request_id: TransferId,
    },
    TransferUnreachable {
        request_id: TransferId,
    },
}

#[derive(Debug, Clone)]
pub struct FrontEndHandle {
    tx: mpsc::UnboundedSender<FrontEndCommand>,
}

pub type FrontEndInbox = mpsc::UnboundedReceiver<FrontEndCommand>;

pub fn channel() -> (FrontEndHandle, FrontEndInbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FrontEndHandle { tx }, rx)
}

impl FrontEndHandle {
    pub fn post(&self, cmd: FrontEndCommand) {
        if self.tx.send(cmd).is_err() {
            warn!("front end is gone, dropping command");
        }
    }

    pub fn client_connected(&self, client_id: ClientId, tx: mpsc::UnboundedSender<ServerMessage>) {
        self.post(FrontEndCommand::ClientConnected { client_id, tx });
    }

    pub fn client_message(&self, client_id: ClientId, msg: ClientMessage) {
        self.post(FrontEndCommand::ClientMessage { client_id, msg });
    }

    pub fn client_closed(&self, client_id: ClientId) {
        self.post(FrontEndCommand::ClientClosed { client_id });
    }

    pub fn download(
        &self,
        token: String,
        terminal_id: TerminalId,
        path: String,
    ) -> oneshot::Receiver<DownloadReply> {
        let (reply, rx) = oneshot::channel();
        self.post(FrontEndCommand::Download {
            token,
            terminal_id,
            path,
            reply,
        });
        rx
    }

    pub fn remote_host_info(
        &self,
        remote_host_id: RemoteHostId,
        ip: String,
        user_name: String,
        host_name: String,
    ) {
        self.post(FrontEndCommand::RemoteHostInfo {
            remote_host_id,
            ip,
            user_name,
            host_name,
        });
    }

    pub fn remote_host_closed(&self, remote_host_id: RemoteHostId, closed: Vec<TerminalInfo>) {
        self.post(FrontEndCommand::RemoteHostClosed {
            remote_host_id,
            closed,
        });
    }

    pub fn terminal_created(&self, info: TerminalInfo, success: bool) {
        self.post(FrontEndCommand::TerminalCreated { info, success });
    }

    pub fn terminal_output(&self, info: TerminalInfo, data: Bytes) {
        self.post(FrontEndCommand::TerminalOutput { info, data });
    }

    pub fn terminal_closed(&self, info: TerminalInfo) {
        self.post(FrontEndCommand::TerminalClosed { info });
    }

    pub fn transfer_init(
        &self,
        init: TransferInit,
        cancel: CancellationToken,
    ) -> oneshot::Receiver<InitDecision> {
        let (reply, rx) = oneshot::channel();
        self.post(FrontEndCommand::TransferInit {
            init,
            cancel,
            reply,
        });
        rx
    }

    pub fn transfer_data(&self, request_id: TransferId, data: Bytes) {
        self.post(FrontEndCommand::TransferData { request_id, data });
    }

    pub fn transfer_closed(&self, request_id: TransferId) {
        self.post(FrontEndCommand::TransferClosed { request_id });
    }

    pub fn transfer_unreachable(&self, request_id: TransferId) {
        self.post(FrontEndCommand::TransferUnreachable { request_id });
    }
}

#[derive(Debug, Clone)]
struct RemoteHostPresence {
    ip: String,
    user_name: String,
    host_name: String,
}

enum Listener {
    Browse {
        buffer: BytesMut,
    },
    Download {
        reply: Option<oneshot::Sender<DownloadReply>>,
        /// Handed to the HTTP response together with the first chunk.
        body: Option<DownloadBody>,
        /// Kept to report a failure in the middle of the stream.
        sink: Option<DownloadSink>,
    },
}

impl Listener {
    fn open_body(&mut self) -> Option<DownloadSink> {
        match self {
            Listener::Browse { .. } => None,
            Listener::Download { body, sink, .. } => {
                let (tx, rx) = mpsc::channel(DOWNLOAD_BACKLOG);
                *body = Some(rx);
                *sink = Some(tx.clone());
                Some(tx)
            }
        }
    }
}

struct TransferRoute {
    listener: Listener,
    cancel: Option<CancellationToken>,
}

pub struct FrontEnd {
    broker: BrokerHandle,
    limits: RelayLimits,
    sessions: ActiveSessions<AppClient>,
    remote_hosts: BTreeMap<RemoteHostId, RemoteHostPresence>,
    download_tokens: HashMap<String, ClientId>,
    transfers: HashMap<TransferId, TransferRoute>,
}

impl FrontEnd {
    pub fn new(broker: BrokerHandle, limits: RelayLimits) -> Self {
        Self {
            broker,
            limits,
            sessions: ActiveSessions::new(),
            remote_hosts: BTreeMap::new(),
            download_tokens: HashMap::new(),
            transfers: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut inbox: FrontEndInbox) {
        while let Some(cmd) = inbox.recv().await {
            self.handle(cmd);
        }
        debug!("front end stopped");
    }

    pub fn handle(&mut self, cmd: FrontEndCommand) {
        match cmd {
            FrontEndCommand::ClientConnected { client_id, tx } => {
                self.on_client_connected(client_id, tx)
            }
            FrontEndCommand::ClientMessage { client_id, msg } => {
                self.on_client_message(client_id, msg)
            }
            FrontEndCommand::ClientClosed { client_id } => self.on_client_closed(client_id),
            FrontEndCommand::Download {
                token,
                terminal_id,
                path,
                reply,
            } => self.on_download(&token, terminal_id, path, reply),
            FrontEndCommand::RemoteHostInfo {
                remote_host_id,
                ip,
                user_name,
                host_name,
            } => self.on_remote_host_info(
                remote_host_id,
                RemoteHostPresence {
                    ip,
                    user_name,
                    host_name,
                },
            ),
            FrontEndCommand::RemoteHostClosed {
                remote_host_id,
                closed,
            } => self.on_remote_host_closed(remote_host_id, closed),
            FrontEndCommand::TerminalCreated { info, success } => {
                self.on_terminal_created(info, success)
            }
            FrontEndCommand::TerminalOutput { info, data } => self.on_terminal_output(info, data),
            FrontEndCommand::TerminalClosed { info } => self.on_terminal_closed(info),
            FrontEndCommand::TransferInit {
                init,
                cancel,
                reply,
            } => self.on_transfer_init(init, cancel, reply),
            FrontEndCommand::TransferData { request_id, data } => {
                self.on_transfer_data(request_id, data)
            }
            FrontEndCommand::TransferClosed { request_id } => {
                if self.sessions.transfer_session(request_id).is_some() {
                    self.fail_transfer(request_id, FailureReason::PeerClosed);
                } else {
                    debug!(request_id, "transfer connection closed");
                }
            }
            FrontEndCommand::TransferUnreachable { request_id } => {
                self.fail_transfer(request_id, FailureReason::HostLost)
            }
        }
    }

    fn on_client_connected(
        &mut self,
        client_id: ClientId,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) {
        let client = AppClient {
            id: client_id,
            tx,
            download_token: Uuid::new_v4().to_string(),
        };
        client.send(ServerMessage::SessionInfo {
            client_id,
            download_token: client.download_token.clone(),
        });
        for (id, host) in &self.remote_hosts {
            client.send(remote_host_connected(*id, host));
        }

        self.download_tokens.insert(client.download_token.clone(), client_id);
        if let Some(previous) = self.sessions.create_web_app_session(client) {
            self.download_tokens.remove(previous.client().download_token());
        }
        info!(client_id, "app client connected");
    }

    fn on_client_closed(&mut self, client_id: ClientId) {
        let Some(session) = self.sessions.remove_web_app_session(client_id) else {
            debug!(client_id, "close for unknown app client");
            return;
        };
        self.download_tokens.remove(session.client().download_token());
        for (terminal_id, remote_host_id) in session.terminals() {
            self.broker.delete_terminal(remote_host_id, terminal_id);
        }
        for id in self.sessions.transfer_ids_for_client(client_id) {
            let browse = self
                .sessions
                .transfer_session(id)
                .is_some_and(|s| s.purpose == TransferPurpose::Browse);
            if browse {
                self.fail_transfer(id, FailureReason::Abandoned);
            }
        }
        info!(client_id, terminals = session.terminal_count(), "app client disconnected");
    }

    fn on_client_message(&mut self, client_id: ClientId, msg: ClientMessage) {
        if self.sessions.web_app_session(client_id).is_none() {
            warn!(client_id, "message from unknown app client");
            return;
        }

        match msg {
            ClientMessage::TerminalReq { remote_host_id } => {
                self.broker.create_terminal(client_id, remote_host_id);
            }
            ClientMessage::TerminalResize {
                terminal_id,
                width,
                height,
            } => {
                if let Some(host) = self.authorize(client_id, terminal_id) {
                    self.broker.resize_terminal(host, terminal_id, width, height);
                }
            }
            ClientMessage::TerminalDel { terminal_id } => {
                if let Some(host) = self.authorize(client_id, terminal_id) {
                    self.sessions.remove_terminal(client_id, terminal_id);
                    self.broker.delete_terminal(host, terminal_id);
                    self.send_to(
                        client_id,
                        ServerMessage::TerminalClosed {
                            id: terminal_id,
                            remote_host_id: host,
                        },
                    );
                }
            }
            ClientMessage::TerminalKey { terminal_id, key } => {
                if let Some(host) = self.authorize(client_id, terminal_id) {
                    let data = Bytes::from(key);
                    let write = HostMessage::TerminalWrite {
                        terminal_id,
                        data: data.clone(),
                    };
                    match self.check_frame(&write) {
                        Ok(()) => self.broker.send_key_event(host, terminal_id, data),
                        Err(e) => warn!(client_id, terminal_id, error = %e, "key event dropped"),
                    }
                }
            }
            ClientMessage::FileTransferReq { terminal_id, path } => {
                if let Some(host) = self.authorize(client_id, terminal_id) {
                    self.start_transfer(
                        client_id,
                        Some(terminal_id),
                        host,
                        &path,
                        TransferPurpose::Browse,
                        Listener::Browse {
                            buffer: BytesMut::new(),
                        },
                    );
                }
            }
        }
    }

    fn on_download(
        &mut self,
        token: &str,
        terminal_id: TerminalId,
        path: String,
        reply: oneshot::Sender<DownloadReply>,
    ) {
        let Some(&client_id) = self.download_tokens.get(token) else {
            warn!(terminal_id, "download with unknown token");
            let _ = reply.send(DownloadReply::NotFound);
            return;
        };
        let Some(host) = self.authorize(client_id, terminal_id) else {
            let _ = reply.send(DownloadReply::NotFound);
            return;
        };
        self.start_transfer(
            client_id,
            None,
            host,
            &path,
            TransferPurpose::Download,
            Listener::Download {
                reply: Some(reply),
                body: None,
                sink: None,
            },
        );
    }

    /// Remote host of `terminal_id` if `client_id` owns it. Anything else is
    /// logged and dropped without telling the client.
    fn authorize(&self, client_id: ClientId, terminal_id: TerminalId) -> Option<RemoteHostId> {
        let host = self.sessions.remote_host_for_terminal(client_id, terminal_id);
        if host.is_none() {
            let err = RelayError::NotOwner {
                client_id,
                terminal_id,
            };
            warn!(error = %err, "unauthorized terminal request dropped");
        }
        host
    }

    /// A message the host connection could not encode must never reach it.
    fn check_frame(&self, msg: &HostMessage) -> Result<(), RelayError> {
        let len = msg.payload_len();
        if len > self.limits.max_frame_bytes {
            return Err(RelayError::PayloadTooLarge {
                kind: msg.message_type(),
                len,
                max: self.limits.max_frame_bytes,
            });
        }
        Ok(())
    }

    fn start_transfer(
        &mut self,
        client_id: ClientId,
        terminal_id: Option<TerminalId>,
        remote_host_id: RemoteHostId,
        path: &str,
        purpose: TransferPurpose,
        listener: Listener,
    ) {
        let session = self.sessions.create_transfer_session(
            client_id,
            terminal_id,
            remote_host_id,
            path,
            purpose,
        );
        let id = session.id();
        let request = session.transfer.request_message();
        self.transfers.insert(
            id,
            TransferRoute {
                listener,
                cancel: None,
            },
        );

        let request = match request {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "could not start file transfer");
                self.fail_transfer(id, FailureReason::Rejected);
                return;
            }
        };
        if let Err(e) = self.check_frame(&request) {
            warn!(transfer_id = id, client_id, error = %e, "file transfer request refused");
            self.fail_transfer(id, FailureReason::TooLarge);
            return;
        }
        info!(transfer_id = id, remote_host_id, path, ?purpose, "file transfer started");
        self.broker.request_file(remote_host_id, id, request);
    }

    fn on_remote_host_info(&mut self, remote_host_id: RemoteHostId, host: RemoteHostPresence) {
        self.broadcast(remote_host_connected(remote_host_id, &host));
        self.remote_hosts.insert(remote_host_id, host);
    }

    fn on_remote_host_closed(&mut self, remote_host_id: RemoteHostId, closed: Vec<TerminalInfo>) {
        for info in closed {
            let msg = if self
                .sessions
                .remove_terminal(info.app_client_id, info.terminal_id)
                .is_some()
            {
                ServerMessage::TerminalClosed {
                    id: info.terminal_id,
                    remote_host_id,
                }
            } else {
                // creation was still pending
                ServerMessage::TerminalAddFailed {
                    id: info.terminal_id,
                    remote_host_id,
                }
            };
            self.send_to(info.app_client_id, msg);
        }

        self.remote_hosts.remove(&remote_host_id);
        self.broadcast(ServerMessage::RemoteHostDisconnected { id: remote_host_id });

        for id in self.sessions.transfer_ids_for_host(remote_host_id) {
            let negotiating = self
                .sessions
                .transfer_session(id)
                .is_some_and(|s| s.transfer.state() == TransferState::Negotiating);
            if negotiating {
                self.fail_transfer(id, FailureReason::HostLost);
            }
        }
    }

    fn on_terminal_created(&mut self, info: TerminalInfo, success: bool) {
        let TerminalInfo {
            terminal_id,
            remote_host_id,
            app_client_id,
        } = info;
        if !success {
            self.send_to(
                app_client_id,
                ServerMessage::TerminalAddFailed {
                    id: terminal_id,
                    remote_host_id,
                },
            );
            return;
        }
        if self.sessions.add_terminal(app_client_id, terminal_id, remote_host_id) {
            self.send_to(
                app_client_id,
                ServerMessage::TerminalAdded {
                    id: terminal_id,
                    remote_host_id,
                },
            );
        } else {
            info!(terminal_id, app_client_id, "requesting client is gone, deleting terminal");
            self.broker.delete_terminal(remote_host_id, terminal_id);
        }
    }

    fn on_terminal_output(&mut self, info: TerminalInfo, data: Bytes) {
        if !self.sessions.is_owning_terminal(info.app_client_id, info.terminal_id) {
            debug!(terminal_id = info.terminal_id, "output for unowned terminal dropped");
            return;
        }
        self.send_to(
            info.app_client_id,
            ServerMessage::TerminalOutput {
                id: info.terminal_id,
                output: data.to_vec(),
            },
        );
    }

    fn on_terminal_closed(&mut self, info: TerminalInfo) {
        if self
            .sessions
            .remove_terminal(info.app_client_id, info.terminal_id)
            .is_some()
        {
            self.send_to(
                info.app_client_id,
                ServerMessage::TerminalClosed {
                    id: info.terminal_id,
                    remote_host_id: info.remote_host_id,
                },
            );
        }
    }

    fn on_transfer_init(
        &mut self,
        init: TransferInit,
        cancel: CancellationToken,
        reply: oneshot::Sender<InitDecision>,
    ) {
        let id = init.request_id;
        let Some(session) = self.sessions.transfer_session_mut(id) else {
            warn!(request_id = id, "init for unknown file transfer");
            let _ = reply.send(InitDecision::Reject);
            return;
        };

        if session.purpose == TransferPurpose::Browse
            && init.is_valid
            && init.size > self.limits.max_browse_bytes
        {
            warn!(
                request_id = id,
                size = init.size,
                max = self.limits.max_browse_bytes,
                "browse payload too large"
            );
            let _ = reply.send(InitDecision::Reject);
            self.fail_transfer(id, FailureReason::TooLarge);
            return;
        }

        match session.transfer.on_init(&init) {
            Err(e) => {
                // a second connection for the same request; the first one keeps going
                warn!(error = %e, "file transfer init rejected");
                let _ = reply.send(InitDecision::Reject);
            }
            Ok(InitOutcome::Rejected) => {
                let _ = reply.send(InitDecision::Reject);
                self.fail_transfer(id, FailureReason::Rejected);
            }
            Ok(InitOutcome::Ack { completed }) => {
                debug!(
                    request_id = id,
                    size = init.size,
                    is_directory = init.is_directory,
                    "file transfer acknowledged"
                );
                let route = self.transfers.get_mut(&id);
                let sink = match route {
                    Some(route) if !completed => {
                        route.cancel = Some(cancel);
                        route.listener.open_body()
                    }
                    _ => None,
                };
                if reply.send(InitDecision::Accept { completed, sink }).is_err() {
                    self.fail_transfer(id, FailureReason::PeerClosed);
                } else if completed {
                    self.complete_transfer(id);
                }
            }
        }
    }

    fn on_transfer_data(&mut self, id: TransferId, data: Bytes) {
        let Some(session) = self.sessions.transfer_session_mut(id) else {
            debug!(request_id = id, len = data.len(), "data for finished transfer dropped");
            return;
        };
        let progress = match session.transfer.on_chunk(data.len()) {
            Ok(progress) => progress,
            Err(e) => {
                warn!(error = %e, "file transfer data rejected");
                self.fail_transfer(id, FailureReason::Overrun);
                return;
            }
        };
        let Some(route) = self.transfers.get_mut(&id) else {
            return;
        };

        let delivered = match &mut route.listener {
            Listener::Browse { buffer } => {
                buffer.extend_from_slice(&data);
                true
            }
            // the payload itself travels through the sink
            Listener::Download { reply, body, .. } => {
                if progress.chunk_index == 1 {
                    match (reply.take(), body.take()) {
                        (Some(reply), Some(body)) => reply
                            .send(DownloadReply::Stream {
                                content_length: progress.expected,
                                body,
                            })
                            .is_ok(),
                        _ => false,
                    }
                } else {
                    true
                }
            }
        };

        if !delivered {
            self.fail_transfer(id, FailureReason::Abandoned);
        } else if progress.completed {
            self.complete_transfer(id);
        }
    }

    fn complete_transfer(&mut self, id: TransferId) {
        let Some(session) = self.sessions.remove_transfer_session(id) else {
            return;
        };
        let Some(route) = self.transfers.remove(&id) else {
            return;
        };
        let transfer = &session.transfer;
        info!(
            transfer_id = id,
            path = transfer.path(),
            bytes = transfer.received_size(),
            "file transfer completed"
        );

        match route.listener {
            Listener::Browse { buffer } => {
                let terminal_id = session.terminal_id.unwrap_or_default();
                let path = transfer.path().to_string();
                let msg = if transfer.is_directory() {
                    match decode_listing(&buffer) {
                        Ok(files) => ServerMessage::DirectoryListing {
                            terminal_id,
                            path,
                            files,
                        },
                        Err(e) => {
                            warn!(transfer_id = id, error = %e, "bad directory listing");
                            ServerMessage::FileTransferFailed { terminal_id, path }
                        }
                    }
                } else {
                    ServerMessage::FileContent {
                        terminal_id,
                        path,
                        data: buffer.to_vec(),
                    }
                };
                self.send_to(session.client_id, msg);
            }
            Listener::Download { reply, .. } => {
                if let Some(reply) = reply {
                    // nothing was streamed: empty payload
                    let (_, rx) = mpsc::channel(1);
                    let _ = reply.send(DownloadReply::Stream {
                        content_length: 0,
                        body: rx,
                    });
                }
            }
        }
    }

    fn fail_transfer(&mut self, id: TransferId, reason: FailureReason) {
        let Some(mut session) = self.sessions.remove_transfer_session(id) else {
            return;
        };
        session.transfer.fail(reason);
        warn!(
            transfer_id = id,
            path = session.transfer.path(),
            state = ?session.transfer.state(),
            "file transfer failed"
        );

        let Some(route) = self.transfers.remove(&id) else {
            return;
        };
        if let Some(cancel) = route.cancel {
            cancel.cancel();
        }
        match route.listener {
            Listener::Browse { .. } => self.send_to(
                session.client_id,
                ServerMessage::FileTransferFailed {
                    terminal_id: session.terminal_id.unwrap_or_default(),
                    path: session.transfer.path().to_string(),
                },
            ),
            Listener::Download { reply, sink, .. } => {
                if let Some(reply) = reply {
                    let _ = reply.send(DownloadReply::NotFound);
                } else if let Some(sink) = sink {
                    // a full body is cut short by the cancelled connection anyway
                    let _ = sink.try_send(Err(io::Error::other(format!(
                        "file transfer failed: {reason:?}"
                    ))));
                }
            }
        }
    }

    fn send_to(&self, client_id: ClientId, msg: ServerMessage) {
        match self.sessions.web_app_session(client_id) {
            Some(session) => session.client().send(msg),
            None => debug!(client_id, "app client gone, message dropped"),
        }
    }

    fn broadcast(&self, msg: ServerMessage) {
        for session in self.sessions.web_app_sessions() {
            session.client().send(msg.clone());
        }
    }
}

fn remote_host_connected(id: RemoteHostId, host: &RemoteHostPresence) -> ServerMessage {
    ServerMessage::RemoteHostConnected {
        id,
        client_ip: host.ip.clone(),
        client_user_name: host.user_name.clone(),
        client_name: host.host_name.clone(),
    }
}
