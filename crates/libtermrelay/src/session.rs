use std::collections::HashMap;

use termrelay_protocol::{ClientId, RemoteHostId, TerminalId, TransferDirection, TransferId};
use tracing::{debug, warn};

use crate::ids::IdCounter;
use crate::transfer::FileTransfer;

/// Identity of the transport behind an app client session.
pub trait ClientHandle {
    fn client_id(&self) -> ClientId;
}

/// One connected browser and the terminals it owns.
#[derive(Debug)]
pub struct WebAppSession<H> {
    client: H,
    terminals: HashMap<TerminalId, RemoteHostId>,
}

impl<H: ClientHandle> WebAppSession<H> {
    fn new(client: H) -> Self {
        Self {
            client,
            terminals: HashMap::new(),
        }
    }

    pub fn client(&self) -> &H {
        &self.client
    }

    pub fn client_id(&self) -> ClientId {
        self.client.client_id()
    }

    pub fn owns(&self, terminal_id: TerminalId) -> bool {
        self.terminals.contains_key(&terminal_id)
    }

    pub fn remote_host_for(&self, terminal_id: TerminalId) -> Option<RemoteHostId> {
        self.terminals.get(&terminal_id).copied()
    }

    pub fn terminals(&self) -> impl Iterator<Item = (TerminalId, RemoteHostId)> + '_ {
        self.terminals.iter().map(|(t, h)| (*t, *h))
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }
}

/// Who is waiting for a file transfer's bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPurpose {
    /// Result goes back over the client's WebSocket.
    Browse,
    /// Result is streamed as an HTTP download.
    Download,
}

#[derive(Debug)]
pub struct FileTransferSession {
    pub client_id: ClientId,
    /// Set when the transfer was requested from a terminal view.
    pub terminal_id: Option<TerminalId>,
    pub remote_host_id: RemoteHostId,
    pub purpose: TransferPurpose,
    pub transfer: FileTransfer,
}

impl FileTransferSession {
    pub fn id(&self) -> TransferId {
        self.transfer.id()
    }
}

/// Registry of app client sessions and in-flight file transfers.
pub struct ActiveSessions<H> {
    web_app_sessions: HashMap<ClientId, WebAppSession<H>>,
    transfer_sessions: HashMap<TransferId, FileTransferSession>,
    transfer_ids: IdCounter,
}

impl<H: ClientHandle> ActiveSessions<H> {
    pub fn new() -> Self {
        Self {
            web_app_sessions: HashMap::new(),
            transfer_sessions: HashMap::new(),
            transfer_ids: IdCounter::new("file transfer"),
        }
    }

    /// Register a newly connected client. An existing session for the same
    /// client id is replaced and returned.
    pub fn create_web_app_session(&mut self, client: H) -> Option<WebAppSession<H>> {
        let client_id = client.client_id();
        let previous = self.web_app_sessions.insert(client_id, WebAppSession::new(client));
        if previous.is_some() {
            warn!(client_id, "replacing existing web app session");
        }
        previous
    }

    pub fn web_app_session(&self, client_id: ClientId) -> Option<&WebAppSession<H>> {
        self.web_app_sessions.get(&client_id)
    }

    pub fn web_app_session_for(&self, client: &H) -> Option<&WebAppSession<H>> {
        self.web_app_session(client.client_id())
    }

    pub fn web_app_sessions(&self) -> impl Iterator<Item = &WebAppSession<H>> {
        self.web_app_sessions.values()
    }

    pub fn remove_web_app_session(&mut self, client_id: ClientId) -> Option<WebAppSession<H>> {
        self.web_app_sessions.remove(&client_id)
    }

    /// Record that `client_id` owns `terminal_id`. Returns false when the
    /// client has no session.
    pub fn add_terminal(
        &mut self,
        client_id: ClientId,
        terminal_id: TerminalId,
        remote_host_id: RemoteHostId,
    ) -> bool {
        match self.web_app_sessions.get_mut(&client_id) {
            Some(session) => {
                session.terminals.insert(terminal_id, remote_host_id);
                true
            }
            None => false,
        }
    }

    pub fn remove_terminal(
        &mut self,
        client_id: ClientId,
        terminal_id: TerminalId,
    ) -> Option<RemoteHostId> {
        self.web_app_sessions
            .get_mut(&client_id)?
            .terminals
            .remove(&terminal_id)
    }

    pub fn is_owning_terminal(&self, client_id: ClientId, terminal_id: TerminalId) -> bool {
        self.web_app_session(client_id)
            .is_some_and(|s| s.owns(terminal_id))
    }

    /// Remote host of a terminal, provided `client_id` owns it.
    pub fn remote_host_for_terminal(
        &self,
        client_id: ClientId,
        terminal_id: TerminalId,
    ) -> Option<RemoteHostId> {
        self.web_app_session(client_id)?.remote_host_for(terminal_id)
    }

    /// Owner of a terminal, searched across all sessions.
    pub fn client_for_terminal(&self, terminal_id: TerminalId) -> Option<ClientId> {
        self.web_app_sessions
            .values()
            .find(|s| s.owns(terminal_id))
            .map(|s| s.client_id())
    }

    /// Start tracking a new requester-side transfer with a fresh id.
    pub fn create_transfer_session(
        &mut self,
        client_id: ClientId,
        terminal_id: Option<TerminalId>,
        remote_host_id: RemoteHostId,
        path: &str,
        purpose: TransferPurpose,
    ) -> &mut FileTransferSession {
        let mut id = self.transfer_ids.next();
        while self.transfer_sessions.contains_key(&id) {
            debug!(transfer_id = id, "transfer id still in flight, skipping");
            id = self.transfer_ids.next();
        }
        let session = FileTransferSession {
            client_id,
            terminal_id,
            remote_host_id,
            purpose,
            transfer: FileTransfer::requester(id, path, TransferDirection::Fetch),
        };
        self.transfer_sessions.entry(id).or_insert(session)
    }

    pub fn transfer_session(&self, id: TransferId) -> Option<&FileTransferSession> {
        self.transfer_sessions.get(&id)
    }

    pub fn transfer_session_mut(&mut self, id: TransferId) -> Option<&mut FileTransferSession> {
        self.transfer_sessions.get_mut(&id)
    }

    pub fn remove_transfer_session(&mut self, id: TransferId) -> Option<FileTransferSession> {
        self.transfer_sessions.remove(&id)
    }

    pub fn transfer_ids_for_host(&self, remote_host_id: RemoteHostId) -> Vec<TransferId> {
        self.transfer_sessions
            .values()
            .filter(|s| s.remote_host_id == remote_host_id)
            .map(FileTransferSession::id)
            .collect()
    }

    pub fn transfer_ids_for_client(&self, client_id: ClientId) -> Vec<TransferId> {
        self.transfer_sessions
            .values()
            .filter(|s| s.client_id == client_id)
            .map(FileTransferSession::id)
            .collect()
    }

    pub fn transfer_count(&self) -> usize {
        self.transfer_sessions.len()
    }
}

impl<H: ClientHandle> Default for ActiveSessions<H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransferState;

    #[derive(Debug)]
    struct FakeClient(ClientId);

    impl ClientHandle for FakeClient {
        fn client_id(&self) -> ClientId {
            self.0
        }
    }

    #[test]
    fn session_lifecycle() {
        let mut sessions = ActiveSessions::new();
        assert!(sessions.create_web_app_session(FakeClient(1)).is_none());
        assert!(sessions.web_app_session_for(&FakeClient(1)).is_some());
        assert!(sessions.web_app_session(2).is_none());

        assert!(sessions.remove_web_app_session(1).is_some());
        assert!(sessions.web_app_session(1).is_none());
        assert!(sessions.remove_web_app_session(1).is_none());
    }

    #[test]
    fn terminal_ownership_is_per_client() {
        let mut sessions = ActiveSessions::new();
        sessions.create_web_app_session(FakeClient(1));
        sessions.create_web_app_session(FakeClient(2));

        assert!(sessions.add_terminal(1, 10, 7));
        assert!(sessions.is_owning_terminal(1, 10));
        assert!(!sessions.is_owning_terminal(2, 10));
        assert_eq!(sessions.remote_host_for_terminal(1, 10), Some(7));
        assert_eq!(sessions.remote_host_for_terminal(2, 10), None);
        assert_eq!(sessions.client_for_terminal(10), Some(1));

        assert_eq!(sessions.remove_terminal(2, 10), None);
        assert_eq!(sessions.remove_terminal(1, 10), Some(7));
        assert!(!sessions.is_owning_terminal(1, 10));
    }

    #[test]
    fn add_terminal_without_session_fails() {
        let mut sessions: ActiveSessions<FakeClient> = ActiveSessions::new();
        assert!(!sessions.add_terminal(3, 1, 1));
    }

    #[test]
    fn transfer_ids_are_unique() {
        let mut sessions: ActiveSessions<FakeClient> = ActiveSessions::new();
        let a = sessions
            .create_transfer_session(1, Some(10), 7, "/a", TransferPurpose::Browse)
            .id();
        let b = sessions
            .create_transfer_session(1, None, 8, "/b", TransferPurpose::Download)
            .id();
        assert_ne!(a, b);
        assert_eq!(sessions.transfer_count(), 2);

        let session = sessions.transfer_session(b).unwrap();
        assert_eq!(session.transfer.path(), "/b");
        assert_eq!(session.transfer.state(), TransferState::Created);
        assert_eq!(session.purpose, TransferPurpose::Download);

        assert_eq!(sessions.transfer_ids_for_host(7), vec![a]);
        let mut by_client = sessions.transfer_ids_for_client(1);
        by_client.sort();
        assert_eq!(by_client, vec![a, b]);

        assert!(sessions.remove_transfer_session(a).is_some());
        assert!(sessions.transfer_session(a).is_none());
    }

    #[test]
    fn wrapped_counter_skips_in_flight_ids() {
        let mut sessions: ActiveSessions<FakeClient> = ActiveSessions::new();
        let first = sessions
            .create_transfer_session(1, None, 7, "/a", TransferPurpose::Browse)
            .id();
        sessions.transfer_ids = IdCounter::new("file transfer");
        let second = sessions
            .create_transfer_session(1, None, 7, "/b", TransferPurpose::Browse)
            .id();
        assert_ne!(first, second);
        assert_eq!(sessions.transfer_session(first).unwrap().transfer.path(), "/a");
    }
}
