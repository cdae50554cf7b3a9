use thiserror::Error;
use termrelay_protocol::{ClientId, MessageType, RemoteHostId, TerminalId, TransferId};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("remote host not connected: {0}")]
    RemoteHostNotFound(RemoteHostId),

    #[error("terminal not found: {0}")]
    TerminalNotFound(TerminalId),

    #[error("terminal {terminal_id} is not hosted by remote host {remote_host_id}")]
    TerminalHostMismatch {
        terminal_id: TerminalId,
        remote_host_id: RemoteHostId,
    },

    #[error("app client {client_id} does not own terminal {terminal_id}")]
    NotOwner {
        client_id: ClientId,
        terminal_id: TerminalId,
    },

    #[error("file transfer {id}: {event} not allowed while {state}")]
    TransferState {
        id: TransferId,
        state: &'static str,
        event: &'static str,
    },

    #[error("file transfer {id}: init for request {got}")]
    TransferIdMismatch { id: TransferId, got: TransferId },

    #[error("file transfer {id} overran its size: {received} > {expected}")]
    TransferOverrun {
        id: TransferId,
        received: u64,
        expected: u64,
    },

    #[error("{kind:?} payload of {len} bytes exceeds the {max} byte frame limit")]
    PayloadTooLarge {
        kind: MessageType,
        len: usize,
        max: usize,
    },
}
