pub mod codec;
pub mod error;
pub mod wire;

use serde::{Deserialize, Serialize};

pub use codec::{CodecMode, DEFAULT_MAX_FRAME_BYTES, HostCodec, Inbound};
pub use error::ProtocolError;
pub use wire::{
    ClientId, HostMessage, MessageType, RemoteHostId, TerminalId, TransferDirection,
    TransferId, TransferInit,
};

/// Browser-to-broker messages, one JSON object per WebSocket text frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    #[serde(alias = "terminal_add")]
    TerminalReq { remote_host_id: RemoteHostId },
    TerminalResize {
        terminal_id: TerminalId,
        width: u16,
        height: u16,
    },
    TerminalDel {
        #[serde(alias = "id")]
        terminal_id: TerminalId,
    },
    TerminalKey {
        #[serde(alias = "id")]
        terminal_id: TerminalId,
        key: String,
    },
    FileTransferReq {
        terminal_id: TerminalId,
        path: String,
    },
}

/// Broker-to-browser events.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every WebSocket; the token authorizes `/download`.
    SessionInfo {
        client_id: ClientId,
        download_token: String,
    },
    TerminalAdded {
        id: TerminalId,
        remote_host_id: RemoteHostId,
    },
    TerminalAddFailed {
        id: TerminalId,
        remote_host_id: RemoteHostId,
    },
    TerminalOutput {
        id: TerminalId,
        #[serde(with = "base64_bytes")]
        output: Vec<u8>,
    },
    TerminalClosed {
        id: TerminalId,
        remote_host_id: RemoteHostId,
    },
    RemoteHostConnected {
        id: RemoteHostId,
        client_ip: String,
        client_user_name: String,
        client_name: String,
    },
    RemoteHostDisconnected {
        id: RemoteHostId,
    },
    DirectoryListing {
        terminal_id: TerminalId,
        path: String,
        files: Vec<DirEntry>,
    },
    FileContent {
        terminal_id: TerminalId,
        path: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    FileTransferFailed {
        terminal_id: TerminalId,
        path: String,
    },
}

/// One entry of a serialized directory listing.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Base64 encoding for byte arrays in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
