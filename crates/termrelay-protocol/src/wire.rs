use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Process-wide terminal identifier assigned by the broker.
pub type TerminalId = u32;
/// Connection id of a remote host agent.
pub type RemoteHostId = u32;
/// Connection id of a browser app client.
pub type ClientId = u32;
/// Identifier of a file transfer, shared by both ends of the transfer connection.
pub type TransferId = u32;

/// One-byte tag leading every binary frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 1,
    Pong = 2,
    ClientInfo = 3,
    CreateTerminal = 4,
    OnTerminalCreated = 5,
    ResizeTerminal = 6,
    DeleteTerminal = 7,
    OnTerminalWrite = 8,
    OnTerminalRead = 9,
    OnTerminalReadAck = 10,
    OnTerminalEnd = 11,
    FileTransferReq = 12,
    FileTransferInit = 13,
    FileTransferAck = 14,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Ok(match tag {
            1 => MessageType::Ping,
            2 => MessageType::Pong,
            3 => MessageType::ClientInfo,
            4 => MessageType::CreateTerminal,
            5 => MessageType::OnTerminalCreated,
            6 => MessageType::ResizeTerminal,
            7 => MessageType::DeleteTerminal,
            8 => MessageType::OnTerminalWrite,
            9 => MessageType::OnTerminalRead,
            10 => MessageType::OnTerminalReadAck,
            11 => MessageType::OnTerminalEnd,
            12 => MessageType::FileTransferReq,
            13 => MessageType::FileTransferInit,
            14 => MessageType::FileTransferAck,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

/// Which end of a transfer produces the payload.
///
/// `Fetch` means the side that dials the transfer connection (the remote
/// host) is the source and the requester is the sink. `Push` is the reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Push = 0,
    Fetch = 1,
}

impl TransferDirection {
    pub fn from_flag(flag: u8) -> Self {
        if flag == 0 {
            TransferDirection::Push
        } else {
            TransferDirection::Fetch
        }
    }

    pub fn flag(self) -> u8 {
        self as u8
    }
}

/// Body of FILE_TRANSFER_INIT, the responder's answer to a transfer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferInit {
    pub request_id: TransferId,
    pub is_valid: bool,
    pub is_directory: bool,
    pub size: u64,
}

impl TransferInit {
    pub fn rejected(request_id: TransferId) -> Self {
        Self {
            request_id,
            is_valid: false,
            is_directory: false,
            size: 0,
        }
    }
}

/// A decoded message of the remote host protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMessage {
    Ping,
    Pong,
    ClientInfo {
        user_name: String,
        host_name: String,
    },
    CreateTerminal {
        terminal_id: TerminalId,
    },
    TerminalCreated {
        terminal_id: TerminalId,
        success: bool,
    },
    ResizeTerminal {
        terminal_id: TerminalId,
        width: u16,
        height: u16,
    },
    DeleteTerminal {
        terminal_id: TerminalId,
    },
    /// Keystrokes travelling broker -> host.
    TerminalWrite {
        terminal_id: TerminalId,
        data: Bytes,
    },
    /// Shell output travelling host -> broker.
    TerminalRead {
        terminal_id: TerminalId,
        data: Bytes,
    },
    TerminalReadAck,
    TerminalEnd {
        terminal_id: TerminalId,
    },
    TransferRequest {
        request_id: TransferId,
        direction: TransferDirection,
        path: String,
    },
    TransferInit(TransferInit),
    TransferAck,
}

impl HostMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            HostMessage::Ping => MessageType::Ping,
            HostMessage::Pong => MessageType::Pong,
            HostMessage::ClientInfo { .. } => MessageType::ClientInfo,
            HostMessage::CreateTerminal { .. } => MessageType::CreateTerminal,
            HostMessage::TerminalCreated { .. } => MessageType::OnTerminalCreated,
            HostMessage::ResizeTerminal { .. } => MessageType::ResizeTerminal,
            HostMessage::DeleteTerminal { .. } => MessageType::DeleteTerminal,
            HostMessage::TerminalWrite { .. } => MessageType::OnTerminalWrite,
            HostMessage::TerminalRead { .. } => MessageType::OnTerminalRead,
            HostMessage::TerminalReadAck => MessageType::OnTerminalReadAck,
            HostMessage::TerminalEnd { .. } => MessageType::OnTerminalEnd,
            HostMessage::TransferRequest { .. } => MessageType::FileTransferReq,
            HostMessage::TransferInit(_) => MessageType::FileTransferInit,
            HostMessage::TransferAck => MessageType::FileTransferAck,
        }
    }

    /// Length of the message body, i.e. what the frame header announces.
    pub fn payload_len(&self) -> usize {
        match self {
            HostMessage::Ping
            | HostMessage::Pong
            | HostMessage::TerminalReadAck
            | HostMessage::TransferAck => 0,
            HostMessage::ClientInfo {
                user_name,
                host_name,
            } => user_name.len() + 1 + host_name.len(),
            HostMessage::CreateTerminal { .. }
            | HostMessage::DeleteTerminal { .. }
            | HostMessage::TerminalEnd { .. } => 4,
            HostMessage::TerminalCreated { .. } => 5,
            HostMessage::ResizeTerminal { .. } => 8,
            HostMessage::TerminalWrite { data, .. } | HostMessage::TerminalRead { data, .. } => {
                4 + data.len()
            }
            HostMessage::TransferRequest { path, .. } => 5 + path.len(),
            HostMessage::TransferInit(_) => 14,
        }
    }

    /// Append the message body (without the frame header) to `dst`.
    pub fn encode_payload(&self, dst: &mut BytesMut) {
        match self {
            HostMessage::Ping
            | HostMessage::Pong
            | HostMessage::TerminalReadAck
            | HostMessage::TransferAck => {}
            HostMessage::ClientInfo {
                user_name,
                host_name,
            } => {
                dst.put_slice(user_name.as_bytes());
                dst.put_u8(0);
                dst.put_slice(host_name.as_bytes());
            }
            HostMessage::CreateTerminal { terminal_id }
            | HostMessage::DeleteTerminal { terminal_id }
            | HostMessage::TerminalEnd { terminal_id } => dst.put_u32_le(*terminal_id),
            HostMessage::TerminalCreated {
                terminal_id,
                success,
            } => {
                dst.put_u32_le(*terminal_id);
                dst.put_u8(u8::from(*success));
            }
            HostMessage::ResizeTerminal {
                terminal_id,
                width,
                height,
            } => {
                dst.put_u32_le(*terminal_id);
                dst.put_u16_le(*width);
                dst.put_u16_le(*height);
            }
            HostMessage::TerminalWrite { terminal_id, data }
            | HostMessage::TerminalRead { terminal_id, data } => {
                dst.put_u32_le(*terminal_id);
                dst.put_slice(data);
            }
            HostMessage::TransferRequest {
                request_id,
                direction,
                path,
            } => {
                dst.put_u32_le(*request_id);
                dst.put_u8(direction.flag());
                dst.put_slice(path.as_bytes());
            }
            HostMessage::TransferInit(init) => {
                dst.put_u32_le(init.request_id);
                dst.put_u8(u8::from(init.is_valid));
                dst.put_u8(u8::from(init.is_directory));
                dst.put_u64_le(init.size);
            }
        }
    }

    /// Decode the body of a frame whose tag has already been resolved.
    pub fn decode(kind: MessageType, payload: Bytes) -> Result<Self, ProtocolError> {
        let mut r = FieldReader { kind, buf: payload };
        let msg = match kind {
            MessageType::Ping => HostMessage::Ping,
            MessageType::Pong => HostMessage::Pong,
            MessageType::OnTerminalReadAck => HostMessage::TerminalReadAck,
            MessageType::FileTransferAck => HostMessage::TransferAck,
            MessageType::ClientInfo => {
                let raw = r.rest();
                let nul = raw
                    .iter()
                    .position(|b| *b == 0)
                    .ok_or(ProtocolError::Truncated {
                        message: kind,
                        field: "host_name",
                    })?;
                HostMessage::ClientInfo {
                    user_name: utf8(kind, "user_name", raw.slice(..nul))?,
                    host_name: utf8(kind, "host_name", raw.slice(nul + 1..))?,
                }
            }
            MessageType::CreateTerminal => HostMessage::CreateTerminal {
                terminal_id: r.u32("terminal_id")?,
            },
            MessageType::DeleteTerminal => HostMessage::DeleteTerminal {
                terminal_id: r.u32("terminal_id")?,
            },
            MessageType::OnTerminalEnd => HostMessage::TerminalEnd {
                terminal_id: r.u32("terminal_id")?,
            },
            MessageType::OnTerminalCreated => HostMessage::TerminalCreated {
                terminal_id: r.u32("terminal_id")?,
                success: r.u8("success")? != 0,
            },
            MessageType::ResizeTerminal => HostMessage::ResizeTerminal {
                terminal_id: r.u32("terminal_id")?,
                width: r.u16("width")?,
                height: r.u16("height")?,
            },
            MessageType::OnTerminalWrite => HostMessage::TerminalWrite {
                terminal_id: r.u32("terminal_id")?,
                data: r.rest(),
            },
            MessageType::OnTerminalRead => HostMessage::TerminalRead {
                terminal_id: r.u32("terminal_id")?,
                data: r.rest(),
            },
            MessageType::FileTransferReq => HostMessage::TransferRequest {
                request_id: r.u32("request_id")?,
                direction: TransferDirection::from_flag(r.u8("direction")?),
                path: utf8(kind, "path", r.rest())?,
            },
            MessageType::FileTransferInit => HostMessage::TransferInit(TransferInit {
                request_id: r.u32("request_id")?,
                is_valid: r.u8("is_valid")? != 0,
                is_directory: r.u8("is_directory")? != 0,
                size: r.u64("size")?,
            }),
        };
        Ok(msg)
    }
}

struct FieldReader {
    kind: MessageType,
    buf: Bytes,
}

impl FieldReader {
    fn need(&self, len: usize, field: &'static str) -> Result<(), ProtocolError> {
        if self.buf.remaining() < len {
            return Err(ProtocolError::Truncated {
                message: self.kind,
                field,
            });
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, ProtocolError> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &'static str) -> Result<u16, ProtocolError> {
        self.need(2, field)?;
        Ok(self.buf.get_u16_le())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32, ProtocolError> {
        self.need(4, field)?;
        Ok(self.buf.get_u32_le())
    }

    fn u64(&mut self, field: &'static str) -> Result<u64, ProtocolError> {
        self.need(8, field)?;
        Ok(self.buf.get_u64_le())
    }

    fn rest(&mut self) -> Bytes {
        std::mem::take(&mut self.buf)
    }
}

fn utf8(message: MessageType, field: &'static str, raw: Bytes) -> Result<String, ProtocolError> {
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8 { message, field })
}
