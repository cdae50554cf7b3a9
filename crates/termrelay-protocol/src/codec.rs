use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::wire::{HostMessage, MessageType};

/// Largest frame body accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// tag (1) + little-endian body length (4)
const HEADER_LEN: usize = 5;

/// How the bytes of a connection are currently interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecMode {
    /// Length-framed protocol messages.
    Protocol,
    /// Unframed transfer payload.
    Raw,
}

/// Item produced by [`HostCodec`].
#[derive(Debug)]
pub enum Inbound {
    Message(HostMessage),
    /// A complete frame whose body could not be decoded. The frame is consumed,
    /// so the connection can keep going.
    Malformed(ProtocolError),
    Raw(Bytes),
}

/// Codec for remote host connections.
///
/// A connection starts in [`CodecMode::Protocol`]. File transfer connections
/// switch to [`CodecMode::Raw`] once the acknowledgment has been exchanged;
/// anything already buffered is then handed out as payload.
#[derive(Debug)]
pub struct HostCodec {
    mode: CodecMode,
    max_frame_bytes: usize,
}

impl HostCodec {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            mode: CodecMode::Protocol,
            max_frame_bytes,
        }
    }

    pub fn mode(&self) -> CodecMode {
        self.mode
    }

    pub fn switch_to_raw(&mut self) {
        self.mode = CodecMode::Raw;
    }
}

impl Default for HostCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for HostCodec {
    type Item = Inbound;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, ProtocolError> {
        if self.mode == CodecMode::Raw {
            if src.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Inbound::Raw(src.split().freeze())));
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_le_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        let tag = src[0];
        src.advance(HEADER_LEN);
        let body = src.split_to(len).freeze();
        let item = match MessageType::try_from(tag).and_then(|kind| HostMessage::decode(kind, body))
        {
            Ok(msg) => Inbound::Message(msg),
            Err(err) => Inbound::Malformed(err),
        };
        Ok(Some(item))
    }
}

impl Encoder<HostMessage> for HostCodec {
    type Error = ProtocolError;

    fn encode(&mut self, msg: HostMessage, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        let start = dst.len();
        dst.put_u8(msg.message_type() as u8);
        dst.put_u32_le(0);
        msg.encode_payload(dst);

        let len = dst.len() - start - HEADER_LEN;
        if len > self.max_frame_bytes {
            dst.truncate(start);
            return Err(ProtocolError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        dst[start + 1..start + HEADER_LEN].copy_from_slice(&(len as u32).to_le_bytes());
        Ok(())
    }
}

/// Raw transfer payload, written without any framing.
impl Encoder<Bytes> for HostCodec {
    type Error = ProtocolError;

    fn encode(&mut self, chunk: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&chunk);
        Ok(())
    }
}
