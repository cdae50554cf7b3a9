//! File transfer negotiation.
//!
//! [`FileTransfer`] is a pure state machine: it never touches a socket. The
//! requester builds the request frame, reacts to the responder's init and
//! counts raw payload; the responder inspects the local path, answers with an
//! init and, once acknowledged, hands out the source to stream.

use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use termrelay_protocol::{HostMessage, TransferDirection, TransferId, TransferInit};
use tracing::{debug, warn};

use crate::error::RelayError;
use crate::listing::serialize_directory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferRole {
    Requester,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The responder answered with an invalid init.
    Rejected,
    /// The transfer connection closed before all bytes arrived.
    PeerClosed,
    /// More payload arrived than the init announced.
    Overrun,
    /// The remote host went away.
    HostLost,
    /// The party waiting for the result went away.
    Abandoned,
    /// The request or the announced payload exceeds a relay limit.
    TooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Created,
    Negotiating,
    Streaming,
    Completed,
    Failed(FailureReason),
}

impl TransferState {
    fn name(self) -> &'static str {
        match self {
            TransferState::Created => "created",
            TransferState::Negotiating => "negotiating",
            TransferState::Streaming => "streaming",
            TransferState::Completed => "completed",
            TransferState::Failed(_) => "failed",
        }
    }
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Requester's reaction to an init.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Acknowledge and switch to raw mode. `completed` is set for empty payloads.
    Ack { completed: bool },
    Rejected,
}

/// Delivery of one raw chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// 1 for the first chunk of the transfer.
    pub chunk_index: u32,
    pub chunk_len: usize,
    pub received: u64,
    pub expected: u64,
    pub completed: bool,
}

/// What a responder streams after the ack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferSource {
    Listing(Bytes),
    File { path: PathBuf, size: u64 },
}

#[derive(Debug)]
pub struct FileTransfer {
    id: TransferId,
    path: String,
    direction: TransferDirection,
    role: TransferRole,
    state: TransferState,
    is_directory: bool,
    expected: u64,
    received: u64,
    chunks: u32,
    source: Option<TransferSource>,
}

impl FileTransfer {
    pub fn requester(
        id: TransferId,
        path: impl Into<String>,
        direction: TransferDirection,
    ) -> Self {
        Self {
            id,
            path: path.into(),
            direction,
            role: TransferRole::Requester,
            state: TransferState::Created,
            is_directory: false,
            expected: 0,
            received: 0,
            chunks: 0,
            source: None,
        }
    }

    /// Answer a transfer request for a path on this machine.
    ///
    /// Returns the responder and the init to send. Missing paths and push
    /// requests produce an invalid init and a failed responder.
    pub fn respond(
        request_id: TransferId,
        direction: TransferDirection,
        path: &str,
    ) -> (Self, TransferInit) {
        let mut transfer = Self {
            id: request_id,
            path: path.to_string(),
            direction,
            role: TransferRole::Responder,
            state: TransferState::Negotiating,
            is_directory: false,
            expected: 0,
            received: 0,
            chunks: 0,
            source: None,
        };

        if direction == TransferDirection::Push {
            warn!(request_id, path, "push transfers are not supported");
            transfer.state = TransferState::Failed(FailureReason::Rejected);
            return (transfer, TransferInit::rejected(request_id));
        }

        match inspect_source(Path::new(path)) {
            Ok(source) => {
                let (is_directory, size) = match &source {
                    TransferSource::Listing(bytes) => (true, bytes.len() as u64),
                    TransferSource::File { size, .. } => (false, *size),
                };
                transfer.is_directory = is_directory;
                transfer.expected = size;
                transfer.source = Some(source);
                let init = TransferInit {
                    request_id,
                    is_valid: true,
                    is_directory,
                    size,
                };
                (transfer, init)
            }
            Err(e) => {
                debug!(request_id, path, error = %e, "transfer source unavailable");
                transfer.state = TransferState::Failed(FailureReason::Rejected);
                (transfer, TransferInit::rejected(request_id))
            }
        }
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn direction(&self) -> TransferDirection {
        self.direction
    }

    pub fn role(&self) -> TransferRole {
        self.role
    }

    pub fn state(&self) -> TransferState {
        self.state
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory
    }

    pub fn expected_size(&self) -> u64 {
        self.expected
    }

    pub fn received_size(&self) -> u64 {
        self.received
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            TransferState::Completed | TransferState::Failed(_)
        )
    }

    /// Build the request frame and start negotiating.
    pub fn request_message(&mut self) -> Result<HostMessage, RelayError> {
        self.expect(TransferRole::Requester, TransferState::Created, "request")?;
        self.state = TransferState::Negotiating;
        Ok(HostMessage::TransferRequest {
            request_id: self.id,
            direction: self.direction,
            path: self.path.clone(),
        })
    }

    pub fn on_init(&mut self, init: &TransferInit) -> Result<InitOutcome, RelayError> {
        self.expect(TransferRole::Requester, TransferState::Negotiating, "init")?;
        if init.request_id != self.id {
            return Err(RelayError::TransferIdMismatch {
                id: self.id,
                got: init.request_id,
            });
        }
        if !init.is_valid {
            self.state = TransferState::Failed(FailureReason::Rejected);
            return Ok(InitOutcome::Rejected);
        }

        self.is_directory = init.is_directory;
        self.expected = init.size;
        if self.expected == 0 {
            self.state = TransferState::Completed;
            return Ok(InitOutcome::Ack { completed: true });
        }
        self.state = TransferState::Streaming;
        Ok(InitOutcome::Ack { completed: false })
    }

    pub fn on_chunk(&mut self, len: usize) -> Result<Progress, RelayError> {
        self.expect(TransferRole::Requester, TransferState::Streaming, "data")?;
        let received = self.received + len as u64;
        if received > self.expected {
            self.state = TransferState::Failed(FailureReason::Overrun);
            return Err(RelayError::TransferOverrun {
                id: self.id,
                received,
                expected: self.expected,
            });
        }

        self.received = received;
        self.chunks += 1;
        let completed = self.received == self.expected;
        if completed {
            self.state = TransferState::Completed;
        }
        Ok(Progress {
            chunk_index: self.chunks,
            chunk_len: len,
            received: self.received,
            expected: self.expected,
            completed,
        })
    }

    /// Responder side: the requester acknowledged, hand out what to stream.
    pub fn on_ack(&mut self) -> Result<TransferSource, RelayError> {
        self.expect(TransferRole::Responder, TransferState::Negotiating, "ack")?;
        let source = self.source.take().ok_or(RelayError::TransferState {
            id: self.id,
            state: self.state.name(),
            event: "ack",
        })?;
        self.state = TransferState::Streaming;
        Ok(source)
    }

    /// Responder side: every byte of the source has been written.
    pub fn finish_sending(&mut self) -> Result<(), RelayError> {
        self.expect(TransferRole::Responder, TransferState::Streaming, "finish")?;
        self.state = TransferState::Completed;
        Ok(())
    }

    /// Mark the transfer failed. Finished transfers are left alone.
    pub fn fail(&mut self, reason: FailureReason) {
        if !self.is_finished() {
            self.state = TransferState::Failed(reason);
        }
    }

    fn expect(
        &self,
        role: TransferRole,
        state: TransferState,
        event: &'static str,
    ) -> Result<(), RelayError> {
        if self.role == role && self.state == state {
            Ok(())
        } else {
            Err(RelayError::TransferState {
                id: self.id,
                state: self.state.name(),
                event,
            })
        }
    }
}

fn inspect_source(path: &Path) -> std::io::Result<TransferSource> {
    let metadata = std::fs::metadata(path)?;
    if metadata.is_dir() {
        Ok(TransferSource::Listing(serialize_directory(path)?))
    } else {
        Ok(TransferSource::File {
            path: path.to_path_buf(),
            size: metadata.len(),
        })
    }
}
