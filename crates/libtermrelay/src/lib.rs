pub mod broker;
pub mod error;
pub mod front_end;
pub mod ids;
pub mod listing;
pub mod session;
pub mod transfer;
pub mod watermark;

pub use broker::{BrokerCommand, BrokerHandle, TerminalBroker, TerminalInfo};
pub use error::RelayError;
pub use front_end::{
    AppClient, DEFAULT_MAX_BROWSE_BYTES, DownloadBody, DownloadReply, DownloadSink, FrontEnd,
    FrontEndCommand, FrontEndHandle, InitDecision, RelayLimits,
};
pub use session::{
    ActiveSessions, ClientHandle, FileTransferSession, TransferPurpose, WebAppSession,
};
pub use transfer::{
    FailureReason, FileTransfer, InitOutcome, Progress, TransferRole, TransferSource,
    TransferState,
};
pub use watermark::{OutputWatermark, READ_BLOCK_HIGH, READ_BLOCK_LOW};

/// Start the broker and front end tasks on the current runtime and return
/// their handles.
pub fn spawn_relay(limits: RelayLimits) -> (BrokerHandle, FrontEndHandle) {
    let (broker, broker_inbox) = broker::channel();
    let (front_end, front_end_inbox) = front_end::channel();
    tokio::spawn(TerminalBroker::new(front_end.clone()).run(broker_inbox));
    tokio::spawn(FrontEnd::new(broker.clone(), limits).run(front_end_inbox));
    (broker, front_end)
}
