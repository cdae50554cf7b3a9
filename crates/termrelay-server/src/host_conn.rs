//! One TCP connection on the remote host port.
//!
//! A connection is registered with the broker as a remote host as soon as it
//! is accepted. If its first frame is a file transfer init it is detached
//! again and served as a transfer connection instead.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use libtermrelay::{BrokerHandle, FrontEndHandle, InitDecision};
use termrelay_protocol::{
    HostCodec, HostMessage, Inbound, ProtocolError, RemoteHostId, TransferInit,
};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type Reader = FramedRead<OwnedReadHalf, HostCodec>;
type Writer = FramedWrite<OwnedWriteHalf, HostCodec>;

#[derive(Debug, Clone)]
pub struct HostConnConfig {
    pub ping_interval: Duration,
    pub peer_timeout: Duration,
    pub max_frame_bytes: usize,
}

enum Exit {
    Closed { unresponsive: bool },
    Transfer(TransferInit),
}

pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    remote_host_id: RemoteHostId,
    broker: BrokerHandle,
    front_end: FrontEndHandle,
    config: HostConnConfig,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(remote_host_id, "set_nodelay failed: {e}");
    }
    let (read_half, write_half) = stream.into_split();
    let codec = || HostCodec::with_max_frame_bytes(config.max_frame_bytes);
    let mut reader = FramedRead::new(read_half, codec());
    let mut writer = FramedWrite::new(write_half, codec());

    let (tx, mut outbound) = mpsc::unbounded_channel();
    broker.host_connected(remote_host_id, addr.ip().to_string(), tx);
    debug!(remote_host_id, addr = %addr, "connection accepted");

    let start = Instant::now() + config.ping_interval;
    let mut ping = tokio::time::interval_at(start, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_seen = Instant::now();
    let mut first_frame = true;

    let exit = loop {
        tokio::select! {
            frame = reader.next() => {
                last_seen = Instant::now();
                match frame {
                    Some(Ok(Inbound::Message(HostMessage::TransferInit(init)))) if first_frame => {
                        break Exit::Transfer(init);
                    }
                    Some(Ok(Inbound::Message(msg))) => broker.host_message(remote_host_id, msg),
                    Some(Ok(Inbound::Malformed(e))) => {
                        warn!(remote_host_id, error = %e, "malformed message discarded");
                    }
                    Some(Ok(Inbound::Raw(bytes))) => {
                        warn!(remote_host_id, len = bytes.len(), "unexpected raw bytes discarded");
                    }
                    Some(Err(e)) => {
                        warn!(remote_host_id, error = %e, "remote host connection error");
                        break Exit::Closed { unresponsive: false };
                    }
                    None => break Exit::Closed { unresponsive: false },
                }
                first_frame = false;
            }
            msg = outbound.recv() => {
                let Some(msg) = msg else {
                    break Exit::Closed { unresponsive: false };
                };
                match writer.send(msg).await {
                    Ok(()) => {}
                    // nothing was written, the stream is still in sync
                    Err(e @ ProtocolError::FrameTooLarge { .. }) => {
                        warn!(remote_host_id, error = %e, "oversized message not sent");
                    }
                    Err(e) => {
                        warn!(remote_host_id, error = %e, "write to remote host failed");
                        break Exit::Closed { unresponsive: false };
                    }
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() >= config.peer_timeout {
                    break Exit::Closed { unresponsive: true };
                }
                if let Err(e) = writer.send(HostMessage::Ping).await {
                    warn!(remote_host_id, error = %e, "ping to remote host failed");
                    break Exit::Closed { unresponsive: false };
                }
            }
        }
    };

    match exit {
        Exit::Closed { unresponsive } => broker.host_closed(remote_host_id, unresponsive),
        Exit::Transfer(init) => {
            broker.host_detached(remote_host_id);
            drop(outbound);
            serve_transfer(reader, writer, init, front_end).await;
        }
    }
}

async fn serve_transfer(
    mut reader: Reader,
    mut writer: Writer,
    init: TransferInit,
    front_end: FrontEndHandle,
) {
    let request_id = init.request_id;
    let cancel = CancellationToken::new();
    let decision = match front_end.transfer_init(init, cancel.clone()).await {
        Ok(decision) => decision,
        Err(_) => {
            warn!(request_id, "front end gone, dropping transfer connection");
            return;
        }
    };

    let mut sink = match decision {
        InitDecision::Reject => {
            debug!(request_id, "transfer connection rejected");
            return;
        }
        InitDecision::Accept { completed, sink } => {
            reader.decoder_mut().switch_to_raw();
            if let Err(e) = writer.send(HostMessage::TransferAck).await {
                warn!(request_id, error = %e, "failed to acknowledge transfer");
                front_end.transfer_closed(request_id);
                return;
            }
            if completed {
                return;
            }
            sink
        }
    };

    info!(request_id, size = init.size, "receiving file transfer");
    let mut remaining = init.size;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(request_id, "transfer cancelled");
                break;
            }
            chunk = reader.next() => match chunk {
                Some(Ok(Inbound::Raw(data))) => {
                    let take = remaining.min(data.len() as u64) as usize;
                    remaining -= take as u64;
                    if let Some(body) = &sink {
                        // blocks while the HTTP client is behind
                        let sent = tokio::select! {
                            _ = cancel.cancelled() => false,
                            res = body.send(Ok(data.slice(..take))) => res.is_ok(),
                        };
                        if !sent {
                            debug!(request_id, "download body dropped");
                            break;
                        }
                    }
                    if remaining == 0 {
                        // ends the HTTP body without waiting for the host to hang up
                        sink = None;
                    }
                    front_end.transfer_data(request_id, data);
                }
                Some(Ok(other)) => {
                    warn!(request_id, ?other, "unexpected frame on transfer connection");
                }
                Some(Err(e)) => {
                    warn!(request_id, error = %e, "transfer connection error");
                    break;
                }
                None => break,
            }
        }
    }
    front_end.transfer_closed(request_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use libtermrelay::{BrokerCommand, FrontEndCommand, broker, front_end};
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(max_frame_bytes: usize) -> HostConnConfig {
        HostConnConfig {
            ping_interval: Duration::from_secs(60),
            peer_timeout: Duration::from_secs(120),
            max_frame_bytes,
        }
    }

    /// Returns the host side of a connection served by `handle_connection`.
    async fn serve(
        max_frame_bytes: usize,
    ) -> (TcpStream, broker::BrokerInbox, front_end::FrontEndInbox) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, addr) = listener.accept().await.unwrap();
        let (broker, broker_inbox) = broker::channel();
        let (front_end, front_end_inbox) = front_end::channel();
        tokio::spawn(handle_connection(
            stream,
            addr,
            7,
            broker,
            front_end,
            config(max_frame_bytes),
        ));
        (host, broker_inbox, front_end_inbox)
    }

    #[tokio::test]
    async fn oversized_message_keeps_host_connected() {
        let (host, mut broker_inbox, _front_end_inbox) = serve(64).await;
        let tx = match timeout(WAIT, broker_inbox.recv()).await.unwrap() {
            Some(BrokerCommand::HostConnected { tx, .. }) => tx,
            other => panic!("wrong command: {other:?}"),
        };

        tx.send(HostMessage::TerminalWrite {
            terminal_id: 3,
            data: Bytes::from(vec![b'x'; 128]),
        })
        .unwrap();
        tx.send(HostMessage::TerminalWrite {
            terminal_id: 3,
            data: Bytes::from_static(b"ls\n"),
        })
        .unwrap();

        let mut host = FramedRead::new(host, HostCodec::new());
        match timeout(WAIT, host.next()).await.unwrap() {
            Some(Ok(Inbound::Message(HostMessage::TerminalWrite { terminal_id, data }))) => {
                assert_eq!(terminal_id, 3);
                assert_eq!(&data[..], b"ls\n");
            }
            other => panic!("wrong frame: {other:?}"),
        }
        assert!(broker_inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn download_payload_goes_through_sink() {
        let (host, mut broker_inbox, mut front_end_inbox) = serve(1024).await;
        let (read_half, write_half) = host.into_split();
        let mut host_rx = FramedRead::new(read_half, HostCodec::new());
        let mut host_tx = FramedWrite::new(write_half, HostCodec::new());
        host_tx
            .send(HostMessage::TransferInit(TransferInit {
                request_id: 42,
                is_valid: true,
                is_directory: false,
                size: 4,
            }))
            .await
            .unwrap();

        let (sink, mut body) = mpsc::channel(1);
        match timeout(WAIT, front_end_inbox.recv()).await.unwrap() {
            Some(FrontEndCommand::TransferInit { init, reply, .. }) => {
                assert_eq!(init.request_id, 42);
                reply
                    .send(InitDecision::Accept {
                        completed: false,
                        sink: Some(sink),
                    })
                    .unwrap();
            }
            other => panic!("wrong command: {other:?}"),
        }
        assert!(matches!(
            timeout(WAIT, host_rx.next()).await.unwrap(),
            Some(Ok(Inbound::Message(HostMessage::TransferAck)))
        ));

        let mut raw = host_tx.into_inner();
        raw.write_all(b"abcd").await.unwrap();
        assert_eq!(&timeout(WAIT, body.recv()).await.unwrap().unwrap().unwrap()[..], b"abcd");
        assert!(matches!(
            timeout(WAIT, front_end_inbox.recv()).await.unwrap(),
            Some(FrontEndCommand::TransferData { request_id: 42, .. })
        ));

        // bytes past the announced size are reported but never streamed
        raw.write_all(b"zz").await.unwrap();
        assert!(matches!(
            timeout(WAIT, front_end_inbox.recv()).await.unwrap(),
            Some(FrontEndCommand::TransferData { request_id: 42, .. })
        ));
        assert!(timeout(WAIT, body.recv()).await.unwrap().is_none());

        drop(raw);
        assert!(matches!(
            timeout(WAIT, front_end_inbox.recv()).await.unwrap(),
            Some(FrontEndCommand::TransferClosed { request_id: 42 })
        ));
        assert!(matches!(
            broker_inbox.try_recv(),
            Ok(BrokerCommand::HostConnected { .. })
        ));
    }
}
