//! Broker and front end running as tasks, driven through their handles.

use std::time::Duration;

use bytes::Bytes;
use libtermrelay::{InitDecision, RelayLimits, spawn_relay};
use termrelay_protocol::{ClientMessage, HostMessage, ServerMessage, TransferInit};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
}

#[tokio::test]
async fn terminal_round_trip_and_host_loss() {
    let (broker, front_end) = spawn_relay(RelayLimits::default());

    let (host_tx, mut host_rx) = mpsc::unbounded_channel();
    broker.host_connected(7, "127.0.0.1".to_string(), host_tx);
    broker.host_message(
        7,
        HostMessage::ClientInfo {
            user_name: "alice".to_string(),
            host_name: "devbox".to_string(),
        },
    );

    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    front_end.client_connected(1, client_tx);
    assert!(matches!(next(&mut client_rx).await, ServerMessage::SessionInfo { client_id: 1, .. }));
    assert!(matches!(
        next(&mut client_rx).await,
        ServerMessage::RemoteHostConnected { id: 7, .. }
    ));

    front_end.client_message(1, ClientMessage::TerminalReq { remote_host_id: 7 });
    let terminal_id = match next(&mut host_rx).await {
        HostMessage::CreateTerminal { terminal_id } => terminal_id,
        other => panic!("wrong variant: {other:?}"),
    };
    broker.host_message(
        7,
        HostMessage::TerminalCreated {
            terminal_id,
            success: true,
        },
    );
    assert_eq!(
        next(&mut client_rx).await,
        ServerMessage::TerminalAdded {
            id: terminal_id,
            remote_host_id: 7
        }
    );

    front_end.client_message(
        1,
        ClientMessage::TerminalKey {
            terminal_id,
            key: "echo hi\n".to_string(),
        },
    );
    assert_eq!(
        next(&mut host_rx).await,
        HostMessage::TerminalWrite {
            terminal_id,
            data: Bytes::from_static(b"echo hi\n"),
        }
    );

    broker.host_message(
        7,
        HostMessage::TerminalRead {
            terminal_id,
            data: Bytes::from_static(b"hi\r\n"),
        },
    );
    assert_eq!(next(&mut host_rx).await, HostMessage::TerminalReadAck);
    assert_eq!(
        next(&mut client_rx).await,
        ServerMessage::TerminalOutput {
            id: terminal_id,
            output: b"hi\r\n".to_vec()
        }
    );

    broker.host_closed(7, true);
    assert_eq!(
        next(&mut client_rx).await,
        ServerMessage::TerminalClosed {
            id: terminal_id,
            remote_host_id: 7
        }
    );
    assert_eq!(
        next(&mut client_rx).await,
        ServerMessage::RemoteHostDisconnected { id: 7 }
    );
}

#[tokio::test]
async fn browse_transfer_through_handles() {
    let (broker, front_end) = spawn_relay(RelayLimits::default());
    let (host_tx, mut host_rx) = mpsc::unbounded_channel();
    broker.host_connected(3, "127.0.0.1".to_string(), host_tx);

    let (client_tx, mut client_rx) = mpsc::unbounded_channel();
    front_end.client_connected(1, client_tx);
    next(&mut client_rx).await;

    front_end.client_message(1, ClientMessage::TerminalReq { remote_host_id: 3 });
    let HostMessage::CreateTerminal { terminal_id } = next(&mut host_rx).await else {
        panic!("expected create");
    };
    broker.host_message(
        3,
        HostMessage::TerminalCreated {
            terminal_id,
            success: true,
        },
    );
    next(&mut client_rx).await;

    front_end.client_message(
        1,
        ClientMessage::FileTransferReq {
            terminal_id,
            path: "/motd".to_string(),
        },
    );
    let request_id = match next(&mut host_rx).await {
        HostMessage::TransferRequest { request_id, path, .. } => {
            assert_eq!(path, "/motd");
            request_id
        }
        other => panic!("wrong variant: {other:?}"),
    };

    let decision = front_end
        .transfer_init(
            TransferInit {
                request_id,
                is_valid: true,
                is_directory: false,
                size: 5,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(matches!(
        decision,
        InitDecision::Accept {
            completed: false,
            sink: None
        }
    ));

    front_end.transfer_data(request_id, Bytes::from_static(b"hello"));
    front_end.transfer_closed(request_id);
    assert_eq!(
        next(&mut client_rx).await,
        ServerMessage::FileContent {
            terminal_id,
            path: "/motd".to_string(),
            data: b"hello".to_vec(),
        }
    );
    // the close after completion must not produce a failure
    assert!(
        timeout(Duration::from_millis(100), client_rx.recv())
            .await
            .is_err()
    );
}
