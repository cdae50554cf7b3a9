//! Drives a real termrelay-server with a fake remote host speaking the
//! binary protocol, a WebSocket app client and an HTTP download.

use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use termrelay_protocol::{HostCodec, HostMessage, Inbound, TransferDirection, TransferInit};
use tokio::time::{Instant, sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::codec::Framed;

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type HostConn = Framed<tokio::net::TcpStream, HostCodec>;

struct ServerProcess {
    child: Child,
    web: String,
    hosts: String,
}

impl ServerProcess {
    async fn start(dir: &Path) -> Result<Self> {
        Self::start_with_timeout(dir, 30).await
    }

    async fn start_with_timeout(dir: &Path, peer_timeout_secs: u64) -> Result<Self> {
        let web = reserve_local_addr()?;
        let hosts = reserve_local_addr()?;
        let static_dir = dir.join("webapp");
        std::fs::create_dir_all(&static_dir)?;
        std::fs::write(static_dir.join("index.html"), "<html>termrelay</html>")?;

        let config_path = dir.join("config.toml");
        std::fs::write(
            &config_path,
            format!(
                "web_listen = \"{web}\"\nhost_listen = \"{hosts}\"\nstatic_dir = \"{}\"\n\
                 ping_interval_secs = 1\npeer_timeout_secs = {peer_timeout_secs}\n",
                static_dir.display()
            ),
        )?;

        let child = Command::new(assert_cmd::cargo::cargo_bin!("termrelay-server"))
            .env("TERMRELAY_CONFIG", &config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn termrelay-server")?;

        let mut server = Self { child, web, hosts };
        server.wait_ready().await?;
        Ok(server)
    }

    async fn wait_ready(&mut self) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.child.try_wait()?.is_some() {
                bail!("termrelay-server exited before becoming ready");
            }
            if TcpStream::connect(&self.web).is_ok() && TcpStream::connect(&self.hosts).is_ok() {
                return Ok(());
            }
            if start.elapsed() > Duration::from_secs(10) {
                bail!("timed out waiting for termrelay-server listeners");
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn connect_client(&self) -> Result<(Ws, Value)> {
        let (mut ws, _) = connect_async(format!("ws://{}/ws", self.web)).await?;
        let info = next_json(&mut ws).await?;
        if info["type"] != "session_info" {
            bail!("expected session_info, got {info}");
        }
        Ok((ws, info))
    }

    async fn connect_host(&self, user: &str, host: &str) -> Result<HostConn> {
        let stream = tokio::net::TcpStream::connect(&self.hosts).await?;
        let mut conn = Framed::new(stream, HostCodec::new());
        conn.send(HostMessage::ClientInfo {
            user_name: user.to_string(),
            host_name: host.to_string(),
        })
        .await?;
        Ok(conn)
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        if self.child.try_wait().ok().flatten().is_none() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

fn reserve_local_addr() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").context("failed to reserve a port")?;
    let addr = listener.local_addr().context("failed to read reserved port")?;
    drop(listener);
    Ok(addr.to_string())
}

async fn next_json(ws: &mut Ws) -> Result<Value> {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .context("timed out waiting for websocket message")?
            .context("websocket closed")??;
        if let Message::Text(text) = msg {
            return Ok(serde_json::from_str(&text)?);
        }
    }
}

/// Next message of the given type, skipping others.
async fn expect_json(ws: &mut Ws, kind: &str) -> Result<Value> {
    loop {
        let value = next_json(ws).await?;
        if value["type"] == kind {
            return Ok(value);
        }
    }
}

async fn send_json(ws: &mut Ws, value: Value) -> Result<()> {
    ws.send(Message::Text(value.to_string().into())).await?;
    Ok(())
}

/// Next protocol message from the broker that is not a keepalive.
async fn next_host_message(conn: &mut HostConn) -> Result<HostMessage> {
    loop {
        let frame = timeout(Duration::from_secs(5), conn.next())
            .await
            .context("timed out waiting for broker message")?
            .context("broker closed connection")??;
        match frame {
            Inbound::Message(HostMessage::Ping) => conn.send(HostMessage::Pong).await?,
            Inbound::Message(msg) => return Ok(msg),
            other => bail!("unexpected frame {other:?}"),
        }
    }
}

/// Client gets a terminal on a freshly connected host.
async fn open_terminal(server: &ServerProcess, ws: &mut Ws) -> Result<(HostConn, u64, u64)> {
    let mut host = server.connect_host("alice", "devbox").await?;
    let announced = expect_json(ws, "remote_host_connected").await?;
    assert_eq!(announced["client_user_name"], "alice");
    assert_eq!(announced["client_name"], "devbox");
    assert_eq!(announced["client_ip"], "127.0.0.1");
    let host_id = announced["id"].as_u64().context("host id")?;

    send_json(ws, json!({"type": "terminal_req", "remote_host_id": host_id})).await?;
    let terminal_id = match next_host_message(&mut host).await? {
        HostMessage::CreateTerminal { terminal_id } => terminal_id,
        other => bail!("expected create terminal, got {other:?}"),
    };
    host.send(HostMessage::TerminalCreated {
        terminal_id,
        success: true,
    })
    .await?;
    let added = expect_json(ws, "terminal_added").await?;
    assert_eq!(added["id"], terminal_id);
    assert_eq!(added["remote_host_id"], host_id);
    Ok((host, host_id, u64::from(terminal_id)))
}

#[tokio::test]
async fn terminal_keys_output_and_host_loss() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = ServerProcess::start(dir.path()).await?;
    let (mut ws, _) = server.connect_client().await?;
    let (mut host, host_id, terminal_id) = open_terminal(&server, &mut ws).await?;
    assert_eq!(terminal_id, 1);

    send_json(
        &mut ws,
        json!({"type": "terminal_key", "terminal_id": terminal_id, "key": "ls\n"}),
    )
    .await?;
    assert_eq!(
        next_host_message(&mut host).await?,
        HostMessage::TerminalWrite {
            terminal_id: 1,
            data: Bytes::from_static(b"ls\n"),
        }
    );

    host.send(HostMessage::TerminalRead {
        terminal_id: 1,
        data: Bytes::from_static(b"file.txt\r\n"),
    })
    .await?;
    assert_eq!(next_host_message(&mut host).await?, HostMessage::TerminalReadAck);
    let output = expect_json(&mut ws, "terminal_output").await?;
    assert_eq!(output["id"], 1);
    assert_eq!(output["output"], "ZmlsZS50eHQNCg==");

    send_json(
        &mut ws,
        json!({"type": "terminal_resize", "terminal_id": 1, "width": 120, "height": 40}),
    )
    .await?;
    assert_eq!(
        next_host_message(&mut host).await?,
        HostMessage::ResizeTerminal {
            terminal_id: 1,
            width: 120,
            height: 40,
        }
    );

    drop(host);
    let closed = expect_json(&mut ws, "terminal_closed").await?;
    assert_eq!(closed["id"], 1);
    assert_eq!(closed["remote_host_id"], host_id);
    let gone = expect_json(&mut ws, "remote_host_disconnected").await?;
    assert_eq!(gone["id"], host_id);
    Ok(())
}

#[tokio::test]
async fn foreign_client_cannot_touch_terminal() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = ServerProcess::start(dir.path()).await?;
    let (mut owner, _) = server.connect_client().await?;
    let (mut intruder, _) = server.connect_client().await?;
    let (mut host, _, terminal_id) = open_terminal(&server, &mut owner).await?;

    send_json(
        &mut intruder,
        json!({"type": "terminal_key", "terminal_id": terminal_id, "key": "reboot\n"}),
    )
    .await?;
    send_json(&mut intruder, json!({"type": "terminal_del", "terminal_id": terminal_id})).await?;
    send_json(
        &mut owner,
        json!({"type": "terminal_key", "terminal_id": terminal_id, "key": "id\n"}),
    )
    .await?;

    // the owner's keys are the first thing the host sees
    match next_host_message(&mut host).await? {
        HostMessage::TerminalWrite { data, .. } => assert_eq!(&data[..], b"id\n"),
        other => bail!("expected owner's write, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn client_disconnect_deletes_terminals() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = ServerProcess::start(dir.path()).await?;
    let (mut ws, _) = server.connect_client().await?;
    let (mut host, _, terminal_id) = open_terminal(&server, &mut ws).await?;

    ws.close(None).await?;
    match next_host_message(&mut host).await? {
        HostMessage::DeleteTerminal { terminal_id: id } => assert_eq!(u64::from(id), terminal_id),
        other => bail!("expected delete terminal, got {other:?}"),
    }
    Ok(())
}

/// Plays the remote host side of a transfer: dial back, init, wait for ack,
/// stream the payload raw.
async fn serve_transfer(
    server: &ServerProcess,
    request_id: u32,
    payload: &'static [u8],
    is_directory: bool,
) -> Result<()> {
    let stream = tokio::net::TcpStream::connect(&server.hosts).await?;
    let mut conn = Framed::new(stream, HostCodec::new());
    conn.send(HostMessage::TransferInit(TransferInit {
        request_id,
        is_valid: true,
        is_directory,
        size: payload.len() as u64,
    }))
    .await?;
    match next_host_message(&mut conn).await? {
        HostMessage::TransferAck => {}
        other => bail!("expected ack, got {other:?}"),
    }
    conn.send(Bytes::from_static(payload)).await?;
    Ok(())
}

async fn expect_transfer_request(host: &mut HostConn, expected_path: &str) -> Result<u32> {
    match next_host_message(host).await? {
        HostMessage::TransferRequest {
            request_id,
            direction,
            path,
        } => {
            assert_eq!(direction, TransferDirection::Fetch);
            assert_eq!(path, expected_path);
            Ok(request_id)
        }
        other => bail!("expected transfer request, got {other:?}"),
    }
}

#[tokio::test]
async fn http_download_streams_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = ServerProcess::start(dir.path()).await?;
    let (mut ws, info) = server.connect_client().await?;
    let token = info["download_token"].as_str().context("token")?.to_string();
    let (mut host, _, terminal_id) = open_terminal(&server, &mut ws).await?;

    let url = format!("http://{}/download", server.web);
    let query = [
        ("terminal_id", terminal_id.to_string()),
        ("path", "/etc/hostname".to_string()),
        ("token", token),
    ];
    let request = tokio::spawn(reqwest::Client::new().get(&url).query(&query).send());

    let request_id = expect_transfer_request(&mut host, "/etc/hostname").await?;
    serve_transfer(&server, request_id, b"devbox-01\n", false).await?;

    let response = timeout(Duration::from_secs(5), request).await???;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.content_length(), Some(10));
    assert_eq!(&response.bytes().await?[..], b"devbox-01\n");
    Ok(())
}

#[tokio::test]
async fn http_download_with_forged_token_is_404() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = ServerProcess::start(dir.path()).await?;
    let (mut ws, _) = server.connect_client().await?;
    let (_host, _, terminal_id) = open_terminal(&server, &mut ws).await?;

    let response = reqwest::Client::new()
        .get(format!("http://{}/download", server.web))
        .query(&[
            ("terminal_id", terminal_id.to_string()),
            ("path", "/etc/shadow".to_string()),
            ("token", "not-a-token".to_string()),
        ])
        .send()
        .await?;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn websocket_directory_listing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = ServerProcess::start(dir.path()).await?;
    let (mut ws, _) = server.connect_client().await?;
    let (mut host, _, terminal_id) = open_terminal(&server, &mut ws).await?;

    send_json(
        &mut ws,
        json!({"type": "file_transfer_req", "terminal_id": terminal_id, "path": "/home"}),
    )
    .await?;
    let request_id = expect_transfer_request(&mut host, "/home").await?;
    serve_transfer(
        &server,
        request_id,
        br#"[{"name":"alice","is_dir":true,"size":4096}]"#,
        true,
    )
    .await?;

    let listing = expect_json(&mut ws, "directory_listing").await?;
    assert_eq!(listing["terminal_id"], terminal_id);
    assert_eq!(listing["path"], "/home");
    assert_eq!(listing["files"][0]["name"], "alice");
    assert_eq!(listing["files"][0]["is_dir"], true);
    Ok(())
}

#[tokio::test]
async fn static_assets_are_served() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = ServerProcess::start(dir.path()).await?;

    let index = reqwest::get(format!("http://{}/index.html", server.web)).await?;
    assert_eq!(index.status(), reqwest::StatusCode::OK);
    assert!(index.text().await?.contains("termrelay"));

    let missing = reqwest::get(format!("http://{}/nope.js", server.web)).await?;
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn silent_host_is_dropped_as_unresponsive() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let server = ServerProcess::start_with_timeout(dir.path(), 2).await?;
    let (mut ws, _) = server.connect_client().await?;

    // never reads, so pings go unanswered
    let _host = server.connect_host("bob", "sleepy").await?;
    let announced = expect_json(&mut ws, "remote_host_connected").await?;
    let gone = timeout(
        Duration::from_secs(10),
        expect_json(&mut ws, "remote_host_disconnected"),
    )
    .await??;
    assert_eq!(gone["id"], announced["id"]);
    Ok(())
}
