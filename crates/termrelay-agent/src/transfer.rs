use anyhow::{Context, bail};
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use libtermrelay::{FileTransfer, TransferSource};
use termrelay_protocol::{HostCodec, HostMessage, Inbound, TransferDirection, TransferId};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

const CHUNK_SIZE: usize = 64 * 1024;

/// Answer a transfer request on a dedicated connection to the broker.
pub async fn serve(
    server: String,
    request_id: TransferId,
    direction: TransferDirection,
    path: String,
) {
    if let Err(e) = serve_inner(&server, request_id, direction, path).await {
        warn!(request_id, error = %e, "file transfer failed");
    }
}

async fn serve_inner(
    server: &str,
    request_id: TransferId,
    direction: TransferDirection,
    path: String,
) -> anyhow::Result<()> {
    let (mut transfer, init) =
        tokio::task::spawn_blocking(move || FileTransfer::respond(request_id, direction, &path))
            .await
            .context("transfer inspection task failed")?;

    let stream = TcpStream::connect(server)
        .await
        .with_context(|| format!("failed to connect transfer connection to {server}"))?;
    let mut conn = Framed::new(stream, HostCodec::new());
    conn.send(HostMessage::TransferInit(init)).await?;
    if !init.is_valid {
        debug!(request_id, path = transfer.path(), "transfer rejected");
        return Ok(());
    }

    loop {
        match conn.next().await {
            Some(Ok(Inbound::Message(HostMessage::TransferAck))) => break,
            Some(Ok(Inbound::Message(HostMessage::Ping))) => continue,
            Some(Ok(other)) => bail!("unexpected frame before ack: {other:?}"),
            Some(Err(e)) => return Err(e.into()),
            None => bail!("broker closed transfer {request_id} before ack"),
        }
    }

    match transfer.on_ack()? {
        TransferSource::Listing(listing) => conn.send(listing).await?,
        TransferSource::File { path, size } => {
            let file = tokio::fs::File::open(&path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            // never send more than announced
            let mut file = file.take(size);
            let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
            loop {
                buf.reserve(CHUNK_SIZE);
                if file.read_buf(&mut buf).await? == 0 {
                    break;
                }
                conn.send(buf.split().freeze()).await?;
            }
        }
    }
    transfer.finish_sending()?;
    info!(
        request_id,
        path = transfer.path(),
        bytes = transfer.expected_size(),
        "file transfer sent"
    );
    Ok(())
}
