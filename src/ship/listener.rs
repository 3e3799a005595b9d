use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use n0_error::{Result, StdResultExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span};

use crate::{
    HEADER_SECTION_MAX_LENGTH,
    parse::{Authority, ForwardRequest, HttpResponse, ProxyRequest},
    ship::{
        ShipCore,
        queue::{Job, JobEvent, JobKind},
    },
    util::Prebuffered,
};

/// Worker→listener event channel depth; bounds how far a streamed response
/// can run ahead of the client socket.
const EVENT_CHANNEL_CAPACITY: usize = 16;
/// Listener→worker tunnel byte channel depth.
const UPLINK_CHANNEL_CAPACITY: usize = 8;
/// Read size for tunnel uplink chunks.
const UPLINK_READ_CHUNK: usize = 16 * 1024;

/// Accepts local proxy clients and serves each on its own task.
pub(super) async fn accept_loop(core: Arc<ShipCore>, listener: TcpListener) -> Result<()> {
    let cancel = CancellationToken::new();
    let _cancel_guard = cancel.clone().drop_guard();
    let mut id = 0u64;
    loop {
        let (stream, addr) = listener.accept().await.std_context("proxy listener failed")?;
        let core = core.clone();
        tokio::spawn(
            cancel
                .child_token()
                .run_until_cancelled_owned(async move {
                    debug!(%addr, "accepted proxy client");
                    if let Err(err) = serve_client(core, stream).await {
                        debug!("client connection closed: {err:#}");
                    }
                })
                .instrument(error_span!("client", id)),
        );
        id += 1;
    }
}

/// Serves exactly one proxy request on a client connection.
async fn serve_client(core: Arc<ShipCore>, stream: TcpStream) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = Prebuffered::new(read_half, HEADER_SECTION_MAX_LENGTH);
    let request = match ProxyRequest::read(&mut reader).await {
        Ok(request) => request,
        Err(err) => {
            HttpResponse::with_body(StatusCode::BAD_REQUEST, "malformed proxy request")
                .write(&mut write_half)
                .await
                .ok();
            return Err(err);
        }
    };
    debug!(?request, "parsed proxy request");
    match request {
        ProxyRequest::Http(request) => serve_http(core, reader, write_half, request).await,
        ProxyRequest::Connect { target } => serve_connect(core, reader, write_half, target).await,
    }
}

/// Queues an HTTP job and streams the worker's response chunks to the client.
async fn serve_http(
    core: Arc<ShipCore>,
    mut reader: Prebuffered<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    request: ForwardRequest,
) -> Result<()> {
    let (events_tx, mut events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let job = Job {
        id: core.next_job_id(),
        kind: JobKind::Http {
            head: request.head_bytes(),
            body: request.body,
        },
        cancel: cancel.clone(),
        events: events_tx,
        uplink: None,
    };
    let id = job.id;
    if core.enqueue(job).is_err() {
        HttpResponse::with_body(StatusCode::BAD_GATEWAY, "proxy is shutting down")
            .write(&mut writer)
            .await
            .ok();
        return Ok(());
    }
    debug!(job = id, "queued http request");

    let mut probe = [0u8; 512];
    let mut sent = 0usize;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(JobEvent::Chunk(bytes)) => {
                    if writer.write_all(&bytes).await.is_err() {
                        debug!(job = id, "client gone mid response");
                        cancel.cancel();
                        return Ok(());
                    }
                    sent += bytes.len();
                }
                Some(JobEvent::Failed(reason)) => {
                    // A partially delivered response cannot be patched up;
                    // closing mid-body is the only honest signal left.
                    if sent == 0 {
                        HttpResponse::with_body(StatusCode::BAD_GATEWAY, reason.into_bytes())
                            .write(&mut writer)
                            .await
                            .ok();
                    }
                    return Ok(());
                }
                Some(JobEvent::Done) | None => {
                    writer.flush().await.ok();
                    return Ok(());
                }
                Some(event) => {
                    debug!(job = id, ?event, "unexpected event for http job");
                    return Ok(());
                }
            },
            read = reader.read(&mut probe) => match read {
                // One request per connection: extra bytes are dropped.
                Ok(n) if n > 0 => continue,
                _ => {
                    debug!(job = id, "client disconnected");
                    cancel.cancel();
                    return Ok(());
                }
            },
        }
    }
}

/// Queues a CONNECT job, completes the handshake with the client, and runs
/// the client side of the tunnel.
async fn serve_connect(
    core: Arc<ShipCore>,
    mut reader: Prebuffered<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
    target: Authority,
) -> Result<()> {
    let (events_tx, mut events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (uplink_tx, uplink_rx) = mpsc::channel(UPLINK_CHANNEL_CAPACITY);
    let cancel = CancellationToken::new();
    let job = Job {
        id: core.next_job_id(),
        kind: JobKind::Connect {
            target: target.clone(),
        },
        cancel: cancel.clone(),
        events: events_tx,
        uplink: Some(uplink_rx),
    };
    let id = job.id;
    if core.enqueue(job).is_err() {
        HttpResponse::with_body(StatusCode::BAD_GATEWAY, "proxy is shutting down")
            .write(&mut writer)
            .await
            .ok();
        return Ok(());
    }
    debug!(job = id, %target, "queued connect request");

    // Handshake phase. Bytes an eager client sends before the 200 are held
    // back until the tunnel is live.
    let mut pending: Vec<Bytes> = Vec::new();
    let mut buf = vec![0u8; UPLINK_READ_CHUNK];
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(JobEvent::Established) => break,
                Some(JobEvent::Rejected(reason)) | Some(JobEvent::Failed(reason)) => {
                    HttpResponse::with_body(StatusCode::BAD_GATEWAY, reason.into_bytes())
                        .write(&mut writer)
                        .await
                        .ok();
                    return Ok(());
                }
                Some(JobEvent::Done) | None => return Ok(()),
                Some(event) => {
                    debug!(job = id, ?event, "unexpected event before tunnel");
                    return Ok(());
                }
            },
            read = reader.read(&mut buf) => match read {
                Ok(n) if n > 0 => pending.push(Bytes::copy_from_slice(&buf[..n])),
                _ => {
                    debug!(job = id, "client disconnected before tunnel");
                    cancel.cancel();
                    return Ok(());
                }
            },
        }
    }
    writer
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await
        .std_context("client gone at tunnel open")?;

    // Uplink runs on its own task so that neither tunnel direction can stall
    // the other through this connection's backpressure.
    let uplink = tokio::spawn(client_uplink(reader, uplink_tx, pending));
    loop {
        match events.recv().await {
            Some(JobEvent::Chunk(bytes)) => {
                if writer.write_all(&bytes).await.is_err() {
                    debug!(job = id, "client gone mid tunnel");
                    break;
                }
            }
            Some(JobEvent::HalfClosed) => {
                writer.shutdown().await.ok();
            }
            Some(JobEvent::Failed(_)) | Some(JobEvent::Done) | None => break,
            Some(event) => {
                debug!(job = id, ?event, "unexpected event in tunnel");
                break;
            }
        }
    }
    uplink.abort();
    Ok(())
}

/// Reads client bytes into the uplink channel until EOF.
///
/// Dropping the sender is the EOF signal: the worker answers it by sending
/// CLOSE for the client→origin direction.
async fn client_uplink(
    mut reader: Prebuffered<OwnedReadHalf>,
    uplink: mpsc::Sender<Bytes>,
    pending: Vec<Bytes>,
) {
    for bytes in pending {
        if uplink.send(bytes).await.is_err() {
            return;
        }
    }
    let mut buf = vec![0u8; UPLINK_READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(n) if n > 0 => {
                if uplink.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    return;
                }
            }
            _ => return,
        }
    }
}
