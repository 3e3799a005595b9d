//! Per-request upstream transport: origin HTTP egress and CONNECT tunnels.
//!
//! A dispatcher invocation owns the link until its job is finished; only the
//! full-duplex halves of a tunnel run concurrently.

use std::{str::FromStr, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use http::Uri;
use n0_error::{AnyError, Result, StackResultExt, StdResultExt, anyerr, e, stack_error};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, tcp::OwnedReadHalf, tcp::OwnedWriteHalf},
    sync::Mutex,
};
use tokio_util::time::FutureExt;
use tracing::{debug, warn};

use crate::{
    error::LinkError,
    frame::{CLOSE_CLIENT_TO_ORIGIN, CLOSE_ORIGIN_TO_CLIENT, Frame, FrameKind, FrameReader, FrameWriter},
    parse::{Authority, is_hop_by_hop},
};

/// Timeout for dialing an origin server.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle timeout per read from an origin; expiry fails the request.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Read size for streaming origin responses.
const RESPONSE_READ_CHUNK: usize = 64 * 1024;
/// Read size for tunnel downlink chunks.
const TUNNEL_READ_CHUNK: usize = 16 * 1024;

type SharedWriter = Arc<Mutex<FrameWriter<OwnedWriteHalf>>>;

#[stack_error(derive, from_sources)]
enum ForwardError {
    /// The link itself failed; fatal to this peer connection.
    Link {
        #[error(source)]
        source: LinkError,
    },
    /// The origin failed; reported to the ship as an ERROR frame.
    Upstream {
        #[error(source)]
        source: AnyError,
    },
}

/// Handles one HTTP_REQ frame end to end.
///
/// Upstream failures (dial, I/O, timeout) produce a single ERROR frame,
/// even when chunks already went out: a truncated response must not look
/// complete to the ship.
pub(super) async fn http(
    frame: Frame,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &SharedWriter,
) -> Result<(), LinkError> {
    let job = frame.job;
    let head = parse_head(&frame.payload)?;
    let total = declared_content_length(&head)?;
    let body = read_request_body(&frame.payload, head.header_len, total, reader, job).await?;
    debug!(method = %head.method, target = %head.target, body = body.len(), "dispatching request");
    match forward(&head, body, writer, job).await {
        Ok(()) => Ok(()),
        Err(ForwardError::Link { source, .. }) => Err(source),
        Err(ForwardError::Upstream { source, .. }) => {
            warn!("upstream failure: {source:#}");
            let reason = source.to_string().into_bytes();
            let mut writer = writer.lock().await;
            writer.write_frame(&Frame::new(FrameKind::Error, job, reason)).await?;
            Ok(())
        }
    }
}

/// Serialized request head as it arrived in the HTTP_REQ frame.
struct WireRequest {
    method: String,
    target: String,
    /// Headers in wire order, duplicates preserved.
    headers: Vec<(String, Vec<u8>)>,
    header_len: usize,
}

/// A malformed embedded request means the ship and offshore disagree about
/// the protocol, so it is fatal to the link rather than a per-job error.
fn parse_head(payload: &[u8]) -> Result<WireRequest, LinkError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);
    let header_len = match req.parse(payload) {
        Ok(httparse::Status::Complete(header_len)) => header_len,
        Ok(httparse::Status::Partial) => {
            return Err(e!(LinkError::Protocol {
                reason: "truncated request head in HTTP_REQ frame".into(),
            }));
        }
        Err(err) => {
            return Err(e!(LinkError::Protocol {
                reason: format!("malformed request head in HTTP_REQ frame: {err}"),
            }));
        }
    };
    let (Some(method), Some(target)) = (req.method, req.path) else {
        return Err(e!(LinkError::Protocol {
            reason: "request head without method or target".into(),
        }));
    };
    Ok(WireRequest {
        method: method.to_string(),
        target: target.to_string(),
        headers: req
            .headers
            .iter()
            .map(|h| (h.name.to_string(), h.value.to_vec()))
            .collect(),
        header_len,
    })
}

fn declared_content_length(head: &WireRequest) -> Result<usize, LinkError> {
    let Some((_, value)) = head
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
    else {
        return Ok(0);
    };
    std::str::from_utf8(value)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| {
            e!(LinkError::Protocol {
                reason: "invalid Content-Length in HTTP_REQ frame".into(),
            })
        })
}

/// Reassembles the request body: whatever followed the head in the HTTP_REQ
/// payload, plus DATA continuation frames until the declared length is met.
async fn read_request_body(
    payload: &Bytes,
    header_len: usize,
    total: usize,
    reader: &mut FrameReader<OwnedReadHalf>,
    job: u64,
) -> Result<Bytes, LinkError> {
    let initial = payload.slice(header_len..);
    if initial.len() > total {
        return Err(e!(LinkError::Protocol {
            reason: "request body exceeds its declared length".into(),
        }));
    }
    if initial.len() == total {
        return Ok(initial);
    }
    let mut body = BytesMut::with_capacity(total);
    body.extend_from_slice(&initial);
    while body.len() < total {
        let frame = reader.read_frame().await?;
        if frame.job != job {
            return Err(e!(LinkError::Protocol {
                reason: format!("frame for job {} during job {job}'s request body", frame.job),
            }));
        }
        if frame.kind != FrameKind::Data {
            return Err(e!(LinkError::Protocol {
                reason: format!("unexpected {:?} frame during request body", frame.kind),
            }));
        }
        body.extend_from_slice(&frame.payload);
        if body.len() > total {
            return Err(e!(LinkError::Protocol {
                reason: "request body exceeds its declared length".into(),
            }));
        }
    }
    Ok(body.freeze())
}

/// Performs the origin exchange and streams the response back as frames.
async fn forward(
    head: &WireRequest,
    body: Bytes,
    writer: &SharedWriter,
    job: u64,
) -> Result<(), ForwardError> {
    let (authority, origin_form) = resolve_target(head)?;
    let request = origin_request_bytes(head, &authority, &origin_form, &body);

    let dialed = TcpStream::connect(authority.to_addr())
        .timeout(DIAL_TIMEOUT)
        .await
        .map_err(|_| anyerr!("upstream dial timed out"))?;
    let mut stream = dialed.std_context("upstream dial failed")?;
    debug!(%authority, "connected to origin");
    stream
        .write_all(&request)
        .await
        .std_context("failed to write upstream request")?;

    let mut buf = vec![0u8; RESPONSE_READ_CHUNK];
    loop {
        let read = stream
            .read(&mut buf)
            .timeout(IDLE_TIMEOUT)
            .await
            .map_err(|_| anyerr!("upstream timeout"))?;
        let n = read.std_context("failed to read upstream response")?;
        if n == 0 {
            break;
        }
        let chunk = Frame::new(FrameKind::HttpRespChunk, job, Bytes::copy_from_slice(&buf[..n]));
        writer.lock().await.write_frame(&chunk).await?;
    }
    let end = Frame::empty(FrameKind::HttpRespEnd, job);
    writer.lock().await.write_frame(&end).await?;
    Ok(())
}

/// Picks the origin authority and the origin-form request target.
///
/// Absolute-form targets carry the destination themselves; origin-form
/// targets fall back to the `Host` header with port 80.
fn resolve_target(head: &WireRequest) -> Result<(Authority, String)> {
    if let Ok(uri) = Uri::from_str(&head.target) {
        if uri.scheme().is_some() {
            let authority = Authority::from_absolute_uri(&uri)?;
            let origin_form = uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_else(|| "/".to_string());
            return Ok((authority, origin_form));
        }
    }
    let (_, value) = head
        .headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("host"))
        .context("cannot determine the request's destination host")?;
    let host = std::str::from_utf8(value).std_context("invalid Host header")?.trim();
    let authority = if host.contains(':') {
        Authority::from_authority_str(host)?
    } else {
        Authority {
            host: host.to_string(),
            port: 80,
        }
    };
    Ok((authority, head.target.clone()))
}

/// Rewrites the request for its origin hop: origin-form target, `Host`
/// ensured, hop-by-hop headers dropped, and `Connection: close` so the
/// response is EOF-delimited.
fn origin_request_bytes(
    head: &WireRequest,
    authority: &Authority,
    origin_form: &str,
    body: &[u8],
) -> Bytes {
    let connection_named: Vec<String> = head
        .headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case("connection"))
        .filter_map(|(_, value)| std::str::from_utf8(value).ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    let mut out = BytesMut::new();
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", head.method, origin_form).as_bytes());
    let mut wrote_host = false;
    for (name, value) in &head.headers {
        if is_hop_by_hop(name) || connection_named.iter().any(|n| name.eq_ignore_ascii_case(n)) {
            continue;
        }
        if name.eq_ignore_ascii_case("host") {
            wrote_host = true;
        }
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    if !wrote_host {
        out.extend_from_slice(format!("Host: {authority}\r\n").as_bytes());
    }
    out.extend_from_slice(b"Connection: close\r\n\r\n");
    out.extend_from_slice(body);
    out.freeze()
}

/// Handles one CONNECT_OPEN frame: dials the target and, on success, pumps
/// the tunnel until both directions are closed.
pub(super) async fn tunnel(
    frame: Frame,
    reader: &mut FrameReader<OwnedReadHalf>,
    writer: &SharedWriter,
) -> Result<(), LinkError> {
    let job = frame.job;
    let target = std::str::from_utf8(&frame.payload)
        .ok()
        .and_then(|target| Authority::from_authority_str(target).ok());
    let Some(target) = target else {
        let fail = Frame::new(FrameKind::ConnectFail, job, b"invalid connect target".to_vec());
        writer.lock().await.write_frame(&fail).await?;
        return Ok(());
    };
    debug!(%target, "opening tunnel");
    let stream = match TcpStream::connect(target.to_addr()).timeout(DIAL_TIMEOUT).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!(%target, "tunnel dial failed: {err:#}");
            let fail = Frame::new(FrameKind::ConnectFail, job, err.to_string().into_bytes());
            writer.lock().await.write_frame(&fail).await?;
            return Ok(());
        }
        Err(_) => {
            warn!(%target, "tunnel dial timed out");
            let fail = Frame::new(FrameKind::ConnectFail, job, b"tunnel dial timed out".to_vec());
            writer.lock().await.write_frame(&fail).await?;
            return Ok(());
        }
    };
    writer.lock().await.write_frame(&Frame::empty(FrameKind::ConnectOk, job)).await?;

    let (origin_read, mut origin_write) = stream.into_split();
    let mut downlink = tokio::spawn(tunnel_downlink(writer.clone(), job, origin_read));

    let uplink_result: Result<(), LinkError> = async {
        loop {
            let frame = reader.read_frame().await?;
            if frame.job != job {
                return Err(e!(LinkError::Protocol {
                    reason: format!("frame for job {} during job {job}'s tunnel", frame.job),
                }));
            }
            match frame.kind {
                FrameKind::Data => {
                    // A dead origin shows up as CLOSE from the downlink pump;
                    // the remaining uplink bytes have nowhere to go.
                    origin_write.write_all(&frame.payload).await.ok();
                }
                FrameKind::Close
                    if frame.payload.as_ref() == [CLOSE_CLIENT_TO_ORIGIN].as_slice() =>
                {
                    origin_write.shutdown().await.ok();
                    return Ok(());
                }
                kind => {
                    return Err(e!(LinkError::Protocol {
                        reason: format!("unexpected {kind:?} frame during tunnel"),
                    }));
                }
            }
        }
    }
    .await;

    match uplink_result {
        Ok(()) => match (&mut downlink).await {
            Ok(res) => res,
            Err(_) => Err(e!(LinkError::Protocol {
                reason: "tunnel downlink pump died".into(),
            })),
        },
        Err(err) => {
            downlink.abort();
            Err(err)
        }
    }
}

/// Streams origin bytes into DATA frames; origin EOF (or failure, which looks
/// the same to an opaque tunnel) closes the direction with CLOSE.
async fn tunnel_downlink(
    writer: SharedWriter,
    job: u64,
    mut origin: OwnedReadHalf,
) -> Result<(), LinkError> {
    let mut buf = vec![0u8; TUNNEL_READ_CHUNK];
    loop {
        match origin.read(&mut buf).await {
            Ok(n) if n > 0 => {
                let data = Frame::new(FrameKind::Data, job, Bytes::copy_from_slice(&buf[..n]));
                writer.lock().await.write_frame(&data).await?;
            }
            _ => break,
        }
    }
    let close = Frame::new(FrameKind::Close, job, vec![CLOSE_ORIGIN_TO_CLIENT]);
    writer.lock().await.write_frame(&close).await?;
    Ok(())
}
