use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use http::StatusCode;
use n0_error::{Result, StackResultExt, StdResultExt, ensure_any};
use n0_future::task::AbortOnDropHandle;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::Instant,
};
use tokio_util::time::FutureExt;
use tracing::debug;
use tracing_test::traced_test;

use crate::{
    frame::{Frame, FrameKind, FrameReader, FrameWriter},
    offshore::OffshoreProxy,
    parse::HttpResponse,
    ship::{LinkOpts, ShipCore},
};

// -- Test helpers --

type RequestLog = Arc<Mutex<Vec<String>>>;

/// Spawns an offshore proxy on a loopback port.
async fn spawn_offshore() -> Result<(SocketAddr, AbortOnDropHandle<Result>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    debug!(%addr, "spawned offshore proxy");
    let task = tokio::spawn(async move { OffshoreProxy::new().serve(listener).await });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Spawns a ship proxy pointed at the given offshore address.
async fn spawn_ship(offshore: SocketAddr) -> Result<(SocketAddr, AbortOnDropHandle<Result>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    debug!(%addr, "spawned ship proxy");
    let core = ShipCore::new(LinkOpts::new(offshore.ip().to_string(), offshore.port()));
    let task = tokio::spawn(async move { core.run(listener).await });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Spawns the full two-process pair and returns the ship's proxy address.
async fn spawn_pair() -> Result<(
    SocketAddr,
    AbortOnDropHandle<Result>,
    AbortOnDropHandle<Result>,
)> {
    let (offshore_addr, offshore_task) = spawn_offshore().await?;
    let (ship_addr, ship_task) = spawn_ship(offshore_addr).await?;
    Ok((ship_addr, ship_task, offshore_task))
}

/// Spawns an HTTP origin server; requests are appended to `log` as they arrive.
async fn spawn_origin(
    label: &'static str,
) -> Result<(SocketAddr, RequestLog, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let log: RequestLog = Arc::new(Mutex::new(Vec::new()));
    debug!(%label, %addr, "spawned origin server");
    let task = {
        let log = log.clone();
        tokio::spawn(async move { origin::run(listener, label, log).await })
    };
    Ok((addr, log, AbortOnDropHandle::new(task)))
}

/// Spawns a raw TCP echo server.
async fn spawn_echo_server() -> Result<(SocketAddr, AbortOnDropHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    Ok((addr, AbortOnDropHandle::new(task)))
}

/// Binds and immediately drops a listener to get a port that refuses connections.
async fn dead_origin_addr() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

fn proxy_client(proxy: SocketAddr) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .proxy(reqwest::Proxy::http(format!("http://{proxy}")).anyerr()?)
        .pool_max_idle_per_host(0)
        .build()
        .anyerr()
}

/// Issues a CONNECT through the ship proxy and returns the stream along with
/// the proxy's response status.
async fn open_tunnel(
    proxy: SocketAddr,
    target: impl std::fmt::Display,
) -> Result<(TcpStream, StatusCode)> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream
        .write_all(format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n\r\n").as_bytes())
        .await?;
    // Byte-at-a-time so no tunnel bytes are consumed past the response head.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream
            .read(&mut byte)
            .timeout(Duration::from_secs(5))
            .await
            .anyerr()??;
        ensure_any!(n > 0, "proxy closed during CONNECT handshake");
        head.push(byte[0]);
        ensure_any!(head.len() < 1024, "CONNECT response head too large");
    }
    let (_, status) = HttpResponse::parse_status(&head)?.context("incomplete CONNECT response")?;
    Ok((stream, status))
}

// -- Tests --

/// A plain GET through both hops returns the origin's response unchanged.
#[tokio::test]
#[traced_test]
async fn http_get_roundtrip() -> Result {
    let (origin_addr, _log, _origin) = spawn_origin("origin").await?;
    let (proxy_addr, _ship, _offshore) = spawn_pair().await?;

    let client = proxy_client(proxy_addr)?;
    let res = client
        .get(format!("http://{origin_addr}/test/path"))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.anyerr()?, "origin GET /test/path");
    Ok(())
}

/// The proxy announces itself in the Via header it forwards.
#[tokio::test]
#[traced_test]
async fn via_header_is_appended() -> Result {
    let (origin_addr, _log, _origin) = spawn_origin("origin").await?;
    let (proxy_addr, _ship, _offshore) = spawn_pair().await?;

    let client = proxy_client(proxy_addr)?;
    let res = client
        .get(format!("http://{origin_addr}/via"))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.text().await.anyerr()?, crate::parse::VIA_PSEUDONYM);
    Ok(())
}

/// A POST body crosses the link intact and comes back echoed.
#[tokio::test]
#[traced_test]
async fn http_post_echoes_body() -> Result {
    let (origin_addr, _log, _origin) = spawn_origin("origin").await?;
    let (proxy_addr, _ship, _offshore) = spawn_pair().await?;

    let client = proxy_client(proxy_addr)?;
    let res = client
        .post(format!("http://{origin_addr}/echo"))
        .header("content-type", "application/json")
        .body(r#"{"k":"v"}"#)
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.anyerr()?, r#"{"k":"v"}"#);
    Ok(())
}

/// Bodies larger than the frame cap are split across frames on both legs.
#[tokio::test]
#[traced_test]
async fn large_body_streams_in_frames() -> Result {
    let (origin_addr, _log, _origin) = spawn_origin("origin").await?;
    let (proxy_addr, _ship, _offshore) = spawn_pair().await?;

    let body = "x".repeat(3 * 1024 * 1024);
    let client = proxy_client(proxy_addr)?;
    let res = client
        .post(format!("http://{origin_addr}/echo"))
        .body(body.clone())
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.anyerr()?, body);
    Ok(())
}

/// Bytes cross a CONNECT tunnel unchanged in both directions.
#[tokio::test]
#[traced_test]
async fn connect_tunnel_is_transparent() -> Result {
    let (echo_addr, _echo) = spawn_echo_server().await?;
    let (proxy_addr, _ship, _offshore) = spawn_pair().await?;

    let (mut stream, status) = open_tunnel(proxy_addr, echo_addr).await?;
    assert_eq!(status, StatusCode::OK);

    // A TLS ClientHello prefix plus some arbitrary binary.
    let payload: Vec<u8> = [&[0x16, 0x03, 0x01][..], &(0..=255u8).collect::<Vec<_>>()].concat();
    stream.write_all(&payload).await?;
    let mut echoed = vec![0u8; payload.len()];
    stream
        .read_exact(&mut echoed)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;
    assert_eq!(echoed, payload);

    stream.shutdown().await?;
    let mut rest = Vec::new();
    stream
        .read_to_end(&mut rest)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;
    assert!(rest.is_empty());
    Ok(())
}

/// CONNECT to a refused port surfaces as a non-200 from the ship proxy.
#[tokio::test]
#[traced_test]
async fn connect_to_dead_origin_is_rejected() -> Result {
    let dead = dead_origin_addr().await?;
    let (proxy_addr, _ship, _offshore) = spawn_pair().await?;

    let (_stream, status) = open_tunnel(proxy_addr, dead).await?;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    Ok(())
}

/// An unreachable origin turns into a 502 with the failure reason as body.
#[tokio::test]
#[traced_test]
async fn http_to_dead_origin_returns_502() -> Result {
    let dead = dead_origin_addr().await?;
    let (proxy_addr, _ship, _offshore) = spawn_pair().await?;

    let client = proxy_client(proxy_addr)?;
    let res = client
        .get(format!("http://{dead}/whatever"))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    assert!(!res.text().await.anyerr()?.is_empty());
    Ok(())
}

/// Origin-form requests are not proxy requests and get a 400.
#[tokio::test]
#[traced_test]
async fn origin_form_request_gets_400() -> Result {
    let (proxy_addr, _ship, _offshore) = spawn_pair().await?;

    let mut stream = TcpStream::connect(proxy_addr).await?;
    stream
        .write_all(b"GET /local/path HTTP/1.1\r\nHost: somewhere\r\n\r\n")
        .await?;
    let mut response = Vec::new();
    stream
        .read_to_end(&mut response)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;
    let (_, status) = HttpResponse::parse_status(&response)?.context("incomplete response")?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

/// Concurrent clients are served one at a time, in enqueue order: a slow
/// request fully completes before the later ones reach the origin.
#[tokio::test]
#[traced_test]
async fn requests_are_sequential_in_enqueue_order() -> Result {
    let (origin_addr, log, _origin) = spawn_origin("origin").await?;
    let (proxy_addr, _ship, _offshore) = spawn_pair().await?;

    let start = Instant::now();
    let mut handles = Vec::new();
    for path in ["/slow", "/fast", "/data"] {
        let client = proxy_client(proxy_addr)?;
        let url = format!("http://{origin_addr}{path}");
        handles.push(tokio::spawn(async move {
            let res = client.get(&url).send().await?;
            res.text().await
        }));
        // Stagger the submissions so the enqueue order is deterministic.
        tokio::time::sleep(Duration::from_millis(150)).await;
    }
    for handle in handles {
        handle.await.anyerr()?.anyerr()?;
    }

    // /slow holds the link for its full duration before /fast runs.
    assert!(start.elapsed() >= Duration::from_millis(800));
    let order = log.lock().ok().context("poisoned log")?.clone();
    assert_eq!(order, vec!["/slow", "/fast", "/data"]);
    Ok(())
}

/// While a tunnel is open the queue stalls; closing the tunnel releases it.
#[tokio::test]
#[traced_test]
async fn tunnel_stalls_the_queue() -> Result {
    let (echo_addr, _echo) = spawn_echo_server().await?;
    let (origin_addr, _log, _origin) = spawn_origin("origin").await?;
    let (proxy_addr, _ship, _offshore) = spawn_pair().await?;

    let (mut tunnel, status) = open_tunnel(proxy_addr, echo_addr).await?;
    assert_eq!(status, StatusCode::OK);
    tunnel.write_all(b"ping").await?;
    let mut pong = [0u8; 4];
    tunnel
        .read_exact(&mut pong)
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()??;

    let client = proxy_client(proxy_addr)?;
    let url = format!("http://{origin_addr}/after-tunnel");
    let pending = tokio::spawn(async move {
        let res = client.get(&url).send().await?;
        res.text().await
    });
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(!pending.is_finished(), "request ran while the tunnel held the link");

    drop(tunnel);
    let text = pending
        .timeout(Duration::from_secs(5))
        .await
        .anyerr()?
        .anyerr()?
        .anyerr()?;
    assert_eq!(text, "origin GET /after-tunnel");
    Ok(())
}

/// Killing the offshore fails the in-flight request; after a restart on the
/// same port, the next request succeeds over a fresh link.
#[tokio::test]
#[traced_test]
async fn reconnects_after_offshore_restart() -> Result {
    let (origin_addr, _log, _origin) = spawn_origin("origin").await?;
    let (offshore_addr, offshore_task) = spawn_offshore().await?;
    let (proxy_addr, _ship) = spawn_ship(offshore_addr).await?;

    let client = proxy_client(proxy_addr)?;
    let res = client
        .get(format!("http://{origin_addr}/first"))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);

    drop(offshore_task);
    let client = proxy_client(proxy_addr)?;
    let res = client
        .get(format!("http://{origin_addr}/down"))
        .send()
        .await
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);

    // Restart the offshore on the same address the ship is configured for.
    let listener = loop {
        match TcpListener::bind(offshore_addr).await {
            Ok(listener) => break listener,
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    };
    let _offshore = AbortOnDropHandle::new(tokio::spawn(async move {
        OffshoreProxy::new().serve(listener).await
    }));

    let client = proxy_client(proxy_addr)?;
    let res = client
        .get(format!("http://{origin_addr}/recovered"))
        .send()
        .timeout(Duration::from_secs(10))
        .await
        .anyerr()?
        .anyerr()?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.anyerr()?, "origin GET /recovered");
    Ok(())
}

/// A second link connection is refused while one is live, and the first
/// keeps working.
#[tokio::test]
#[traced_test]
async fn second_link_connection_is_rejected() -> Result {
    let (echo_addr, _echo) = spawn_echo_server().await?;
    let (offshore_addr, _offshore) = spawn_offshore().await?;

    let first = TcpStream::connect(offshore_addr).await?;
    // Give the offshore a beat to claim the link slot.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut second = TcpStream::connect(offshore_addr).await?;

    let mut buf = [0u8; 1];
    let n = second
        .read(&mut buf)
        .timeout(Duration::from_secs(2))
        .await
        .anyerr()??;
    assert_eq!(n, 0, "the superfluous link connection should be closed");

    // The preferred link still serves jobs.
    let (read, write) = first.into_split();
    let mut reader = FrameReader::new(read);
    let mut writer = FrameWriter::new(write);
    let open = Frame::new(
        FrameKind::ConnectOpen,
        1,
        echo_addr.to_string().into_bytes(),
    );
    writer.write_frame(&open).await.anyerr()?;
    let frame = reader.read_frame().await.anyerr()?;
    assert_eq!(frame.kind, FrameKind::ConnectOk);
    Ok(())
}

mod origin {
    use std::{sync::Arc, time::Duration};

    use http_body_util::{BodyExt, Full};
    use hyper::{Request, Response, body::Bytes, server::conn::http1, service::service_fn};
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    use super::RequestLog;

    /// Small test origin: `/echo` echoes the request body, `/slow` sleeps
    /// before answering, `/via` returns the received `Via` header, and
    /// anything else returns "{label} {METHOD} {PATH}".
    pub(super) async fn run(listener: TcpListener, label: &'static str, log: RequestLog) {
        let label = Arc::new(label);
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            let label = label.clone();
            let log = log.clone();
            tokio::task::spawn(async move {
                let handler = move |req: Request<hyper::body::Incoming>| {
                    let label = label.clone();
                    let log = log.clone();
                    async move {
                        let method = req.method().clone();
                        let path = req.uri().path().to_string();
                        if let Ok(mut log) = log.lock() {
                            log.push(path.clone());
                        }
                        let via = req
                            .headers()
                            .get("via")
                            .and_then(|value| value.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let body = req.collect().await?.to_bytes();
                        let response = match path.as_str() {
                            "/echo" => body,
                            "/via" => Bytes::from(via),
                            "/slow" => {
                                tokio::time::sleep(Duration::from_millis(800)).await;
                                Bytes::from("slow done")
                            }
                            _ => Bytes::from(format!("{} {} {}", *label, method, path)),
                        };
                        Ok::<_, hyper::Error>(Response::new(Full::new(response)))
                    }
                };
                let _ = http1::Builder::new()
                    .serve_connection(io, service_fn(handler))
                    .await;
            });
        }
    }
}
