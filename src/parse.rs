use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header, uri::Scheme};
use n0_error::{Result, StackResultExt, StdResultExt, anyerr, ensure_any};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::util::Prebuffered;

/// Value appended to the `Via` header of every forwarded request.
pub const VIA_PSEUDONYM: &str = "1.1 ship-proxy";

/// Headers meaningful only for a single transport hop, removed before
/// forwarding per RFC 7230 §6.1, in addition to anything named by the
/// request's own `Connection` header.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const MAX_CHUNK_HEADER_LINE: usize = 256;

/// Host and port parsed from an HTTP request target.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
#[display("{host}:{port}")]
pub struct Authority {
    /// Hostname or IP literal without scheme.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl FromStr for Authority {
    type Err = n0_error::AnyError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_authority_str(s)
    }
}

impl Authority {
    /// Parses an authority-form target (`host:port`); the port is required.
    pub fn from_authority_str(s: &str) -> Result<Self> {
        let uri = Uri::from_str(s).std_context("invalid authority string")?;
        ensure_any!(uri.scheme().is_none(), "expected target without scheme");
        ensure_any!(uri.path_and_query().is_none(), "expected target without path");
        let authority = uri.authority().context("expected target with authority")?;
        let port = authority.port_u16().context("expected target with port")?;
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }

    /// Parses an absolute-form URI, inferring the port from the scheme when absent.
    pub fn from_absolute_uri(uri: &Uri) -> Result<Self> {
        let authority = uri.authority().context("expected URI with authority")?;
        let port = match authority.port_u16() {
            Some(port) => port,
            None => match uri.scheme() {
                Some(scheme) if *scheme == Scheme::HTTP => 80,
                Some(scheme) if *scheme == Scheme::HTTPS => 443,
                _ => Err(anyerr!("expected URI with port or http(s) scheme"))?,
            },
        };
        Ok(Self {
            host: authority.host().to_string(),
            port,
        })
    }

    /// Address string suitable for `TcpStream::connect`.
    pub fn to_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// One parsed client proxy request, ready to be framed for the link.
#[derive(Debug)]
pub(crate) enum ProxyRequest {
    /// Absolute-form request to forward.
    Http(ForwardRequest),
    /// `CONNECT host:port` tunnel request.
    Connect { target: Authority },
}

/// Absolute-form request with hop-by-hop headers removed, `Via` appended, and
/// the body fully read.
#[derive(derive_more::Debug)]
pub(crate) struct ForwardRequest {
    pub method: Method,
    pub target: Uri,
    pub headers: HeaderMap,
    #[debug(skip)]
    pub body: Bytes,
}

impl ProxyRequest {
    /// Reads and parses one proxy request from `reader`, including the body.
    ///
    /// Accepts absolute-form targets and `CONNECT`. Anything else, notably
    /// origin-form targets aimed at an ordinary server, is an error.
    pub(crate) async fn read(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<Self> {
        let (head_len, head) = Head::read(reader).await?;
        reader.advance(head_len);

        if head.method == Method::CONNECT {
            let target = Authority::from_authority_str(&head.target)?;
            return Ok(Self::Connect { target });
        }

        let target = Uri::from_str(&head.target).std_context("invalid request target")?;
        ensure_any!(
            target.scheme().is_some(),
            "expected absolute-form request target"
        );

        let mut headers = head.headers;
        let chunked = is_chunked(&headers);
        let length = content_length(&headers)?;
        let body = match (chunked, length) {
            (true, _) => read_chunked_body(reader).await?,
            (false, Some(length)) => read_sized_body(reader, length).await?,
            (false, None) => Bytes::new(),
        };

        filter_hop_by_hop(&mut headers);
        if chunked || length.is_some() {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
        }
        headers.append(header::VIA, HeaderValue::from_static(VIA_PSEUDONYM));

        Ok(Self::Http(ForwardRequest {
            method: head.method,
            target,
            headers,
            body,
        }))
    }
}

impl ForwardRequest {
    /// Serializes the request line and header section for the link frame.
    pub(crate) fn head_bytes(&self) -> Bytes {
        let mut head = BytesMut::new();
        head.extend_from_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.target).as_bytes());
        for (name, value) in self.headers.iter() {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        head.freeze()
    }
}

/// Request line and header section, parsed but not yet consumed.
struct Head {
    method: Method,
    target: String,
    headers: HeaderMap,
}

impl Head {
    /// Fills the reader until a complete header section parses.
    ///
    /// Returns the header section length and the parsed head; the caller
    /// consumes the section by advancing the reader.
    async fn read(reader: &mut Prebuffered<impl AsyncRead + Unpin>) -> Result<(usize, Self)> {
        loop {
            if let Some(parsed) = Self::parse(reader.chunk())? {
                return Ok(parsed);
            }
            if reader.at_limit() {
                return Err(anyerr!(
                    "request header section exceeds {} bytes",
                    crate::HEADER_SECTION_MAX_LENGTH
                ));
            }
            let n = reader.fill().await.std_context("failed to read request")?;
            ensure_any!(n > 0, "connection closed before end of request header section");
        }
    }

    /// Parses a head from a buffer; `None` when more bytes are needed.
    fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("invalid HTTP request")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(head_len) => {
                let method: Method = req
                    .method
                    .context("missing HTTP method")?
                    .parse()
                    .std_context("invalid HTTP method")?;
                let target = req.path.context("missing request target")?.to_string();
                let headers = HeaderMap::from_iter(req.headers.iter_mut().flat_map(|h| {
                    let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    Some((name, value))
                }));
                Ok(Some((
                    head_len,
                    Self {
                        method,
                        target,
                        headers,
                    },
                )))
            }
        }
    }
}

/// True if any header named by the hop-by-hop set matches `name`.
pub(crate) fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Removes hop-by-hop headers, including any named by `Connection`.
pub(crate) fn filter_hop_by_hop(headers: &mut HeaderMap) {
    let connection_named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
    for name in connection_named {
        headers.remove(name);
    }
}

fn content_length(headers: &HeaderMap) -> Result<Option<u64>> {
    match headers.get(header::CONTENT_LENGTH) {
        None => Ok(None),
        Some(value) => {
            let value = value.to_str().std_context("invalid Content-Length")?;
            let length = value.trim().parse().std_context("invalid Content-Length")?;
            Ok(Some(length))
        }
    }
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

async fn read_sized_body(
    reader: &mut (impl AsyncRead + Unpin),
    length: u64,
) -> Result<Bytes> {
    let mut body = vec![0u8; length as usize];
    reader
        .read_exact(&mut body)
        .await
        .std_context("connection closed mid request body")?;
    Ok(body.into())
}

async fn read_chunked_body(reader: &mut (impl AsyncRead + Unpin)) -> Result<Bytes> {
    let mut body = BytesMut::new();
    loop {
        let line = read_line(reader).await?;
        let size_str = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_str, 16).std_context("invalid chunk size")?;
        if size == 0 {
            break;
        }
        let mut chunk = vec![0u8; size];
        reader
            .read_exact(&mut chunk)
            .await
            .std_context("connection closed mid chunk")?;
        body.extend_from_slice(&chunk);
        let separator = read_line(reader).await?;
        ensure_any!(separator.is_empty(), "missing CRLF after chunk");
    }
    // Trailer section: discarded up to the terminating empty line.
    loop {
        if read_line(reader).await?.is_empty() {
            break;
        }
    }
    Ok(body.freeze())
}

async fn read_line(reader: &mut (impl AsyncRead + Unpin)) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = reader
            .read_u8()
            .await
            .std_context("connection closed mid chunk header")?;
        if byte == b'\n' {
            break;
        }
        line.push(byte);
        ensure_any!(line.len() <= MAX_CHUNK_HEADER_LINE, "chunk header line too long");
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).std_context("invalid chunk header line")
}

/// Minimal HTTP/1.1 response used for locally synthesized replies.
#[derive(Debug)]
pub(crate) struct HttpResponse {
    status: StatusCode,
    body: Bytes,
}

impl HttpResponse {
    pub(crate) fn with_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Writes the response with a `Content-Length` and closes the message.
    pub(crate) async fn write(&self, writer: &mut (impl AsyncWrite + Unpin)) -> io::Result<()> {
        let reason = self.status.canonical_reason().unwrap_or("");
        let head = format!(
            "HTTP/1.1 {} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            self.status.as_u16(),
            self.body.len()
        );
        writer.write_all(head.as_bytes()).await?;
        writer.write_all(&self.body).await?;
        writer.flush().await
    }

    /// Parses a response head from a buffer; `None` when incomplete.
    ///
    /// Returns the header section length and the status code.
    #[cfg(test)]
    pub(crate) fn parse_status(buf: &[u8]) -> Result<Option<(usize, StatusCode)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("invalid HTTP response")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(head_len) => {
                let code = res.code.context("missing response status code")?;
                let status =
                    StatusCode::from_u16(code).std_context("invalid response status code")?;
                Ok(Some((head_len, status)))
            }
        }
    }
}
