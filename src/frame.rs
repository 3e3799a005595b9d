//! Length-prefixed framing for the ship↔offshore link.
//!
//! A frame is `[1 byte kind][8 bytes job id, big-endian][4 bytes length,
//! big-endian][length bytes payload]`. All frames of a job are contiguous on
//! the wire; the job id lets either end detect a peer that lost track of the
//! in-flight request.

use bytes::{Buf, BufMut, Bytes};
use n0_error::e;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{MAX_FRAME_PAYLOAD, error::LinkError};

/// Wire header size: kind (1) + job id (8) + payload length (4).
pub const HEADER_LEN: usize = 13;

/// Direction byte in a [`FrameKind::Close`] payload: the client→origin half.
pub const CLOSE_CLIENT_TO_ORIGIN: u8 = 1;
/// Direction byte in a [`FrameKind::Close`] payload: the origin→client half.
pub const CLOSE_ORIGIN_TO_CLIENT: u8 = 0;

/// Frame discriminants as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Ship→offshore: serialized HTTP/1.1 request head plus leading body bytes.
    HttpReq,
    /// Offshore→ship: a slice of the upstream response bytes.
    HttpRespChunk,
    /// Offshore→ship: end of the response for this job.
    HttpRespEnd,
    /// Ship→offshore: open a tunnel; payload is `host:port`.
    ConnectOpen,
    /// Offshore→ship: the tunnel is open, DATA frames follow.
    ConnectOk,
    /// Offshore→ship: the tunnel was rejected; payload is a reason string.
    ConnectFail,
    /// Both directions: opaque tunnel bytes, or request body continuation.
    Data,
    /// Both directions: clean end of one tunnel direction; payload is a single
    /// direction byte.
    Close,
    /// Offshore→ship: upstream failure; payload is a UTF-8 reason.
    Error,
}

impl FrameKind {
    fn to_wire(self) -> u8 {
        match self {
            Self::HttpReq => 1,
            Self::HttpRespChunk => 2,
            Self::HttpRespEnd => 3,
            Self::ConnectOpen => 4,
            Self::ConnectOk => 5,
            Self::ConnectFail => 6,
            Self::Data => 7,
            Self::Close => 8,
            Self::Error => 9,
        }
    }

    fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::HttpReq),
            2 => Some(Self::HttpRespChunk),
            3 => Some(Self::HttpRespEnd),
            4 => Some(Self::ConnectOpen),
            5 => Some(Self::ConnectOk),
            6 => Some(Self::ConnectFail),
            7 => Some(Self::Data),
            8 => Some(Self::Close),
            9 => Some(Self::Error),
            _ => None,
        }
    }
}

/// One length-prefixed unit on the link.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub job: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, job: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            job,
            payload: payload.into(),
        }
    }

    pub fn empty(kind: FrameKind, job: u64) -> Self {
        Self::new(kind, job, Bytes::new())
    }
}

/// Reads whole frames from the link's receive half.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads one frame.
    ///
    /// Any I/O failure, including EOF mid-frame, means the connection is no
    /// longer usable and the caller must reconnect (ship) or drop the peer
    /// (offshore). The same goes for a [`LinkError::Protocol`] result.
    pub async fn read_frame(&mut self) -> Result<Frame, LinkError> {
        let mut header = [0u8; HEADER_LEN];
        self.inner.read_exact(&mut header).await?;
        let mut fields = &header[..];
        let kind_byte = fields.get_u8();
        let job = fields.get_u64();
        let len = fields.get_u32() as usize;
        let kind = FrameKind::from_wire(kind_byte).ok_or_else(|| {
            e!(LinkError::Protocol {
                reason: format!("unknown frame kind {kind_byte:#04x}"),
            })
        })?;
        if len > MAX_FRAME_PAYLOAD {
            return Err(e!(LinkError::Protocol {
                reason: format!("{len} byte payload exceeds the {MAX_FRAME_PAYLOAD} byte frame cap"),
            }));
        }
        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await?;
        Ok(Frame {
            kind,
            job,
            payload: payload.into(),
        })
    }
}

/// Writes whole frames to the link's send half.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes one frame and flushes it.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), LinkError> {
        if frame.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(e!(LinkError::Protocol {
                reason: format!(
                    "refusing to send {} byte payload over the {MAX_FRAME_PAYLOAD} byte frame cap",
                    frame.payload.len()
                ),
            }));
        }
        let mut header = [0u8; HEADER_LEN];
        {
            let mut fields = &mut header[..];
            fields.put_u8(frame.kind.to_wire());
            fields.put_u64(frame.job);
            fields.put_u32(frame.payload.len() as u32);
        }
        self.inner.write_all(&header).await?;
        self.inner.write_all(&frame.payload).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Splits `bytes` into payloads that fit under the frame cap, in order.
pub fn split_payload(bytes: Bytes) -> impl Iterator<Item = Bytes> {
    let mut rest = bytes;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let take = rest.len().min(MAX_FRAME_PAYLOAD);
        Some(rest.split_to(take))
    })
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn roundtrip() {
        let (client, server) = tokio::io::duplex(4096);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        let sent = Frame::new(FrameKind::ConnectOpen, 7, b"example.com:443".to_vec());
        writer.write_frame(&sent).await.unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.kind, FrameKind::ConnectOpen);
        assert_eq!(frame.job, 7);
        assert_eq!(&frame.payload[..], b"example.com:443");

        writer
            .write_frame(&Frame::empty(FrameKind::HttpRespEnd, 8))
            .await
            .unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.kind, FrameKind::HttpRespEnd);
        assert!(frame.payload.is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_is_a_protocol_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut header = [0u8; HEADER_LEN];
        header[0] = 0xAA;
        client.write_all(&header).await.unwrap();
        let mut reader = FrameReader::new(server);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, LinkError::Protocol { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn oversize_length_is_a_protocol_error() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut header = Vec::new();
        header.put_u8(FrameKind::Data.to_wire());
        header.put_u64(1);
        header.put_u32((MAX_FRAME_PAYLOAD + 1) as u32);
        client.write_all(&header).await.unwrap();
        let mut reader = FrameReader::new(server);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, LinkError::Protocol { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn eof_mid_frame_is_link_lost() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut header = Vec::new();
        header.put_u8(FrameKind::Data.to_wire());
        header.put_u64(1);
        header.put_u32(100);
        client.write_all(&header).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);
        let mut reader = FrameReader::new(server);
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, LinkError::Lost { .. }), "{err:?}");
    }

    #[test]
    fn split_payload_respects_cap() {
        assert_eq!(split_payload(Bytes::new()).count(), 0);

        let one = split_payload(Bytes::from(vec![1u8; MAX_FRAME_PAYLOAD])).collect::<Vec<_>>();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].len(), MAX_FRAME_PAYLOAD);

        let chunks =
            split_payload(Bytes::from(vec![2u8; 2 * MAX_FRAME_PAYLOAD + 3])).collect::<Vec<_>>();
        assert_eq!(
            chunks.iter().map(|c| c.len()).collect::<Vec<_>>(),
            vec![MAX_FRAME_PAYLOAD, MAX_FRAME_PAYLOAD, 3]
        );
    }
}
