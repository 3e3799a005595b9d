use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
};
use tokio_util::time::FutureExt;
use tracing::{info, warn};

use crate::{
    error::LinkError,
    frame::{Frame, FrameReader, FrameWriter},
};

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Base reconnect delay; doubles per failed attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Doubling stops after this many failed attempts.
const BACKOFF_MAX_EXP: u32 = 6;

/// Options for the ship→offshore link.
#[derive(Debug, Clone)]
pub struct LinkOpts {
    pub offshore_host: String,
    pub offshore_port: u16,
    pub dial_timeout: Duration,
}

impl LinkOpts {
    pub fn new(offshore_host: impl Into<String>, offshore_port: u16) -> Self {
        Self {
            offshore_host: offshore_host.into(),
            offshore_port,
            dial_timeout: DIAL_TIMEOUT,
        }
    }
}

/// Owns the single TCP connection to the offshore proxy.
///
/// Dials lazily and reconnects with exponential backoff. Sessions carry a
/// generation counter so a caller can tell that the link it started a job on
/// has been replaced; resetting an already-replaced generation is a no-op.
#[derive(derive_more::Debug)]
pub struct LinkManager {
    opts: LinkOpts,
    #[debug(skip)]
    current: Mutex<Option<LinkSession>>,
    generation: AtomicU64,
}

impl LinkManager {
    pub fn new(opts: LinkOpts) -> Self {
        Self {
            opts,
            current: Mutex::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Returns the current session, dialing until connected.
    ///
    /// Holding the state lock across the dial keeps a single connection
    /// attempt active at a time; concurrent callers park here until the link
    /// is up.
    pub async fn ready(&self) -> LinkSession {
        let mut current = self.current.lock().await;
        if let Some(session) = current.as_ref() {
            return session.clone();
        }
        let mut attempt = 0u32;
        loop {
            match self.dial().await {
                Ok(stream) => {
                    let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                    info!(generation, "link connected");
                    let (read, write) = stream.into_split();
                    let session = LinkSession {
                        generation,
                        reader: Arc::new(Mutex::new(FrameReader::new(read))),
                        writer: Arc::new(Mutex::new(FrameWriter::new(write))),
                    };
                    *current = Some(session.clone());
                    return session;
                }
                Err(err) => {
                    let delay = backoff_delay(attempt);
                    warn!("link dial failed (attempt {attempt}): {err:#}, retrying in {delay:?}");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn dial(&self) -> io::Result<TcpStream> {
        let addr = (self.opts.offshore_host.as_str(), self.opts.offshore_port);
        match TcpStream::connect(addr).timeout(self.opts.dial_timeout).await {
            Ok(res) => res,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "link dial timed out")),
        }
    }

    /// Discards the session with the given generation, if it is still current.
    pub async fn reset(&self, generation: u64) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|s| s.generation == generation) {
            warn!(generation, "link reset");
            *current = None;
        }
    }
}

/// Handle to one live link connection.
///
/// Frame reads all happen on the worker; writes can interleave between the
/// worker and a tunnel's uplink pump, so the write side is serialized behind
/// its own lock.
#[derive(Debug, Clone)]
pub struct LinkSession {
    generation: u64,
    reader: Arc<Mutex<FrameReader<OwnedReadHalf>>>,
    writer: Arc<Mutex<FrameWriter<OwnedWriteHalf>>>,
}

impl LinkSession {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub async fn read_frame(&self) -> Result<Frame, LinkError> {
        self.reader.lock().await.read_frame().await
    }

    pub async fn write_frame(&self, frame: &Frame) -> Result<(), LinkError> {
        self.writer.lock().await.write_frame(frame).await
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.min(BACKOFF_MAX_EXP);
    (BACKOFF_BASE * (1 << exp)).min(BACKOFF_CAP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(5), Duration::from_secs(16));
        // 0.5s * 2^6 = 32s, held under the 30s ceiling.
        assert_eq!(backoff_delay(6), Duration::from_secs(30));
        assert_eq!(backoff_delay(40), Duration::from_secs(30));
    }
}
