//! Offshore peer listener: the server side of the link.

mod dispatch;

use std::{sync::Arc, time::Duration};

use n0_error::{Result, StdResultExt, e};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{Mutex, Semaphore},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error_span, info, warn};

use crate::{
    error::LinkError,
    frame::{FrameKind, FrameReader, FrameWriter},
};

/// Grace before a superfluous link connection is dropped.
const REJECT_GRACE: Duration = Duration::from_millis(250);

/// Accepts link connections from the ship and serves their frames.
///
/// One link is live at a time; the ship is expected to maintain a single
/// connection. If another shows up while one is live, the existing link is
/// kept and the newcomer is closed after a short grace.
#[derive(Debug, Clone)]
pub struct OffshoreProxy {
    active: Arc<Semaphore>,
}

impl Default for OffshoreProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl OffshoreProxy {
    pub fn new() -> Self {
        Self {
            active: Arc::new(Semaphore::new(1)),
        }
    }

    /// Serves the link port until the listener fails.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();
        let mut id = 0u64;
        loop {
            let (stream, addr) = listener.accept().await.std_context("link listener failed")?;
            match self.active.clone().try_acquire_owned() {
                Ok(permit) => {
                    tokio::spawn(
                        cancel
                            .child_token()
                            .run_until_cancelled_owned(async move {
                                info!(%addr, "link established");
                                match serve_link(stream).await {
                                    Ok(()) => info!("link closed"),
                                    Err(err) => warn!("link dropped: {err:#}"),
                                }
                                drop(permit);
                            })
                            .instrument(error_span!("link", id)),
                    );
                }
                Err(_) => {
                    debug!(%addr, "link connection while one is live, rejecting");
                    tokio::spawn(async move {
                        tokio::time::sleep(REJECT_GRACE).await;
                        drop(stream);
                    });
                }
            }
            id += 1;
        }
    }
}

/// Serves frames from one link connection, one job at a time, until the ship
/// disconnects or violates the protocol.
async fn serve_link(stream: TcpStream) -> Result<(), LinkError> {
    let (read, write) = stream.into_split();
    let mut reader = FrameReader::new(read);
    let writer = Arc::new(Mutex::new(FrameWriter::new(write)));
    loop {
        let frame = match reader.read_frame().await {
            Ok(frame) => frame,
            // The ship reconnects at will; a dead link between jobs is routine.
            Err(LinkError::Lost { .. }) => return Ok(()),
            Err(err) => return Err(err),
        };
        match frame.kind {
            FrameKind::HttpReq => dispatch::http(frame, &mut reader, &writer).await?,
            FrameKind::ConnectOpen => dispatch::tunnel(frame, &mut reader, &writer).await?,
            kind => {
                return Err(e!(LinkError::Protocol {
                    reason: format!("unexpected {kind:?} frame while idle"),
                }));
            }
        }
    }
}
