use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::parse::Authority;

/// What the worker reports back to the listener over a job's event channel.
///
/// Events for one job arrive in causal order and end with `Done` or `Failed`;
/// nothing follows either.
#[derive(Debug)]
pub(super) enum JobEvent {
    /// Response bytes (HTTP) or tunnel downlink bytes (CONNECT).
    Chunk(Bytes),
    /// The offshore accepted the CONNECT; the tunnel is live.
    Established,
    /// The offshore rejected the CONNECT, with its reason.
    Rejected(String),
    /// The offshore→client direction of the tunnel ended cleanly.
    HalfClosed,
    /// The job failed; surfaced as a 502 when nothing was sent yet.
    Failed(String),
    /// The job completed.
    Done,
}

/// One client proxy request from acceptance through completion.
///
/// Created by the listener, owned by the queue until the worker dequeues it.
/// The listener keeps the client socket for the whole job; bytes move over
/// the `events` channel (worker→listener) and, for tunnels, the bounded
/// `uplink` channel (listener→worker).
#[derive(derive_more::Debug)]
pub(super) struct Job {
    pub id: u64,
    pub kind: JobKind,
    /// Cancelled when the client disconnects; a still-queued job is skipped.
    #[debug(skip)]
    pub cancel: CancellationToken,
    #[debug(skip)]
    pub events: mpsc::Sender<JobEvent>,
    #[debug(skip)]
    pub uplink: Option<mpsc::Receiver<Bytes>>,
}

#[derive(Clone, derive_more::Debug)]
pub(super) enum JobKind {
    /// Serialized absolute-form HTTP request: head and buffered body.
    Http {
        #[debug(skip)]
        head: Bytes,
        #[debug(skip)]
        body: Bytes,
    },
    /// `CONNECT` to the given authority.
    Connect { target: Authority },
}
