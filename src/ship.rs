//! Ship-side proxy: the client listener, the request queue and its single
//! worker, and the link manager that owns the offshore connection.

mod link;
mod listener;
mod queue;
mod worker;

pub use link::{LinkManager, LinkOpts};

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use n0_error::{Result, StackResultExt};
use tokio::{net::TcpListener, sync::mpsc};

use queue::Job;

/// Ship-side state shared by the listener, worker, and link manager.
///
/// Owned by the process entry point and passed explicitly to the tasks that
/// need it.
#[derive(derive_more::Debug)]
pub struct ShipCore {
    link: LinkManager,
    #[debug(skip)]
    jobs: mpsc::UnboundedSender<Job>,
    #[debug(skip)]
    jobs_rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    next_job_id: AtomicU64,
}

impl ShipCore {
    pub fn new(link: LinkOpts) -> Arc<Self> {
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            link: LinkManager::new(link),
            jobs,
            jobs_rx: Mutex::new(Some(jobs_rx)),
            next_job_id: AtomicU64::new(1),
        })
    }

    /// Serves proxy clients from `listener`.
    ///
    /// Client connections are accepted concurrently, but their requests reach
    /// the link strictly one at a time, in enqueue order. Runs until the
    /// listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let jobs_rx = self
            .jobs_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .context("ship worker is already running")?;
        tokio::select! {
            res = worker::run(self.clone(), jobs_rx) => res,
            res = listener::accept_loop(self.clone(), listener) => res,
        }
    }

    fn next_job_id(&self) -> u64 {
        self.next_job_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Non-blocking enqueue; the queue is unbounded by design.
    fn enqueue(&self, job: Job) -> Result<(), Job> {
        self.jobs.send(job).map_err(|err| err.0)
    }
}
