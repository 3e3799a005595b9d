use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use n0_error::{Result, e};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, error_span, warn};

use crate::{
    error::LinkError,
    frame::{self, CLOSE_CLIENT_TO_ORIGIN, CLOSE_ORIGIN_TO_CLIENT, Frame, FrameKind},
    parse::Authority,
    ship::{
        ShipCore,
        link::LinkSession,
        queue::{Job, JobEvent, JobKind},
    },
};

/// Runs the single queue consumer.
///
/// Jobs are dispatched strictly in enqueue order and only one is ever in
/// flight on the link. A link failure fails the in-flight job without a
/// requeue, since a partially delivered response cannot be replayed safely,
/// and resets the link for the next job to redial.
pub(super) async fn run(core: Arc<ShipCore>, mut jobs: mpsc::UnboundedReceiver<Job>) -> Result<()> {
    debug!("request worker started");
    while let Some(mut job) = jobs.recv().await {
        if job.cancel.is_cancelled() {
            debug!(job = job.id, "client gone, dropping queued job");
            continue;
        }
        let id = job.id;
        async {
            let session = core.link.ready().await;
            if job.cancel.is_cancelled() {
                // The client left while we waited for the link; nothing has
                // reached the wire yet, so the job can still vanish silently.
                debug!("client gone while waiting for link");
                return;
            }
            debug!(generation = session.generation(), "job active");
            if let Err(err) = dispatch(&session, &mut job).await {
                warn!("job failed: {err:#}");
                job.events.send(JobEvent::Failed(format!("{err:#}"))).await.ok();
                core.link.reset(session.generation()).await;
            }
        }
        .instrument(error_span!("job", id))
        .await;
    }
    Ok(())
}

async fn dispatch(session: &LinkSession, job: &mut Job) -> Result<(), LinkError> {
    match job.kind.clone() {
        JobKind::Http { head, body } => exchange_http(session, job, head, body).await,
        JobKind::Connect { target } => run_tunnel(session, job, target).await,
    }
}

/// Sends one serialized request and streams the response to the listener.
async fn exchange_http(
    session: &LinkSession,
    job: &Job,
    head: Bytes,
    body: Bytes,
) -> Result<(), LinkError> {
    let mut message = BytesMut::with_capacity(head.len() + body.len());
    message.extend_from_slice(&head);
    message.extend_from_slice(&body);
    let mut kind = FrameKind::HttpReq;
    for payload in frame::split_payload(message.freeze()) {
        session.write_frame(&Frame::new(kind, job.id, payload)).await?;
        kind = FrameKind::Data;
    }

    loop {
        let frame = session.read_frame().await?;
        ensure_job(&frame, job.id)?;
        match frame.kind {
            FrameKind::HttpRespChunk => {
                // A gone client is the listener's problem; keep draining so
                // the frame stream stays aligned with the offshore.
                job.events.send(JobEvent::Chunk(frame.payload)).await.ok();
            }
            FrameKind::HttpRespEnd => {
                job.events.send(JobEvent::Done).await.ok();
                return Ok(());
            }
            FrameKind::Error => {
                let reason = String::from_utf8_lossy(&frame.payload).into_owned();
                debug!(%reason, "offshore reported upstream failure");
                job.events.send(JobEvent::Failed(reason)).await.ok();
                return Ok(());
            }
            kind => return Err(unexpected(kind, "http exchange")),
        }
    }
}

/// Opens a tunnel and pumps it until both directions are closed.
///
/// The queue intentionally stalls here: the worker does not return to it
/// until the tunnel is fully torn down.
async fn run_tunnel(
    session: &LinkSession,
    job: &mut Job,
    target: Authority,
) -> Result<(), LinkError> {
    let open = Frame::new(FrameKind::ConnectOpen, job.id, target.to_string().into_bytes());
    session.write_frame(&open).await?;
    let frame = session.read_frame().await?;
    ensure_job(&frame, job.id)?;
    match frame.kind {
        FrameKind::ConnectOk => {}
        FrameKind::ConnectFail => {
            let reason = String::from_utf8_lossy(&frame.payload).into_owned();
            debug!(%target, %reason, "tunnel rejected");
            job.events.send(JobEvent::Rejected(reason)).await.ok();
            return Ok(());
        }
        kind => return Err(unexpected(kind, "connect handshake")),
    }
    job.events.send(JobEvent::Established).await.ok();
    debug!(%target, "tunnel established");

    let uplink_rx = job.uplink.take();
    let mut uplink = tokio::spawn(uplink_pump(session.clone(), job.id, uplink_rx));

    match downlink_loop(session, job).await {
        Ok(()) => {}
        Err(err) => {
            uplink.abort();
            return Err(err);
        }
    }
    // The offshore side is done sending; wait for the client side to finish
    // so CLOSE(1) goes out before the next job's frames.
    match (&mut uplink).await {
        Ok(res) => res?,
        Err(_) => {
            return Err(e!(LinkError::Protocol {
                reason: "tunnel uplink pump died".into(),
            }));
        }
    }
    job.events.send(JobEvent::Done).await.ok();
    Ok(())
}

/// Forwards client bytes into DATA frames; client EOF closes the direction.
async fn uplink_pump(
    session: LinkSession,
    job: u64,
    rx: Option<mpsc::Receiver<Bytes>>,
) -> Result<(), LinkError> {
    if let Some(mut rx) = rx {
        while let Some(bytes) = rx.recv().await {
            session.write_frame(&Frame::new(FrameKind::Data, job, bytes)).await?;
        }
    }
    let close = Frame::new(FrameKind::Close, job, vec![CLOSE_CLIENT_TO_ORIGIN]);
    session.write_frame(&close).await?;
    Ok(())
}

/// Reads tunnel frames until the offshore closes its direction.
async fn downlink_loop(session: &LinkSession, job: &Job) -> Result<(), LinkError> {
    loop {
        let frame = session.read_frame().await?;
        ensure_job(&frame, job.id)?;
        match frame.kind {
            FrameKind::Data => {
                job.events.send(JobEvent::Chunk(frame.payload)).await.ok();
            }
            FrameKind::Close if frame.payload.as_ref() == [CLOSE_ORIGIN_TO_CLIENT].as_slice() => {
                job.events.send(JobEvent::HalfClosed).await.ok();
                return Ok(());
            }
            kind => return Err(unexpected(kind, "tunnel")),
        }
    }
}

fn ensure_job(frame: &Frame, id: u64) -> Result<(), LinkError> {
    if frame.job == id {
        Ok(())
    } else {
        Err(e!(LinkError::Protocol {
            reason: format!("frame for job {} while job {id} is in flight", frame.job),
        }))
    }
}

fn unexpected(kind: FrameKind, stage: &str) -> LinkError {
    e!(LinkError::Protocol {
        reason: format!("unexpected {kind:?} frame during {stage}"),
    })
}
