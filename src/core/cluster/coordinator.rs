//! Owner-side request loop

use super::{ClusterOp, ClusterPayload, ClusterReply, CoordinatorChannel, RemoteError};
use crate::error::{CacheError, Result};
use crossbeam::channel::bounded;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// How often a serving thread checks its stop flag
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A serving thread could not be started; the channel is handed back
pub(crate) struct SpawnError {
    pub error: io::Error,
    pub channel: Box<dyn CoordinatorChannel>,
}

impl fmt::Debug for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnError")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Serve one worker channel on a dedicated thread until `stop` is set or the
/// worker disconnects
pub(crate) fn spawn_server<H>(
    channel: Box<dyn CoordinatorChannel>,
    stop: Arc<AtomicBool>,
    handler: H,
) -> std::result::Result<JoinHandle<()>, SpawnError>
where
    H: Fn(ClusterOp) -> Result<ClusterPayload> + Send + 'static,
{
    static NEXT_WORKER: AtomicUsize = AtomicUsize::new(0);
    let worker = NEXT_WORKER.fetch_add(1, Ordering::Relaxed);

    // The channel only moves to the thread once it is running
    let (handoff, arrival) = bounded::<Box<dyn CoordinatorChannel>>(1);
    let spawned = thread::Builder::new()
        .name(format!("cache-cluster-{}", worker))
        .spawn(move || {
            if let Ok(mut channel) = arrival.recv() {
                serve(channel.as_mut(), &stop, handler);
            }
        });

    match spawned {
        Ok(handle) => match handoff.send(channel) {
            Ok(()) => Ok(handle),
            Err(unsent) => Err(SpawnError {
                error: io::Error::other("serving thread exited before start"),
                channel: unsent.into_inner(),
            }),
        },
        Err(error) => Err(SpawnError { error, channel }),
    }
}

/// Answer every queued request with a cluster error, then close the channel
pub(crate) fn reject(mut channel: Box<dyn CoordinatorChannel>, reason: &str) {
    let error = RemoteError::from_error(&CacheError::Cluster(reason.to_string()));
    loop {
        match channel.recv_request(Duration::ZERO) {
            Ok(Some(request)) => {
                let reply = ClusterReply {
                    id: request.id,
                    result: Err(error.clone()),
                };
                if channel.send_reply(&reply).is_err() {
                    break;
                }
            }
            Ok(None) | Err(CacheError::Cluster(_)) => break,
            Err(e) => tracing::warn!("Dropping unreadable cluster request: {}", e),
        }
    }
    tracing::warn!("Rejected cluster worker: {}", reason);
}

fn serve<H>(channel: &mut dyn CoordinatorChannel, stop: &AtomicBool, handler: H)
where
    H: Fn(ClusterOp) -> Result<ClusterPayload>,
{
    while !stop.load(Ordering::Acquire) {
        let request = match channel.recv_request(POLL_INTERVAL) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(CacheError::Cluster(reason)) => {
                tracing::debug!("Cluster worker channel closed: {}", reason);
                return;
            }
            Err(e) => {
                tracing::warn!("Dropping unreadable cluster request: {}", e);
                continue;
            }
        };

        tracing::debug!("Serving cluster {} request {}", request.op.name(), request.id);

        let result = handler(request.op).map_err(|e| RemoteError::from_error(&e));
        let reply = ClusterReply {
            id: request.id,
            result,
        };

        if let Err(e) = channel.send_reply(&reply) {
            tracing::warn!("Cannot reply to cluster worker: {}", e);
            return;
        }
    }
}
