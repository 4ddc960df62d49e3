//! Transport abstraction between workers and the owning process

use super::{decode_frame, encode_frame, ClusterReply, ClusterRequest};
use crate::error::{CacheError, Result};
use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

/// Owner side of a worker connection
pub trait CoordinatorChannel: Send {
    /// Wait up to `timeout` for the next request
    ///
    /// Returns `Ok(None)` on timeout and `CacheError::Cluster` once the
    /// worker side has gone away. Other errors concern a single message.
    fn recv_request(&mut self, timeout: Duration) -> Result<Option<ClusterRequest>>;

    fn send_reply(&mut self, reply: &ClusterReply) -> Result<()>;
}

/// Worker side of a connection to the owning process
pub trait WorkerChannel: Send {
    fn send_request(&mut self, request: &ClusterRequest) -> Result<()>;

    /// Wait up to `timeout` for the next reply; `Ok(None)` on timeout
    fn recv_reply(&mut self, timeout: Duration) -> Result<Option<ClusterReply>>;
}

pub struct LocalCoordinatorChannel {
    requests: Receiver<Vec<u8>>,
    replies: Sender<Vec<u8>>,
}

pub struct LocalWorkerChannel {
    requests: Sender<Vec<u8>>,
    replies: Receiver<Vec<u8>>,
}

/// In-process channel pair carrying encoded frames
pub fn local_channel() -> (LocalWorkerChannel, LocalCoordinatorChannel) {
    let (request_tx, request_rx) = unbounded();
    let (reply_tx, reply_rx) = unbounded();

    (
        LocalWorkerChannel {
            requests: request_tx,
            replies: reply_rx,
        },
        LocalCoordinatorChannel {
            requests: request_rx,
            replies: reply_tx,
        },
    )
}

fn recv_frame(receiver: &Receiver<Vec<u8>>, timeout: Duration) -> Result<Option<Vec<u8>>> {
    match receiver.recv_timeout(timeout) {
        Ok(frame) => Ok(Some(frame)),
        Err(RecvTimeoutError::Timeout) => Ok(None),
        Err(RecvTimeoutError::Disconnected) => {
            Err(CacheError::Cluster("peer disconnected".to_string()))
        }
    }
}

impl CoordinatorChannel for LocalCoordinatorChannel {
    fn recv_request(&mut self, timeout: Duration) -> Result<Option<ClusterRequest>> {
        match recv_frame(&self.requests, timeout)? {
            Some(frame) => Ok(Some(decode_frame(&frame)?)),
            None => Ok(None),
        }
    }

    fn send_reply(&mut self, reply: &ClusterReply) -> Result<()> {
        self.replies
            .send(encode_frame(reply)?)
            .map_err(|_| CacheError::Cluster("worker disconnected".to_string()))
    }
}

impl WorkerChannel for LocalWorkerChannel {
    fn send_request(&mut self, request: &ClusterRequest) -> Result<()> {
        self.requests
            .send(encode_frame(request)?)
            .map_err(|_| CacheError::Cluster("coordinator disconnected".to_string()))
    }

    fn recv_reply(&mut self, timeout: Duration) -> Result<Option<ClusterReply>> {
        match recv_frame(&self.replies, timeout)? {
            Some(frame) => Ok(Some(decode_frame(&frame)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterOp, ClusterPayload};
    use crate::key::{ContentHash, FileKey, FileType, Guid};

    #[test]
    fn test_local_round_trip() {
        let (mut worker, mut coordinator) = local_channel();
        let request = ClusterRequest {
            id: 3,
            op: ClusterOp::FileInfo {
                key: FileKey::new(FileType::Info, Guid::from_bytes([1]), ContentHash::from_bytes([2])),
            },
        };

        worker.send_request(&request).unwrap();
        let received = coordinator
            .recv_request(Duration::from_millis(100))
            .unwrap()
            .unwrap();
        assert_eq!(received, request);

        coordinator
            .send_reply(&ClusterReply {
                id: 3,
                result: Ok(ClusterPayload::Committed),
            })
            .unwrap();
        let reply = worker.recv_reply(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(reply.id, 3);
    }

    #[test]
    fn test_timeout_and_disconnect() {
        let (worker, mut coordinator) = local_channel();
        assert!(coordinator
            .recv_request(Duration::from_millis(10))
            .unwrap()
            .is_none());

        drop(worker);
        assert!(matches!(
            coordinator.recv_request(Duration::from_millis(10)),
            Err(CacheError::Cluster(_))
        ));
    }
}
