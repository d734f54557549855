use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::ClientError;
use crate::frame::Frame;

/// One in-flight command: the pre-encoded frame plus a one-shot completion
/// slot.
///
/// The frame is materialized before submission so the connection's hot path
/// does no serialization work. A request is enqueued at most once and
/// completed exactly once; completing after the caller dropped its receiver
/// is a no-op.
pub struct Request {
    pub(crate) command: &'static str,
    pub(crate) idempotent: bool,
    pub(crate) frame: Bytes,
    completion: oneshot::Sender<Result<Frame, ClientError>>,
}

/// The caller's side of the completion slot.
pub type Completion = oneshot::Receiver<Result<Frame, ClientError>>;

impl Request {
    pub(crate) fn new(command: &'static str, idempotent: bool, frame: Bytes) -> (Self, Completion) {
        let (tx, rx) = oneshot::channel();
        let request = Request {
            command,
            idempotent,
            frame,
            completion: tx,
        };
        (request, rx)
    }

    /// A request whose result nobody awaits, e.g. the aggregate resubscribe
    /// issued internally after a reconnect.
    pub(crate) fn internal(command: &'static str, frame: Bytes) -> Self {
        let (request, _completion) = Self::new(command, false, frame);
        request
    }

    pub(crate) fn complete(self, result: Result<Frame, ClientError>) {
        // The receiver may be gone if the caller timed out or dropped the
        // future; the reply is simply discarded.
        let _ = self.completion.send(result);
    }
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("command", &self.command)
            .field("idempotent", &self.idempotent)
            .field("frame_len", &self.frame.len())
            .finish()
    }
}
