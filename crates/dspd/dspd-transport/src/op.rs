//! Outstanding request state (spec.md §3 `AioContext`/`AsyncOp`, §4.5.4
//! cancellation, §4.5.6 completion).

use std::os::fd::OwnedFd;

use dspd_common::ReqFlags;

/// Per-op lifecycle state (spec.md §3: "per-op state in `{EINPROGRESS,
/// EBUSY (partial sent), ENODATA (sent), ECANCELED, terminal <= 0}`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    /// Submitted, not yet touched the wire.
    InProgress,
    /// Header or payload partially written; no longer cancellable.
    Busy,
    /// Fully sent, awaiting a reply.
    NoData,
    Canceled,
    /// Completed with the given negative errno (0 for success).
    Done(i32),
}

impl OpState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OpState::Done(_) | OpState::Canceled)
    }

    pub fn error(self) -> Option<i32> {
        match self {
            OpState::Done(e) => Some(e),
            OpState::Canceled => Some(-(libc::ECANCELED)),
            _ => None,
        }
    }
}

/// A single outstanding request/reply exchange (spec.md §3 `AsyncOp`).
pub struct AsyncOp {
    pub stream_id: i32,
    pub request_code: u32,
    pub inbuf: Vec<u8>,
    pub outbuf: Vec<u8>,
    pub user_tag: u32,
    pub generation: u16,
    pub state: OpState,
    /// Wire flags this op was submitted with. `NONBLOCK` opts this one
    /// op out of an otherwise-blocking `process()` poll (spec.md §9
    /// Open Question D.2), independent of the transport's own mode.
    pub flags: ReqFlags,
    pub transferred_bytes: usize,
    /// A file descriptor the peer passed alongside this reply (spec.md
    /// §4.6.1: "the client receives a file descriptor for the ring+mbx
    /// region via the transport's fd ancillary channel"). Only ever set
    /// for local/socket transports that carried `CMSG_FD`.
    pub received_fd: Option<OwnedFd>,
    /// Invoked exactly once, when `state` becomes terminal.
    pub completion: Option<Box<dyn FnOnce(&mut AsyncOp) + Send>>,
}

impl AsyncOp {
    pub fn new(stream_id: i32, request_code: u32, inbuf: Vec<u8>, outbuf_capacity: usize, user_tag: u32) -> Self {
        AsyncOp {
            stream_id,
            request_code,
            inbuf,
            outbuf: Vec::with_capacity(outbuf_capacity),
            user_tag,
            generation: 0,
            state: OpState::InProgress,
            flags: ReqFlags::empty(),
            transferred_bytes: 0,
            received_fd: None,
            completion: None,
        }
    }

    /// Tags this op with wire flags (e.g. `NONBLOCK`) before submission.
    pub fn with_flags(mut self, flags: ReqFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Completes the op exactly once, invoking its callback if it has
    /// not already completed (spec.md §4.5.6: "the completion callback
    /// is invoked exactly once").
    pub fn complete(&mut self, err: i32) {
        if self.state.is_terminal() {
            return;
        }
        self.state = OpState::Done(err);
        if let Some(cb) = self.completion.take() {
            cb(self);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn complete_invokes_callback_exactly_once() {
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let mut op = AsyncOp::new(0, 1, Vec::new(), 0, 0);
        op.completion = Some(Box::new(move |op| {
            assert!(!called2.swap(true, Ordering::SeqCst));
            assert_eq!(op.state, OpState::Done(0));
        }));
        op.complete(0);
        op.complete(-5); // second call is a no-op; state stays Done(0)
        assert_eq!(op.state, OpState::Done(0));
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn canceled_state_is_terminal_with_ecanceled() {
        let op_state = OpState::Canceled;
        assert!(op_state.is_terminal());
        assert_eq!(op_state.error(), Some(-(libc::ECANCELED)));
    }
}
