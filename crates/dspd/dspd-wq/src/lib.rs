//! `dspd-wq`: a pipe-backed work queue carrying variable-size items with
//! callbacks from non-realtime producers to a serial consumer (spec.md
//! §4.8 `Work Queue`).
//!
//! Grounded on `wq.c`/`wq.h`: `dspd_queue_work` writes a
//! `{len, callback, arg}` record to a pipe in one atomic write because
//! `len <= PIPE_BUF`; `dspd_wq_process` reads it back (looping on short
//! reads) and invokes the callback. The Rust record here carries a
//! single pointer to a heap-boxed `WorkItem` rather than a raw C struct,
//! but the contract — one atomic pointer-sized write per item, FIFO
//! delivery, no persistence/retry by the queue itself — is unchanged.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use tracing::warn;

/// One queued unit of work (spec.md §3 `WorkItem`).
pub struct WorkItem {
    pub callback: Box<dyn FnOnce(&[u8]) -> bool + Send>,
    pub payload: Vec<u8>,
}

impl WorkItem {
    pub fn new(payload: Vec<u8>, callback: impl FnOnce(&[u8]) -> bool + Send + 'static) -> Self {
        WorkItem {
            callback: Box::new(callback),
            payload,
        }
    }
}

const RECORD_LEN: usize = std::mem::size_of::<usize>();

/// A pipe-backed queue from any number of producer threads to one
/// serial consumer (spec.md §4.8).
///
/// # Safety model
/// Each [`queue`](Self::queue) call moves a [`WorkItem`] onto the heap
/// and writes its raw pointer through the pipe; [`process`](Self::process)
/// reads the pointer back and reclaims the box. This is sound only
/// within one process/address space, which matches the queue's stated
/// purpose (spec.md §4.8 is an in-process producer/consumer handoff,
/// not a wire protocol).
pub struct WorkQueue {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    nonblocking: bool,
}

impl WorkQueue {
    pub fn new(nonblocking: bool) -> io::Result<Self> {
        let (r, w) = nix::unistd::pipe().map_err(io::Error::from)?;
        if nonblocking {
            set_nonblocking(&r)?;
        }
        Ok(WorkQueue {
            read_fd: r,
            write_fd: w,
            nonblocking,
        })
    }

    pub fn read_fd(&self) -> std::os::fd::RawFd {
        self.read_fd.as_raw_fd()
    }

    /// Enqueues `item` (spec.md §4.8: "the write is atomic" because the
    /// record is pointer-sized, well under `PIPE_BUF`).
    pub fn queue(&self, item: WorkItem) -> bool {
        let boxed = Box::new(item);
        let ptr = Box::into_raw(boxed) as usize;
        let bytes = ptr.to_ne_bytes();
        let mut file = unsafe { fd_as_file(self.write_fd.as_raw_fd()) };
        let result = loop_write(&mut file, &bytes);
        std::mem::forget(file);
        if !result {
            // Reclaim the box so it isn't leaked if the write truly failed.
            unsafe {
                drop(Box::from_raw(ptr as *mut WorkItem));
            }
        }
        result
    }

    /// Reads and runs one item (spec.md §4.8: "short reads looping
    /// until full length obtained"). Returns the callback's result, or
    /// `true` (no-op) if the queue is nonblocking and nothing is ready;
    /// returns `false` if the pipe itself has failed or closed.
    pub fn process(&self) -> bool {
        let mut file = unsafe { fd_as_file(self.read_fd.as_raw_fd()) };
        let mut buf = [0u8; RECORD_LEN];
        let got = loop_read(&mut file, &mut buf, self.nonblocking);
        std::mem::forget(file);
        match got {
            ReadResult::WouldBlock => true,
            ReadResult::Fatal => {
                warn!("work queue pipe closed or errored");
                false
            }
            ReadResult::Ok => {
                let ptr = usize::from_ne_bytes(buf) as *mut WorkItem;
                let item = unsafe { Box::from_raw(ptr) };
                (item.callback)(&item.payload)
            }
        }
    }
}

enum ReadResult {
    Ok,
    WouldBlock,
    Fatal,
}

fn loop_read(file: &mut std::fs::File, buf: &mut [u8], nonblocking: bool) -> ReadResult {
    let mut offset = 0;
    while offset < buf.len() {
        match file.read(&mut buf[offset..]) {
            Ok(0) => return ReadResult::Fatal,
            Ok(n) => offset += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if nonblocking && offset == 0 {
                    return ReadResult::WouldBlock;
                }
                continue;
            }
            Err(_) => return ReadResult::Fatal,
        }
    }
    ReadResult::Ok
}

fn loop_write(file: &mut std::fs::File, buf: &[u8]) -> bool {
    let mut offset = 0;
    while offset < buf.len() {
        match file.write(&buf[offset..]) {
            Ok(0) => return false,
            Ok(n) => offset += n,
            Err(e) if e.kind() == ErrorKind::Interrupted || e.kind() == ErrorKind::WouldBlock => continue,
            Err(_) => return false,
        }
    }
    true
}

/// Borrows a raw fd as a `File` for the duration of one read/write
/// call without taking ownership (the `OwnedFd` on `WorkQueue` keeps it
/// open); caller must `mem::forget` the returned `File`.
unsafe fn fd_as_file(fd: std::os::fd::RawFd) -> std::fs::File {
    unsafe { std::fs::File::from_raw_fd(fd) }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd.as_raw_fd(), FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn queued_item_runs_its_callback_with_payload() {
        let wq = WorkQueue::new(false).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let item = WorkItem::new(vec![1, 2, 3], move |data| {
            ran2.store(true, Ordering::SeqCst);
            data == [1, 2, 3]
        });
        assert!(wq.queue(item));
        assert!(wq.process());
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn callback_false_is_surfaced_as_process_false() {
        let wq = WorkQueue::new(false).unwrap();
        wq.queue(WorkItem::new(Vec::new(), |_| false));
        assert!(!wq.process());
    }

    #[test]
    fn items_are_delivered_fifo() {
        let wq = WorkQueue::new(false).unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5u8 {
            let order = order.clone();
            wq.queue(WorkItem::new(vec![i], move |data| {
                order.lock().unwrap().push(data[0]);
                true
            }));
        }
        for _ in 0..5 {
            assert!(wq.process());
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn nonblocking_process_with_nothing_queued_is_a_harmless_noop() {
        let wq = WorkQueue::new(true).unwrap();
        assert!(wq.process());
    }
}
