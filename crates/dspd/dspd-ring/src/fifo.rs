//! Lock-free SPSC byte/frame ring (spec.md §4.1 `RingFifo`).
//!
//! The header lives at a fixed offset inside a shared-memory map
//! (`dspd-shm`) so a device thread and a client process see the same
//! write/read positions without any further negotiation. `RingFifo` only
//! borrows that memory; it never owns the mapping.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::ring::{apply_overrun_policy, pos_to_index, RingConfig};

/// Fixed-size control block placed at the start of a ring's shared-memory
/// section. `#[repr(C)]` so its layout is stable across the process
/// boundary.
#[repr(C)]
pub struct RingHeader {
    write_pos: AtomicU32,
    read_pos: AtomicU32,
    overruns: AtomicU64,
}

impl RingHeader {
    pub const fn new() -> Self {
        RingHeader {
            write_pos: AtomicU32::new(0),
            read_pos: AtomicU32::new(0),
            overruns: AtomicU64::new(0),
        }
    }
}

impl Default for RingHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// A ring FIFO bound to externally-owned storage: a header and a data
/// buffer of `config.capacity` bytes, both outliving this handle.
///
/// Safety of concurrent use follows the SPSC contract (spec.md §4.1):
/// exactly one thread calls `write`/`set_write_ptr`, exactly one calls
/// `read`/`set_read_ptr`; they may be different processes sharing the
/// same mapping.
pub struct RingFifo {
    header: *const RingHeader,
    buf: *mut u8,
    config: RingConfig,
    /// Set only by `new_boxed`; tells `Drop` to reclaim the storage it
    /// allocated. Handles built from shared-memory mappings never own
    /// their backing storage.
    owned: bool,
}

// The raw pointers refer to memory that is either process-owned (boxed,
// see `new_boxed`) or a shared mapping guaranteed to outlive this handle;
// synchronization is via the atomics in `RingHeader`, matching the
// SPSC contract of the real hardware/client relationship.
unsafe impl Send for RingFifo {}
unsafe impl Sync for RingFifo {}

impl RingFifo {
    /// Builds a handle over caller-provided storage.
    ///
    /// # Safety
    /// `header` must point to a valid, initialized `RingHeader` and `buf`
    /// must point to at least `config.capacity` writable bytes; both must
    /// remain valid for the lifetime of the returned `RingFifo`.
    pub unsafe fn from_raw_parts(header: *const RingHeader, buf: *mut u8, config: RingConfig) -> Self {
        RingFifo {
            header,
            buf,
            config,
            owned: false,
        }
    }

    /// Bytes required for the header section of a shared-memory map.
    pub const fn header_size() -> usize {
        std::mem::size_of::<RingHeader>()
    }

    /// Allocates a standalone, process-local ring (used by tests and by
    /// any in-process-only transport that has no shared-memory peer).
    pub fn new_boxed(config: RingConfig) -> Box<RingFifo> {
        let header = Box::into_raw(Box::new(RingHeader::new()));
        let buf = vec![0u8; config.capacity].into_boxed_slice();
        let buf_ptr = Box::into_raw(buf) as *mut u8;
        Box::new(RingFifo {
            header,
            buf: buf_ptr,
            config,
            owned: true,
        })
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: see struct-level invariant.
        unsafe { &*self.header }
    }

    fn copy_in(&self, start: usize, src: &[u8]) {
        let cap = self.config.capacity;
        let first = src.len().min(cap - start);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.buf.add(start), first);
            if first < src.len() {
                std::ptr::copy_nonoverlapping(src[first..].as_ptr(), self.buf, src.len() - first);
            }
        }
    }

    fn copy_out(&self, start: usize, dst: &mut [u8]) {
        let cap = self.config.capacity;
        let first = dst.len().min(cap - start);
        unsafe {
            std::ptr::copy_nonoverlapping(self.buf.add(start), dst.as_mut_ptr(), first);
            if first < dst.len() {
                std::ptr::copy_nonoverlapping(self.buf, dst[first..].as_mut_ptr(), dst.len() - first);
            }
        }
    }

    /// Bytes currently queued for the reader. May only be called with a
    /// recent-enough `write_pos`; callers needing a stable snapshot
    /// should prefer `space`/`len` over racing directly with the peer.
    pub fn len(&self) -> u32 {
        let w = self.header().write_pos.load(Ordering::Acquire);
        let r = self.header().read_pos.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Free bytes available to the writer.
    pub fn space(&self) -> u32 {
        self.config.capacity as u32 - self.len()
    }

    /// Total overrun bytes the reader has ever been fast-forwarded past
    /// (telemetry only).
    pub fn overruns(&self) -> u64 {
        self.header().overruns.load(Ordering::Relaxed)
    }

    /// Writes up to `frames` frames from `src`, returning the number
    /// actually written. Writer-only; never blocks (spec.md §4.1:
    /// "reader never blocks writer and vice versa").
    pub fn write(&self, src: &[u8], frames: usize) -> usize {
        let unit = self.config.unit();
        let max_by_src = src.len() / unit;
        let want = frames.min(max_by_src);
        if want == 0 {
            return 0;
        }
        let avail_frames = (self.space() as usize) / unit;
        let n = want.min(avail_frames);
        if n == 0 {
            return 0;
        }
        let bytes = n * unit;
        let mask = self.config.mask();
        let wpos = self.header().write_pos.load(Ordering::Relaxed);
        let start = pos_to_index(wpos, mask);
        self.copy_in(start, &src[..bytes]);
        self.header()
            .write_pos
            .store(wpos.wrapping_add(bytes as u32), Ordering::Release);
        n
    }

    /// Reads up to `frames` frames into `dst`, returning the number
    /// actually read. Reader-only; applies the overrun policy first if
    /// the writer has lapped this reader (spec.md §4.1 invariant).
    pub fn read(&self, dst: &mut [u8], frames: usize) -> usize {
        let unit = self.config.unit();
        let max_by_dst = dst.len() / unit;
        let want = frames.min(max_by_dst);
        if want == 0 {
            return 0;
        }

        let wpos = self.header().write_pos.load(Ordering::Acquire);
        let mut rpos = self.header().read_pos.load(Ordering::Relaxed);
        let skipped = apply_overrun_policy(wpos, &mut rpos, self.config.capacity as u32);
        if skipped > 0 {
            self.header().overruns.fetch_add(skipped as u64, Ordering::Relaxed);
            self.header().read_pos.store(rpos, Ordering::Release);
        }

        let avail_bytes = wpos.wrapping_sub(rpos) as usize;
        let avail_frames = avail_bytes / unit;
        let n = want.min(avail_frames);
        if n == 0 {
            return 0;
        }
        let bytes = n * unit;
        let mask = self.config.mask();
        let start = pos_to_index(rpos, mask);
        self.copy_out(start, &mut dst[..bytes]);
        self.header()
            .read_pos
            .store(rpos.wrapping_add(bytes as u32), Ordering::Release);
        n
    }

    /// Repositions the read pointer for misalignment recovery. Callable
    /// only by the reader side (spec.md §4.1).
    pub fn set_read_ptr(&self, abs: u32) {
        self.header().read_pos.store(abs, Ordering::Release);
    }

    /// Repositions the write pointer for misalignment recovery. Callable
    /// only by the writer side (spec.md §4.1).
    pub fn set_write_ptr(&self, abs: u32) {
        self.header().write_pos.store(abs, Ordering::Release);
    }
}

impl Drop for RingFifo {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: `owned` is set only in `new_boxed`, which allocated
            // exactly these two boxes with these exact layouts.
            unsafe {
                drop(Box::from_raw(self.header as *mut RingHeader));
                drop(Box::from_raw(std::slice::from_raw_parts_mut(
                    self.buf,
                    self.config.capacity,
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_byte_mode() {
        let ring = RingFifo::new_boxed(RingConfig::new(16, 0));
        let written = ring.write(b"hello", 5);
        assert_eq!(written, 5);
        assert_eq!(ring.len(), 5);
        let mut out = [0u8; 8];
        let read = ring.read(&mut out, 8);
        assert_eq!(read, 5);
        assert_eq!(&out[..5], b"hello");
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn write_wraps_around_buffer() {
        let ring = RingFifo::new_boxed(RingConfig::new(8, 0));
        assert_eq!(ring.write(&[1, 2, 3, 4, 5, 6], 6), 6);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out, 4), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        // write_pos is now at 6, read_pos at 4; write 4 more, wrapping past capacity 8
        assert_eq!(ring.write(&[7, 8, 9, 10], 4), 4);
        let mut out2 = [0u8; 6];
        assert_eq!(ring.read(&mut out2, 6), 6);
        assert_eq!(out2, [5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn frame_mode_rejects_partial_frames() {
        let ring = RingFifo::new_boxed(RingConfig::new(16, 4));
        // 2 frames of 4 bytes fit; a 3-byte tail is dropped from consideration.
        let written = ring.write(&[0u8; 11], 3);
        assert_eq!(written, 2);
        assert_eq!(ring.len(), 8);
    }

    #[test]
    fn write_returns_zero_when_full() {
        let ring = RingFifo::new_boxed(RingConfig::new(4, 0));
        assert_eq!(ring.write(&[1, 2, 3, 4], 4), 4);
        assert_eq!(ring.write(&[5], 1), 0);
    }

    #[test]
    fn reader_is_fast_forwarded_on_overrun() {
        let ring = RingFifo::new_boxed(RingConfig::new(8, 0));
        ring.write(&[1; 8], 8);
        ring.set_write_ptr(20);
        // read_pos still 0: writer has lapped the buffer (20 - 0 = 20 > 8).
        let mut out = [0u8; 8];
        let n = ring.read(&mut out, 8);
        assert_eq!(n, 8);
        assert!(ring.overruns() >= 12);
    }
}
