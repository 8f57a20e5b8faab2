//! Triple-buffered mailbox (spec.md §4.2 `Mailbox`).
//!
//! Distinct from a seqlock: the writer is never blocked and never spins,
//! because it always has at least one slot free to write into that no
//! reader can be touching. Readers never observe a torn snapshot.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};

/// Marks that no reader currently holds a slot.
const NONE_READING: u8 = 3;

/// Shared control state for a mailbox: which slot is "latest" (plus a
/// generation counter so a stale snapshot of `latest` is never mistaken
/// for a fresher one), and which slot (if any) a reader is currently
/// copying out of.
#[repr(C)]
pub struct MailboxHeader {
    /// Bits 0-1: index of the most recently published slot (0..=2).
    /// Bits 2-31: generation, incremented on every publish.
    latest: AtomicU32,
    /// Index of the slot a reader is currently reading, or `NONE_READING`.
    reading: AtomicU8,
}

impl MailboxHeader {
    pub const fn new() -> Self {
        MailboxHeader {
            latest: AtomicU32::new(0),
            reading: AtomicU8::new(NONE_READING),
        }
    }
}

impl Default for MailboxHeader {
    fn default() -> Self {
        Self::new()
    }
}

fn pack(idx: u8, generation: u32) -> u32 {
    (idx as u32) | (generation << 2)
}

fn unpack(latest: u32) -> (u8, u32) {
    ((latest & 0x3) as u8, latest >> 2)
}

/// A mailbox bound to externally-owned storage: a header plus three
/// slots of `T`, all outliving this handle. Like [`dspd_ring::RingFifo`]
/// it borrows rather than owns its storage so it can live inside a
/// shared-memory map.
pub struct Mailbox<T: Copy> {
    header: *const MailboxHeader,
    slots: *const [UnsafeCell<MaybeUninit<T>>; 3],
    owned: bool,
}

unsafe impl<T: Copy> Send for Mailbox<T> {}
unsafe impl<T: Copy> Sync for Mailbox<T> {}

impl<T: Copy> Mailbox<T> {
    /// # Safety
    /// `header` and `slots` must point to valid, appropriately sized and
    /// aligned storage that outlives the returned `Mailbox`. `header`
    /// must already be initialized (e.g. via [`MailboxHeader::new`]).
    pub unsafe fn from_raw_parts(
        header: *const MailboxHeader,
        slots: *const [UnsafeCell<MaybeUninit<T>>; 3],
    ) -> Self {
        Mailbox {
            header,
            slots,
            owned: false,
        }
    }

    pub const fn slots_size() -> usize {
        std::mem::size_of::<[MaybeUninit<T>; 3]>()
    }

    /// Allocates standalone, process-local storage (tests, and any
    /// in-process transport with no shared-memory peer).
    pub fn new_boxed() -> Box<Mailbox<T>> {
        let header = Box::into_raw(Box::new(MailboxHeader::new()));
        let slots: Box<[UnsafeCell<MaybeUninit<T>>; 3]> = Box::new([
            UnsafeCell::new(MaybeUninit::uninit()),
            UnsafeCell::new(MaybeUninit::uninit()),
            UnsafeCell::new(MaybeUninit::uninit()),
        ]);
        Box::new(Mailbox {
            header,
            slots: Box::into_raw(slots),
            owned: true,
        })
    }

    fn header(&self) -> &MailboxHeader {
        unsafe { &*self.header }
    }

    fn slot_ptr(&self, idx: u8) -> *mut T {
        unsafe { (*self.slots)[idx as usize].get() as *mut T }
    }

    /// Publishes a new snapshot. Single-writer only; never blocks
    /// (spec.md §4.2: "a writer is never blocked").
    pub fn write(&self, value: T) {
        let (latest_idx, generation) = unpack(self.header().latest.load(Ordering::Relaxed));
        let reading_idx = self.header().reading.load(Ordering::Acquire);
        let write_idx = (0u8..3)
            .find(|&i| i != latest_idx && i != reading_idx)
            .expect("three slots minus two exclusions always leaves one");
        // SAFETY: write_idx is neither the published slot nor the slot a
        // reader may be touching, so this write cannot race a reader.
        unsafe { self.slot_ptr(write_idx).write(value) };
        self.header()
            .latest
            .store(pack(write_idx, generation.wrapping_add(1)), Ordering::Release);
    }

    /// Returns the most recently published snapshot without blocking the
    /// writer (spec.md §4.2: "readers obtain the most recently published
    /// snapshot without blocking the writer").
    pub fn read(&self) -> T {
        let (idx, _) = unpack(self.header().latest.load(Ordering::Acquire));
        self.header().reading.store(idx, Ordering::Release);
        // SAFETY: the writer never picks `idx` as its target slot while
        // `reading` holds it, so this read cannot race a write.
        let value = unsafe { self.slot_ptr(idx).read() };
        self.header().reading.store(NONE_READING, Ordering::Release);
        value
    }
}

impl<T: Copy> Drop for Mailbox<T> {
    fn drop(&mut self) {
        if self.owned {
            // SAFETY: `owned` is set only in `new_boxed`, which allocated
            // exactly these two boxes with these exact layouts.
            unsafe {
                drop(Box::from_raw(self.header as *mut MailboxHeader));
                drop(Box::from_raw(
                    self.slots as *mut [UnsafeCell<MaybeUninit<T>>; 3],
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Status {
        hw_ptr: u64,
        appl_ptr: u64,
    }

    #[test]
    fn reader_sees_latest_published_value() {
        let mbx = Mailbox::<Status>::new_boxed();
        mbx.write(Status {
            hw_ptr: 1,
            appl_ptr: 0,
        });
        mbx.write(Status {
            hw_ptr: 2,
            appl_ptr: 1,
        });
        let snap = mbx.read();
        assert_eq!(
            snap,
            Status {
                hw_ptr: 2,
                appl_ptr: 1
            }
        );
    }

    #[test]
    fn many_writes_never_reuse_slot_under_read() {
        let mbx = Mailbox::<u64>::new_boxed();
        mbx.write(0);
        for i in 1..100u64 {
            mbx.write(i);
            assert_eq!(mbx.read(), i);
        }
    }

    #[test]
    fn write_succeeds_while_a_read_is_logically_in_progress() {
        // Simulates a reader having pinned a slot via `reading` by writing
        // repeatedly in between; the writer must still make progress.
        let mbx = Mailbox::<u64>::new_boxed();
        mbx.write(1);
        let (idx, _) = unpack(mbx.header().latest.load(Ordering::Acquire));
        mbx.header().reading.store(idx, Ordering::Release);
        mbx.write(2);
        mbx.write(3);
        mbx.header().reading.store(NONE_READING, Ordering::Release);
        assert_eq!(mbx.read(), 3);
    }
}
