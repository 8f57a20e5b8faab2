//! Binary layout of a shared-memory map: a small header followed by the
//! ring FIFO section and the mailbox section back to back (spec.md §4.3:
//! "the map carries the FIFO header and MBX header so processes need no
//! further negotiation after attach").

use std::sync::atomic::AtomicU32;

use dspd_mbx::MailboxHeader;
use dspd_ring::RingHeader;

pub const SHM_MAGIC: u64 = 0x4453_5044_5348_4D31; // "DSPDSHM1"
pub const SHM_VERSION: u32 = 1;

/// Which sections a map was built with (spec.md §4.3: "sections are
/// enumerated {MBX, FIFO} (others possible)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Fifo,
    Mbx,
}

/// Fixed header placed at offset 0 of every map. Padded to 64 bytes so it
/// never shares a cache line with the ring header that follows it.
#[repr(C)]
pub struct ShmMapHeader {
    pub magic: u64,
    pub version: u32,
    pub ring_capacity: u32,
    pub ring_frame_size: u32,
    pub mbx_elem_size: u32,
    pub refcount: AtomicU32,
    _pad: [u8; 64 - 8 - 4 - 4 - 4 - 4 - 4],
}

impl ShmMapHeader {
    pub fn new(ring_capacity: u32, ring_frame_size: u32, mbx_elem_size: u32) -> Self {
        ShmMapHeader {
            magic: SHM_MAGIC,
            version: SHM_VERSION,
            ring_capacity,
            ring_frame_size,
            mbx_elem_size,
            refcount: AtomicU32::new(1),
            _pad: [0; 64 - 8 - 4 - 4 - 4 - 4 - 4],
        }
    }

    pub fn validate(&self, expected_elem_size: u32) -> Result<(), &'static str> {
        if self.magic != SHM_MAGIC {
            return Err("bad shm magic");
        }
        if self.version != SHM_VERSION {
            return Err("shm version mismatch");
        }
        if self.mbx_elem_size != expected_elem_size {
            return Err("mailbox element size mismatch");
        }
        Ok(())
    }
}

pub const HEADER_SIZE: usize = std::mem::size_of::<ShmMapHeader>();

/// Total byte size of a map holding a ring of `ring_capacity` bytes and a
/// mailbox of `T`.
pub fn total_size<T: Copy>(ring_capacity: usize) -> usize {
    HEADER_SIZE
        + std::mem::size_of::<RingHeader>()
        + ring_capacity
        + std::mem::size_of::<MailboxHeader>()
        + std::mem::size_of::<[std::mem::MaybeUninit<T>; 3]>()
}

pub fn ring_header_offset() -> usize {
    HEADER_SIZE
}

pub fn ring_data_offset() -> usize {
    HEADER_SIZE + std::mem::size_of::<RingHeader>()
}

pub fn mbx_header_offset(ring_capacity: usize) -> usize {
    ring_data_offset() + ring_capacity
}

pub fn mbx_slots_offset(ring_capacity: usize) -> usize {
    mbx_header_offset(ring_capacity) + std::mem::size_of::<MailboxHeader>()
}
