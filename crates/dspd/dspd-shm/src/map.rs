//! Named shared-memory region binding a ring FIFO and a mailbox so a
//! client process and the device thread see the same storage after a
//! single `attach` (spec.md §4.3 `Shared Memory Map`).

use std::marker::PhantomData;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::Ordering;

use memmap2::MmapMut;
use nix::fcntl::{fcntl, FcntlArg, SealFlag};
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use thiserror::Error;

use dspd_mbx::Mailbox;
use dspd_ring::{RingConfig, RingFifo};

use crate::layout::{
    mbx_header_offset, mbx_slots_offset, ring_data_offset, ring_header_offset, total_size,
    ShmMapHeader,
};

#[derive(Debug, Error)]
pub enum ShmError {
    #[error("shm syscall failed: {0}")]
    Nix(#[from] nix::Error),
    #[error("shm io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid shared-memory map: {0}")]
    Invalid(&'static str),
}

/// A shared-memory map carrying exactly one ring FIFO and one mailbox of
/// `T` (spec.md §4.3 lifecycle: "refcounted; last holder truncates/
/// unlinks").
pub struct ShmMap<T: Copy> {
    mmap: MmapMut,
    ring: RingFifo,
    mbx: Mailbox<T>,
    /// Set for every holder that attached by name (`create` or
    /// `attach_named`) rather than by bare fd, so that whichever one of
    /// them happens to be the holder whose drop takes the refcount to
    /// zero can still `shm_unlink` (spec.md §4.3: "refcounted; last
    /// holder truncates/unlinks" — not "last *creator*").
    owner_name: Option<String>,
    _pd: PhantomData<T>,
}

unsafe impl<T: Copy> Send for ShmMap<T> {}
unsafe impl<T: Copy> Sync for ShmMap<T> {}

impl<T: Copy> ShmMap<T> {
    /// Creates a new named map sized for `ring_capacity` bytes of FIFO
    /// storage (spec.md §4.3: "create(name, sections[])"; this crate
    /// always provisions both defined sections, FIFO and MBX, since no
    /// component needs one without the other).
    pub fn create(name: &str, ring_capacity: usize, ring_frame_size: usize) -> Result<Self, ShmError> {
        let size = total_size::<T>(ring_capacity) as u64;
        let shm_name = shm_path(name);
        let fd = shm_open(
            shm_name.as_str(),
            nix::fcntl::OFlag::O_CREAT | nix::fcntl::OFlag::O_EXCL | nix::fcntl::OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        ftruncate(&fd, size as i64)?;
        let map = Self::from_fd(fd, ring_capacity, ring_frame_size, true)?;
        Ok(ShmMap {
            owner_name: Some(shm_name),
            ..map
        })
    }

    /// Creates an anonymous (unnamed) map backed by `memfd_create`, for
    /// handing the fd to a peer via `SCM_RIGHTS` rather than by name.
    pub fn create_anonymous(
        debug_name: &str,
        ring_capacity: usize,
        ring_frame_size: usize,
    ) -> Result<(Self, OwnedFd), ShmError> {
        let size = total_size::<T>(ring_capacity) as u64;
        let name = std::ffi::CString::new(debug_name).map_err(|_| ShmError::Invalid("nul in debug name"))?;
        let fd = memfd_create(&name, MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING)?;
        ftruncate(&fd, size as i64)?;
        let seals = SealFlag::F_SEAL_GROW | SealFlag::F_SEAL_SHRINK;
        fcntl(fd.as_raw_fd(), FcntlArg::F_ADD_SEALS(seals))?;
        let dup = fd.try_clone()?;
        let map = Self::from_fd(fd, ring_capacity, ring_frame_size, true)?;
        Ok((map, dup))
    }

    /// Attaches to an existing named map (spec.md §4.3: "attach(fd_or_name)").
    pub fn attach_named(name: &str, ring_capacity: usize, ring_frame_size: usize) -> Result<Self, ShmError> {
        let shm_name = shm_path(name);
        let fd = shm_open(shm_name.as_str(), nix::fcntl::OFlag::O_RDWR, Mode::empty())?;
        let map = Self::from_fd(fd, ring_capacity, ring_frame_size, false)?;
        Ok(ShmMap {
            owner_name: Some(shm_name),
            ..map
        })
    }

    /// Attaches using a file descriptor received from a peer (e.g. over
    /// `SCM_RIGHTS`); the caller is never the owning name-holder.
    pub fn attach_fd(fd: OwnedFd, ring_capacity: usize, ring_frame_size: usize) -> Result<Self, ShmError> {
        Self::from_fd(fd, ring_capacity, ring_frame_size, false)
    }

    fn from_fd(fd: OwnedFd, ring_capacity: usize, ring_frame_size: usize, creating: bool) -> Result<Self, ShmError> {
        let file = std::fs::File::from(fd);
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        // `file` drops here; the mapping itself keeps the pages alive.

        let base = mmap.as_mut_ptr();
        let header_ptr = base as *mut ShmMapHeader;
        if creating {
            unsafe {
                header_ptr.write(ShmMapHeader::new(
                    ring_capacity as u32,
                    ring_frame_size as u32,
                    std::mem::size_of::<T>() as u32,
                ));
            }
        } else {
            let header = unsafe { &*header_ptr };
            header
                .validate(std::mem::size_of::<T>() as u32)
                .map_err(ShmError::Invalid)?;
            header.refcount.fetch_add(1, Ordering::AcqRel);
        }

        let ring_header = unsafe { base.add(ring_header_offset()) as *const dspd_ring::RingHeader };
        let ring_data = unsafe { base.add(ring_data_offset()) };
        if creating {
            unsafe { ring_header.cast_mut().write(dspd_ring::RingHeader::new()) };
        }
        let ring = unsafe {
            RingFifo::from_raw_parts(ring_header, ring_data, RingConfig::new(ring_capacity, ring_frame_size))
        };

        let mbx_header =
            unsafe { base.add(mbx_header_offset(ring_capacity)) as *const dspd_mbx::MailboxHeader };
        if creating {
            unsafe { mbx_header.cast_mut().write(dspd_mbx::MailboxHeader::new()) };
        }
        let mbx_slots = unsafe {
            base.add(mbx_slots_offset(ring_capacity))
                as *const [std::cell::UnsafeCell<std::mem::MaybeUninit<T>>; 3]
        };
        let mbx = unsafe { Mailbox::from_raw_parts(mbx_header, mbx_slots) };

        Ok(ShmMap {
            mmap,
            ring,
            mbx,
            owner_name: None,
            _pd: PhantomData,
        })
    }

    pub fn ring(&self) -> &RingFifo {
        &self.ring
    }

    pub fn mailbox(&self) -> &Mailbox<T> {
        &self.mbx
    }

    fn header(&self) -> &ShmMapHeader {
        unsafe { &*(self.mmap.as_ptr() as *const ShmMapHeader) }
    }
}

impl<T: Copy> Drop for ShmMap<T> {
    fn drop(&mut self) {
        let remaining = self.header().refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 {
            if let Some(name) = &self.owner_name {
                let _ = shm_unlink(name.as_str());
            }
        }
    }
}

fn shm_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    }
}
