//! POSIX errno-compatible error codes shared by every wire-facing crate.
//!
//! The wire protocol and the PCM/mixer APIs all return `-errno` integers
//! (spec §7). `Errno` gives that convention a typed, matchable surface
//! without allocating: it is `Copy`, fits in a byte, and converts to/from
//! the `i32` that actually crosses the wire.

use std::fmt;

/// One of the errno values this crate's protocol can produce.
///
/// Grouped the way spec.md §7 groups them (Transient/Protocol/Stale/
/// Lifecycle/Resource/Data) purely for readability; the wire encoding is
/// flat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Errno {
    // Transient
    Again = libc::EAGAIN,
    Intr = libc::EINTR,
    InProgress = libc::EINPROGRESS,

    // Protocol
    Proto = libc::EPROTO,
    BadFd = libc::EBADFD,
    NoSys = libc::ENOSYS,

    // Stale
    Idrm = libc::EIDRM,
    Busy = libc::EBUSY,

    // Lifecycle
    NoDev = libc::ENODEV,
    ConnAborted = libc::ECONNABORTED,
    Shutdown = libc::ESHUTDOWN,
    Canceled = libc::ECANCELED,

    // Resource
    NoMem = libc::ENOMEM,
    TooBig = libc::E2BIG,
    ChRng = libc::ECHRNG,
    Dom = libc::EDOM,

    // Data
    Pipe = libc::EPIPE,
    Io = libc::EIO,
}

impl Errno {
    /// Maps a raw positive errno value (as returned by libc) to `Errno`.
    ///
    /// Returns `None` for values this protocol never produces; callers at
    /// the wire boundary should treat that as `EIO` rather than panic.
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            libc::EAGAIN => Errno::Again,
            libc::EINTR => Errno::Intr,
            libc::EINPROGRESS => Errno::InProgress,
            libc::EPROTO => Errno::Proto,
            libc::EBADFD => Errno::BadFd,
            libc::ENOSYS => Errno::NoSys,
            libc::EIDRM => Errno::Idrm,
            libc::EBUSY => Errno::Busy,
            libc::ENODEV => Errno::NoDev,
            libc::ECONNABORTED => Errno::ConnAborted,
            libc::ESHUTDOWN => Errno::Shutdown,
            libc::ECANCELED => Errno::Canceled,
            libc::ENOMEM => Errno::NoMem,
            libc::E2BIG => Errno::TooBig,
            libc::ECHRNG => Errno::ChRng,
            libc::EDOM => Errno::Dom,
            libc::EPIPE => Errno::Pipe,
            libc::EIO => Errno::Io,
            _ => return None,
        })
    }

    /// The raw positive errno value.
    pub fn raw(self) -> i32 {
        self as i32
    }

    /// The wire/API convention: a negative errno, ready to hand back as a
    /// `-errno` style return value.
    pub fn neg(self) -> i32 {
        -self.raw()
    }

    /// True for errors a caller should retry or poll on rather than treat
    /// as fatal (spec §7 "Transient").
    pub fn is_transient(self) -> bool {
        matches!(self, Errno::Again | Errno::Intr | Errno::InProgress)
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: libc::strerror operates on a process-wide buffer; copy
        // the message out immediately rather than holding the pointer.
        let msg = unsafe {
            let ptr = libc::strerror(self.raw());
            if ptr.is_null() {
                return write!(f, "errno {}", self.raw());
            }
            std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
        };
        write!(f, "{msg} (errno {})", self.raw())
    }
}

impl std::error::Error for Errno {}

impl From<Errno> for i32 {
    fn from(e: Errno) -> i32 {
        e.neg()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_raw_value() {
        assert_eq!(Errno::from_raw(libc::EAGAIN), Some(Errno::Again));
        assert_eq!(Errno::Again.raw(), libc::EAGAIN);
        assert_eq!(Errno::Again.neg(), -libc::EAGAIN);
    }

    #[test]
    fn unknown_raw_is_none() {
        assert_eq!(Errno::from_raw(0), None);
    }

    #[test]
    fn transient_classification() {
        assert!(Errno::Again.is_transient());
        assert!(!Errno::Pipe.is_transient());
    }
}
