//! Wire frame flag bits shared by `dspd-transport`, `dspd-pcm`, and
//! `dspd-mixer` (spec.md §4.5.1 / §6).

use bitflags::bitflags;

bitflags! {
    /// Bits carried in every request/reply frame's `flags` field.
    ///
    /// The low byte (`ERROR`..`ROUTE_CHANGED`) and `NONBLOCK` travel over
    /// the wire between processes. `CMSG_FD`/`REMOTE`/`UNIX_*`/`POINTER`/
    /// `CMSG_CRED` are local-transport bits that never leave the sending
    /// process (spec.md: "distinguished by REMOTE").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ReqFlags: u32 {
        const ERROR         = 1 << 0;
        const POLLIN        = 1 << 1;
        const POLLOUT       = 1 << 2;
        const POLLPRI       = 1 << 3;
        const POLLHUP       = 1 << 4;
        const EVENT         = 1 << 5;
        const OVERFLOW      = 1 << 6;
        const ROUTE_CHANGED = 1 << 7;
        const NONBLOCK      = 1 << 8;

        const CMSG_CRED        = 1 << 26;
        const POINTER          = 1 << 27;
        const UNIX_IOCTL        = 1 << 28;
        const UNIX_FAST_IOCTL   = 1 << 29;
        const REMOTE            = 1 << 30;
        const CMSG_FD           = 1 << 31;
    }
}

impl ReqFlags {
    /// Bits that are meaningful only to the local (in-process) transport
    /// and must never be forwarded across a socket.
    pub const LOCAL_ONLY: ReqFlags = ReqFlags::POINTER
        .union(ReqFlags::UNIX_IOCTL)
        .union(ReqFlags::UNIX_FAST_IOCTL)
        .union(ReqFlags::CMSG_FD)
        .union(ReqFlags::CMSG_CRED);

    pub fn is_remote(self) -> bool {
        self.contains(ReqFlags::REMOTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_only_excludes_remote() {
        assert!(!ReqFlags::LOCAL_ONLY.contains(ReqFlags::REMOTE));
    }

    #[test]
    fn pointer_bit_value() {
        assert_eq!(ReqFlags::POINTER.bits(), 1 << 27);
    }
}
