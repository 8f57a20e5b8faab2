//! `dspd-shm`: named shared-memory regions binding a [`dspd_ring::RingFifo`]
//! and a [`dspd_mbx::Mailbox`] so a client process and the device thread
//! share storage after a single attach (spec.md §4.3).

mod layout;
mod map;

pub use layout::{Section, ShmMapHeader, SHM_MAGIC, SHM_VERSION};
pub use map::{ShmError, ShmMap};

#[cfg(test)]
mod tests {
    use super::*;
    use dspd_common::PcmStatus;

    fn unique_name(tag: &str) -> String {
        let pid = std::process::id();
        let tid = format!("{:?}", std::thread::current().id());
        format!("dspd-shm-test-{tag}-{pid}-{tid}")
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-')
            .collect()
    }

    #[test]
    fn create_then_attach_named_share_storage() {
        let name = unique_name("create-attach");
        let writer = ShmMap::<PcmStatus>::create(&name, 4096, 0).expect("create");
        writer.mailbox().write(PcmStatus {
            hw_ptr: 42,
            ..Default::default()
        });

        let reader = ShmMap::<PcmStatus>::attach_named(&name, 4096, 0).expect("attach");
        assert_eq!(reader.mailbox().read().hw_ptr, 42);

        writer.ring().write(b"abc", 3);
        let mut out = [0u8; 3];
        assert_eq!(reader.ring().read(&mut out, 3), 3);
        assert_eq!(&out, b"abc");
    }

    #[test]
    fn unlink_happens_whichever_named_holder_drops_last() {
        // The creator drops first, leaving the attacher as the last
        // holder; it must still be the one to shm_unlink, not just the
        // original creator (spec.md §4.3: "refcounted; last holder
        // truncates/unlinks").
        let name = unique_name("drop-order");
        let writer = ShmMap::<PcmStatus>::create(&name, 4096, 0).expect("create");
        let reader = ShmMap::<PcmStatus>::attach_named(&name, 4096, 0).expect("attach");
        drop(writer);

        let shm_name = format!("/{name}");
        assert!(nix::sys::mman::shm_open(
            shm_name.as_str(),
            nix::fcntl::OFlag::O_RDWR,
            nix::sys::stat::Mode::empty(),
        )
        .is_ok());

        drop(reader);

        let err = nix::sys::mman::shm_open(
            shm_name.as_str(),
            nix::fcntl::OFlag::O_RDWR,
            nix::sys::stat::Mode::empty(),
        )
        .unwrap_err();
        assert_eq!(err, nix::Error::ENOENT);
    }

    #[test]
    fn anonymous_map_roundtrips_through_duplicated_fd() {
        let (writer, fd) = ShmMap::<PcmStatus>::create_anonymous("dspd-anon-test", 1024, 0).expect("create");
        writer.ring().write(b"xyz", 3);
        let reader = ShmMap::<PcmStatus>::attach_fd(fd, 1024, 0).expect("attach");
        let mut out = [0u8; 3];
        assert_eq!(reader.ring().read(&mut out, 3), 3);
        assert_eq!(&out, b"xyz");
    }
}
