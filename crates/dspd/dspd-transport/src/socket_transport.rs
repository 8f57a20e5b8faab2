//! Stream-socket transport (spec.md §4.5.7 "Socket"): `SO_SNDBUF`/
//! `SO_RCVBUF` sized for the configured pipeline depth, fds passed via
//! `SCM_RIGHTS`, credentials read once via `SO_PEERCRED`.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{
    getsockopt, recvmsg, sendmsg, sockopt::PeerCredentials, ControlMessage, ControlMessageOwned, MsgFlags,
};
use nix::sys::uio::IoSlice;

use crate::frame::{FrameHeader, HEADER_SIZE};
use crate::transport::{PollMask, RecvOutcome, SendOutcome, Transport};

/// Credentials read from the peer at connect time (spec.md §4.6.1:
/// "publishes client info (uid/gid/pid)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

enum RecvState {
    Header {
        buf: [u8; HEADER_SIZE],
        have: usize,
    },
    Payload {
        header: FrameHeader,
        buf: Vec<u8>,
        have: usize,
        fd: Option<OwnedFd>,
    },
}

pub struct SocketTransport {
    stream: UnixStream,
    peer: PeerCredentials,
    send_staging: Vec<u8>,
    send_offset: usize,
    send_fd_sent: bool,
    recv_state: RecvState,
    pending_fd: Option<OwnedFd>,
    dead: bool,
}

/// Rounds `bytes` up to the nearest page (4096 bytes), matching the
/// `SO_SNDBUF`/`SO_RCVBUF` sizing rule in spec.md §4.5.7.
pub fn socket_buffer_size(max_req: usize) -> usize {
    const PAGE: usize = 4096;
    let raw = max_req.max(1) * (HEADER_SIZE + 256) * 2;
    raw.div_ceil(PAGE) * PAGE
}

impl SocketTransport {
    pub fn new(stream: UnixStream, max_req: usize) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let sock = socket2::Socket::from(stream.try_clone()?);
        let size = socket_buffer_size(max_req);
        let _ = sock.set_send_buffer_size(size);
        let _ = sock.set_recv_buffer_size(size);
        std::mem::forget(sock); // shares the fd with `stream`; don't close it twice

        let creds = getsockopt(&stream, PeerCredentials).map_err(io::Error::from)?;
        let peer = PeerCredentials {
            uid: creds.uid(),
            gid: creds.gid(),
            pid: creds.pid(),
        };

        Ok(SocketTransport {
            stream,
            peer,
            send_staging: Vec::new(),
            send_offset: 0,
            send_fd_sent: false,
            recv_state: RecvState::Header {
                buf: [0u8; HEADER_SIZE],
                have: 0,
            },
            pending_fd: None,
            dead: false,
        })
    }

    pub fn peer_credentials(&self) -> PeerCredentials {
        self.peer
    }

    fn send_raw(&mut self, buf: &[u8], fd: Option<&OwnedFd>) -> io::Result<usize> {
        if let Some(fd) = fd {
            let iov = [IoSlice::new(buf)];
            let fds = [fd.as_raw_fd()];
            let cmsg = [ControlMessage::ScmRights(&fds)];
            sendmsg::<()>(self.stream.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)
                .map_err(io::Error::from)
        } else {
            self.stream.write(buf)
        }
    }
}

impl Transport for SocketTransport {
    fn send(&mut self, header: &FrameHeader, payload: &[u8], fd: Option<&OwnedFd>) -> io::Result<SendOutcome> {
        if self.send_offset == 0 && self.send_staging.is_empty() {
            let mut hdr = [0u8; HEADER_SIZE];
            header.encode(&mut hdr);
            self.send_staging.reserve(HEADER_SIZE + payload.len());
            self.send_staging.extend_from_slice(&hdr);
            self.send_staging.extend_from_slice(payload);
            self.send_fd_sent = false;
        }
        let remaining = &self.send_staging[self.send_offset..];
        let send_fd = if self.send_fd_sent { None } else { fd };
        match self.send_raw(remaining, send_fd) {
            Ok(0) if !remaining.is_empty() => Ok(SendOutcome::WouldBlock),
            Ok(n) => {
                self.send_fd_sent = true;
                self.send_offset += n;
                if self.send_offset >= self.send_staging.len() {
                    self.send_offset = 0;
                    self.send_staging.clear();
                    Ok(SendOutcome::Complete)
                } else {
                    Ok(SendOutcome::Partial)
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(SendOutcome::WouldBlock),
            Err(e) if e.kind() == ErrorKind::BrokenPipe || e.kind() == ErrorKind::ConnectionReset => {
                self.dead = true;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn recv(&mut self) -> io::Result<RecvOutcome> {
        loop {
            match &mut self.recv_state {
                RecvState::Header { buf, have } => {
                    let n = self.recv_raw(&mut buf[*have..])?;
                    match n {
                        0 if *have == 0 => return Ok(RecvOutcome::WouldBlock),
                        0 => {
                            self.dead = true;
                            return Ok(RecvOutcome::Eof);
                        }
                        n => *have += n,
                    }
                    if *have == HEADER_SIZE {
                        let header = FrameHeader::decode(buf);
                        let plen = header.payload_len();
                        let fd = self.pending_fd.take();
                        if plen == 0 {
                            self.recv_state = RecvState::Header {
                                buf: [0u8; HEADER_SIZE],
                                have: 0,
                            };
                            return Ok(RecvOutcome::Frame {
                                header,
                                payload: Vec::new(),
                                fd,
                            });
                        }
                        self.recv_state = RecvState::Payload {
                            header,
                            buf: vec![0u8; plen],
                            have: 0,
                            fd,
                        };
                    } else {
                        return Ok(RecvOutcome::WouldBlock);
                    }
                }
                RecvState::Payload { buf, have, .. } => {
                    let n = self.recv_raw(&mut buf[*have..])?;
                    match n {
                        0 if *have == 0 && buf.is_empty() => {}
                        0 if *have < buf.len() => {
                            // A zero-length nonblocking read before anything
                            // arrived means "try again later", not EOF.
                            return Ok(RecvOutcome::WouldBlock);
                        }
                        n => *have += n,
                    }
                    if *have >= buf.len() {
                        let finished = std::mem::replace(
                            &mut self.recv_state,
                            RecvState::Header {
                                buf: [0u8; HEADER_SIZE],
                                have: 0,
                            },
                        );
                        if let RecvState::Payload { header, buf, fd, .. } = finished {
                            return Ok(RecvOutcome::Frame { header, payload: buf, fd });
                        }
                        unreachable!();
                    }
                    return Ok(RecvOutcome::WouldBlock);
                }
            }
        }
    }

    fn poll_events(&self, want_write: bool, timeout_ms: i32) -> io::Result<PollMask> {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
        let fd = self.stream.as_fd();
        let mut flags = PollFlags::POLLIN;
        if want_write {
            flags |= PollFlags::POLLOUT;
        }
        let mut fds = [PollFd::new(fd, flags)];
        let pt = if timeout_ms < 0 {
            PollTimeout::NONE
        } else {
            PollTimeout::try_from(timeout_ms as u16).unwrap_or(PollTimeout::MAX)
        };
        poll(&mut fds, pt).map_err(io::Error::from)?;
        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        Ok(PollMask {
            readable: revents.contains(PollFlags::POLLIN) || revents.contains(PollFlags::POLLHUP),
            writable: revents.contains(PollFlags::POLLOUT),
        })
    }

    fn raw_fd(&self) -> std::os::fd::RawFd {
        self.stream.as_raw_fd()
    }

    fn is_dead(&self) -> bool {
        self.dead
    }
}

impl SocketTransport {
    fn recv_raw(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut iov = [nix::sys::uio::IoSliceMut::new(buf)];
        let mut cmsg_space = nix::cmsg_space!([std::os::fd::RawFd; 1]);
        match recvmsg::<()>(
            self.stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            MsgFlags::empty(),
        ) {
            Ok(msg) => {
                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        // Extra fds beyond the first are closed rather than
                        // leaked (spec.md §4.5.7: "any extra fds beyond the
                        // first are closed to prevent fd exhaustion attacks").
                        for (i, raw) in fds.into_iter().enumerate() {
                            let owned = unsafe { OwnedFd::from(std::os::fd::FromRawFd::from_raw_fd(raw)) };
                            if i == 0 {
                                self.pending_fd = Some(owned);
                            }
                        }
                    }
                }
                Ok(msg.bytes)
            }
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_buffer_size_is_page_aligned() {
        let sz = socket_buffer_size(32);
        assert_eq!(sz % 4096, 0);
        assert!(sz >= 32 * (HEADER_SIZE + 256) * 2);
    }

    #[test]
    fn frame_roundtrips_over_a_connected_pair() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut ta = SocketTransport::new(a, 8).unwrap();
        let mut tb = SocketTransport::new(b, 8).unwrap();

        let header = FrameHeader {
            total_len: (HEADER_SIZE + 3) as u32,
            flags: dspd_common::ReqFlags::empty(),
            cmd: 9,
            stream: 0,
            bytes_returned: 0,
            rdata: 0,
            tag: crate::frame::pack_tag(1, 0, 5),
        };
        loop {
            match ta.send(&header, b"abc", None).unwrap() {
                SendOutcome::Complete => break,
                SendOutcome::Partial | SendOutcome::WouldBlock => continue,
            }
        }
        loop {
            match tb.recv().unwrap() {
                RecvOutcome::Frame { header: h, payload, .. } => {
                    assert_eq!(h.cmd, 9);
                    assert_eq!(payload, b"abc");
                    break;
                }
                RecvOutcome::WouldBlock => continue,
                RecvOutcome::Eof => panic!("unexpected eof"),
            }
        }
    }
}
