//! Top-level PCM client aggregate (spec.md §3 `PCM Client`, §4.6):
//! binds a device, negotiates parameters, and owns one
//! [`StreamRuntime`] per direction on top of one [`AioContext`].

use dspd_chmap::{build_routing, validate_routing, PositionMap, Routing};
use dspd_common::{ClientInfo, Direction, Errno, HwParams, SwParams, DEFAULT_MIN_PERIODS};
use dspd_shm::ShmMap;
use dspd_transport::{AioContext, Transport};

use crate::request::{self, PcmRequest};
use crate::src::SampleRateConverter;
use crate::stream::{StreamRuntime, TransferOutcome};

/// Readiness bits returned by [`PcmClient::poll_revents`], modeled on
/// `<poll.h>` (spec.md §4.6.7).
pub mod poll_bits {
    pub const POLLIN: i16 = libc::POLLIN as i16;
    pub const POLLOUT: i16 = libc::POLLOUT as i16;
    pub const POLLERR: i16 = libc::POLLERR as i16;
    pub const POLLHUP: i16 = libc::POLLHUP as i16;
}

/// A bound PCM client: one transport, one or two stream directions
/// (spec.md §3: "PCM Client ... one per direction within a PCM Client").
pub struct PcmClient<T: Transport> {
    ctx: AioContext<T>,
    device: String,
    info: ClientInfo,
    playback: Option<StreamRuntime>,
    capture: Option<StreamRuntime>,
    /// When true, `write_frames`/`read_frames` return `-EAGAIN` on a
    /// zero-frame transfer instead of calling [`wait`](Self::wait)
    /// (spec.md §4.6.4: "non-blocking mode" vs. the default blocking
    /// mode that "waits via `wait(stream_bit)`").
    nonblock: bool,
}

fn errno_from_wire(err: i32) -> Errno {
    Errno::from_raw(-err).unwrap_or(Errno::Io)
}

impl<T: Transport> PcmClient<T> {
    pub fn new(transport: T, max_ops: usize, local: bool, device: impl Into<String>, info: ClientInfo) -> Self {
        PcmClient {
            ctx: AioContext::new(transport, max_ops, local),
            device: device.into(),
            info,
            playback: None,
            capture: None,
            nonblock: false,
        }
    }

    /// spec.md §4.6.4: toggles between the default blocking mode (a
    /// zero-frame transfer calls [`wait`](Self::wait) and retries) and
    /// non-blocking mode (a zero-frame transfer returns `-EAGAIN`
    /// immediately).
    pub fn set_nonblock(&mut self, nonblock: bool) {
        self.nonblock = nonblock;
    }

    fn stream(&self, direction: Direction) -> Result<&StreamRuntime, Errno> {
        match direction {
            Direction::Playback => self.playback.as_ref(),
            Direction::Capture => self.capture.as_ref(),
        }
        .ok_or(Errno::BadFd)
    }

    fn stream_mut(&mut self, direction: Direction) -> Result<&mut StreamRuntime, Errno> {
        match direction {
            Direction::Playback => self.playback.as_mut(),
            Direction::Capture => self.capture.as_mut(),
        }
        .ok_or(Errno::BadFd)
    }

    /// spec.md §4.6.1: resolves the named device and publishes this
    /// client's credentials. Must precede [`attach_stream`](Self::attach_stream).
    pub fn connect(&mut self) -> Result<(), Errno> {
        let payload = request::encode_connect(self.info, &self.device);
        let (err, _out) = self.ctx.sync_ctl(-1, PcmRequest::Connect.as_u32(), &payload, 0)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        Ok(())
    }

    /// spec.md §4.6.1 continued: attaches the per-direction shared-
    /// memory ring+mailbox, receiving its fd over the transport's
    /// ancillary channel (the gap this fixes is that a reply-carried fd
    /// must survive `AioContext::dispatch_reply` — see
    /// `dspd-transport`'s `AsyncOp::received_fd`).
    pub fn attach_stream(&mut self, direction: Direction, ring_capacity: usize, frame_size: usize) -> Result<(), Errno> {
        let stream_bit = direction.bit() as i32;
        let (err, _out, fd) = self.ctx.sync_ctl_fd(stream_bit, PcmRequest::Connect.as_u32(), &[], 0)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        let runtime = match fd {
            Some(fd) => {
                let map = ShmMap::attach_fd(fd, ring_capacity, frame_size).map_err(|_| Errno::Proto)?;
                StreamRuntime::attach_shm(direction, map)
            }
            // A local (in-process) transport has no fd to pass; the
            // device side and this client share process-local storage
            // directly instead.
            None => StreamRuntime::new_local(direction, ring_capacity, frame_size),
        };
        match direction {
            Direction::Playback => self.playback = Some(runtime),
            Direction::Capture => self.capture = Some(runtime),
        }
        Ok(())
    }

    /// spec.md §4.6.2: negotiate hardware parameters, clamping the
    /// requested buffer to at least `DEFAULT_MIN_PERIODS` fragments
    /// before sending, then locking in whatever the server actually
    /// accepted.
    pub fn set_hwparams(&mut self, direction: Direction, mut params: HwParams) -> Result<HwParams, Errno> {
        params.clamp_buffer(DEFAULT_MIN_PERIODS);
        let payload = request::encode_hwparams(&params);
        let (err, out) = self
            .ctx
            .sync_ctl(direction.bit() as i32, PcmRequest::SetHwParams.as_u32(), &payload, request::HWPARAMS_WIRE_SIZE)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        let accepted = request::decode_hwparams(&out).ok_or(Errno::Proto)?;
        self.stream_mut(direction)?.apply_hwparams(accepted)?;
        Ok(accepted)
    }

    /// spec.md §4.6.3.
    pub fn set_swparams(&mut self, direction: Direction, params: SwParams) -> Result<(), Errno> {
        let payload = request::encode_swparams(&params);
        let (err, _out) = self.ctx.sync_ctl(direction.bit() as i32, PcmRequest::SetSwParams.as_u32(), &payload, 0)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        self.stream_mut(direction)?.apply_swparams(params)
    }

    /// Installs a sample-rate converter for `direction` (spec.md
    /// §4.6.8); only meaningful once `set_hwparams` has negotiated a
    /// rate mismatch against the device.
    pub fn set_src(&mut self, direction: Direction, src: Box<dyn SampleRateConverter>) -> Result<(), Errno> {
        self.stream_mut(direction)?.set_src(src);
        Ok(())
    }

    /// Builds and validates a channel routing from this stream's
    /// negotiated layout to the device's (spec.md §4.10).
    pub fn build_routing(&self, direction: Direction, client_map: &PositionMap, device_map: &PositionMap) -> Result<Routing, Errno> {
        let capture = direction == Direction::Capture;
        let routing = build_routing(client_map, device_map, capture)?;
        validate_routing(&routing, client_map.channels(), device_map.channels())?;
        Ok(routing)
    }

    fn ctl(&mut self, direction: Direction, req: PcmRequest) -> Result<(), Errno> {
        let (err, _out) = self.ctx.sync_ctl(direction.bit() as i32, req.as_u32(), &[], 0)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        Ok(())
    }

    /// spec.md §4.6.6: `SWPARAMS → PREPARED`, or recovery from
    /// `XRUN`/back out of `RUNNING`.
    pub fn prepare(&mut self, direction: Direction) -> Result<(), Errno> {
        self.ctl(direction, PcmRequest::Prepare)?;
        self.stream_mut(direction)?.prepare()
    }

    pub fn start(&mut self, direction: Direction) -> Result<(), Errno> {
        self.ctl(direction, PcmRequest::Start)?;
        self.stream_mut(direction)?.mark_running()
    }

    pub fn stop(&mut self, direction: Direction) -> Result<(), Errno> {
        self.ctl(direction, PcmRequest::Stop)?;
        self.stream_mut(direction)?.prepare()
    }

    /// spec.md §4.6.6: "`pause(true)` is a no-op when playback fill <
    /// `start_threshold`" — checked here before the round trip so an
    /// idle stream never bothers the server with a pause it would
    /// ignore anyway.
    pub fn pause(&mut self, direction: Direction, pause: bool) -> Result<(), Errno> {
        if pause && direction == Direction::Playback {
            let stream = self.stream(direction)?;
            if stream.fill_frames() < stream.swparams().start_threshold as u64 {
                return Ok(());
            }
        }
        self.ctl(direction, PcmRequest::Pause)?;
        self.stream_mut(direction)?.mark_paused(pause)
    }

    pub fn drain(&mut self, direction: Direction) -> Result<(), Errno> {
        self.ctl(direction, PcmRequest::Drain)?;
        self.stream_mut(direction)?.mark_draining()
    }

    pub fn reset(&mut self, direction: Direction) -> Result<(), Errno> {
        self.ctl(direction, PcmRequest::Reset)?;
        self.stream_mut(direction)?.prepare()
    }

    /// spec.md §4.6.4: resynchronizes the server's view of `appl_ptr`
    /// before any read/write/pointer/delay/poll call that needs it.
    fn resync_if_needed(&mut self, direction: Direction) -> Result<(), Errno> {
        let appl_ptr = {
            let stream = self.stream(direction)?;
            if !stream.needs_resync() {
                return Ok(());
            }
            stream.cli_appl_ptr()
        };
        let req = match direction {
            Direction::Playback => PcmRequest::SetWritePtr,
            Direction::Capture => PcmRequest::SetReadPtr,
        };
        let payload = request::encode_appl_ptr(appl_ptr);
        let (err, _out) = self.ctx.sync_ctl(direction.bit() as i32, req.as_u32(), &payload, 0)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        self.stream_mut(direction)?.ack_resync();
        Ok(())
    }

    /// spec.md §4.6.4 playback path. Auto-issues `Start` once
    /// accumulated frames cross `start_threshold`, mirroring the
    /// original's "wake the device as soon as there's enough to play".
    /// Blocks via [`wait`](Self::wait) on a full ring unless
    /// [`set_nonblock`](Self::set_nonblock) was called.
    pub fn write_frames(&mut self, buf: &[u8], frames: usize) -> Result<usize, Errno> {
        loop {
            self.resync_if_needed(Direction::Playback)?;
            let outcome = self.stream_mut(Direction::Playback)?.write_frames(buf, frames)?;
            if let Some(n) = self.after_transfer(Direction::Playback, outcome)? {
                return Ok(n);
            }
            self.wait(Direction::Playback, -1)?;
        }
    }

    /// spec.md §4.6.4 capture path. Blocks via [`wait`](Self::wait) on
    /// an empty ring unless [`set_nonblock`](Self::set_nonblock) was
    /// called.
    pub fn read_frames(&mut self, buf: &mut [u8], frames: usize) -> Result<usize, Errno> {
        loop {
            self.resync_if_needed(Direction::Capture)?;
            let outcome = self.stream_mut(Direction::Capture)?.read_frames(buf, frames)?;
            if let Some(n) = self.after_transfer(Direction::Capture, outcome)? {
                return Ok(n);
            }
            self.wait(Direction::Capture, -1)?;
        }
    }

    /// Returns `Some(frames)` when the transfer moved data, `None` when
    /// it didn't and the caller should block-and-retry (only reached in
    /// blocking mode; non-blocking mode returns `-EAGAIN` instead).
    fn after_transfer(&mut self, direction: Direction, outcome: TransferOutcome) -> Result<Option<usize>, Errno> {
        if outcome.frames == 0 {
            if self.nonblock {
                return Err(Errno::Again);
            }
            return Ok(None);
        }
        if outcome.should_trigger_start {
            self.start(direction)?;
        }
        Ok(Some(outcome.frames))
    }

    /// spec.md §4.6.4: "Blocking mode waits via `wait(stream_bit)` which
    /// uses the device's pollfd" as the alternative to the non-blocking
    /// `-EAGAIN` path. Drives the transport (`AioContext::process`,
    /// which itself polls the fd [`poll_descriptor`](Self::poll_descriptor)
    /// returns) until `direction` reports readiness via
    /// [`poll_revents`](Self::poll_revents), or until `timeout_ms`
    /// elapses (negative blocks indefinitely).
    pub fn wait(&mut self, direction: Direction, timeout_ms: i32) -> Result<(), Errno> {
        // Ring/mailbox state for a shared-memory-backed stream can change
        // without any frame arriving on the transport fd at all (the
        // device writes straight into shared memory). Polling the
        // transport in bounded slices rather than one indefinite block
        // means such changes are still noticed promptly instead of only
        // on the next unrelated wakeup.
        const POLL_SLICE_MS: i32 = 20;
        let deadline = (timeout_ms >= 0)
            .then(|| std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms as u64));
        let want = match direction {
            Direction::Playback => poll_bits::POLLOUT,
            Direction::Capture => poll_bits::POLLIN,
        };
        loop {
            let revents = self.poll_revents(direction)?;
            if revents & (want | poll_bits::POLLERR | poll_bits::POLLHUP) != 0 {
                return Ok(());
            }
            let slice = match deadline {
                None => POLL_SLICE_MS,
                Some(deadline) => {
                    let now = std::time::Instant::now();
                    if now >= deadline {
                        return Err(Errno::Again);
                    }
                    (deadline - now).as_millis().min(POLL_SLICE_MS as u128) as i32
                }
            };
            self.ctx.process(false, false, slice)?;
        }
    }

    /// spec.md §4.6.5: pulls the latest device-published status,
    /// transitioning to `XRUN` if the auto-xrun check trips.
    pub fn refresh_status(&mut self, direction: Direction) -> Result<(), Errno> {
        self.stream_mut(direction)?.refresh_status();
        Ok(())
    }

    pub fn hw_pointer(&mut self, direction: Direction) -> Result<u64, Errno> {
        self.resync_if_needed(direction)?;
        self.refresh_status(direction)?;
        Ok(self.stream(direction)?.hw_pointer())
    }

    /// spec.md §4.6.9.
    pub fn delay(&mut self, direction: Direction) -> Result<i32, Errno> {
        self.resync_if_needed(direction)?;
        self.refresh_status(direction)?;
        self.stream(direction)?.delay()
    }

    /// spec.md §4.6.7: the single fd an external event loop multiplexes
    /// on; both directions share one transport.
    pub fn poll_descriptor(&self) -> std::os::fd::RawFd {
        self.ctx.raw_fd()
    }

    /// Computes POSIX poll `revents` for `direction` from the latest
    /// status snapshot against `avail_min` (spec.md §4.6.7).
    pub fn poll_revents(&mut self, direction: Direction) -> Result<i16, Errno> {
        self.resync_if_needed(direction)?;
        self.refresh_status(direction)?;
        let stream = self.stream(direction)?;
        let mut mask = 0i16;
        if matches!(
            stream.state(),
            crate::state::ClientState::Xrun | crate::state::ClientState::Disconnected
        ) {
            mask |= poll_bits::POLLERR | poll_bits::POLLHUP;
        }
        let avail_min = stream.swparams().avail_min as u64;
        match direction {
            Direction::Playback => {
                if stream.space_frames() >= avail_min {
                    mask |= poll_bits::POLLOUT;
                }
            }
            Direction::Capture => {
                if stream.fill_frames() >= avail_min {
                    mask |= poll_bits::POLLIN;
                }
            }
        }
        Ok(mask)
    }

    /// Drives the transport once (spec.md §4.5.5); callers own the
    /// event loop and call this after their poll indicates this fd is
    /// ready, or periodically for a local/in-process transport.
    pub fn process(&mut self, readable: bool, writable: bool, timeout_ms: i32) -> Result<(), Errno> {
        self.ctx.process(readable, writable, timeout_ms)
    }

    pub fn disconnect(&mut self) -> Result<(), Errno> {
        let (err, _out) = self.ctx.sync_ctl(-1, PcmRequest::Disconnect.as_u32(), &[], 0)?;
        if err != 0 {
            return Err(errno_from_wire(err));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dspd_common::{HwParamFlags, PcmStatus, SampleFormat};
    use dspd_transport::{FrameHeader, RecvOutcome, SendOutcome, SocketTransport, HEADER_SIZE};
    use std::os::unix::net::UnixStream;

    fn hwparams() -> HwParams {
        HwParams {
            rate: 48_000,
            format: SampleFormat::S16Le,
            channels: 2,
            fragment_size: 256,
            buffer_size: 1024,
            flags: HwParamFlags::empty(),
            src_quality: 0,
        }
    }

    /// Minimal "device" responder driving the same request sequence a
    /// real client issues, mirroring spec.md §8 scenario 2's handshake.
    fn serve_one(server: &mut AioContext<SocketTransport>, transform: impl FnOnce(u32, &[u8]) -> Vec<u8>) {
        loop {
            match server.transport_mut().recv().unwrap() {
                RecvOutcome::Frame { header, payload, .. } => {
                    let out = transform(header.cmd, &payload);
                    let reply = FrameHeader {
                        total_len: (HEADER_SIZE + out.len()) as u32,
                        flags: dspd_common::ReqFlags::empty(),
                        cmd: header.cmd,
                        stream: header.stream,
                        bytes_returned: out.len() as i32,
                        rdata: 0,
                        tag: header.tag,
                    };
                    loop {
                        if let SendOutcome::Complete = server.transport_mut().send(&reply, &out, None).unwrap() {
                            return;
                        }
                    }
                }
                RecvOutcome::WouldBlock => continue,
                RecvOutcome::Eof => panic!("unexpected eof"),
            }
        }
    }

    fn pair() -> (PcmClient<SocketTransport>, AioContext<SocketTransport>) {
        let (a, b) = UnixStream::pair().unwrap();
        let ta = SocketTransport::new(a, 8).unwrap();
        let tb = SocketTransport::new(b, 8).unwrap();
        let info = ClientInfo { uid: 1000, gid: 1000, pid: 1 };
        (
            PcmClient::new(ta, 8, false, "default", info),
            AioContext::new(tb, 8, false),
        )
    }

    #[test]
    fn connect_round_trips_through_loopback_server() {
        let (mut client, mut server) = pair();
        std::thread::scope(|scope| {
            scope.spawn(|| {
                client.connect().unwrap();
            });
            serve_one(&mut server, |_cmd, _payload| Vec::new());
        });
    }

    /// Keeps replying to whatever the client sends (empty payload, no
    /// fd) until the transport reports `Eof`, for tests that need more
    /// than one round trip (resync requests interleaved with the
    /// request under test).
    fn serve_loop(server: &mut AioContext<SocketTransport>) {
        loop {
            match server.transport_mut().recv() {
                Ok(RecvOutcome::Frame { header, .. }) => {
                    let reply = FrameHeader {
                        total_len: HEADER_SIZE as u32,
                        flags: dspd_common::ReqFlags::empty(),
                        cmd: header.cmd,
                        stream: header.stream,
                        bytes_returned: 0,
                        rdata: 0,
                        tag: header.tag,
                    };
                    loop {
                        match server.transport_mut().send(&reply, &[], None).unwrap() {
                            SendOutcome::Complete => break,
                            _ => continue,
                        }
                    }
                }
                Ok(RecvOutcome::WouldBlock) => continue,
                Ok(RecvOutcome::Eof) => return,
                Err(_) => return,
            }
        }
    }

    #[test]
    fn blocking_write_frames_waits_for_device_to_drain_then_succeeds() {
        // A 2-frame ring: the first write fills it completely, so the
        // second write must block in `wait()` until the drain thread
        // below frees room, instead of returning `-EAGAIN` right away.
        let frame_size = hwparams().frame_size();
        let capacity = 2 * frame_size;
        let (writer_map, dup_fd) =
            ShmMap::<PcmStatus>::create_anonymous("pcm-client-block-test", capacity, frame_size).expect("create shm");
        let mut stream = StreamRuntime::attach_shm(Direction::Playback, writer_map);
        stream.apply_hwparams(hwparams()).unwrap();
        stream
            .apply_swparams(SwParams {
                avail_min: 1,
                start_threshold: 1,
                stop_threshold: 2,
            })
            .unwrap();
        stream.prepare().unwrap();
        stream.mark_running().unwrap();

        let (a, b) = UnixStream::pair().unwrap();
        let ta = SocketTransport::new(a, 8).unwrap();
        let tb = SocketTransport::new(b, 8).unwrap();
        let info = ClientInfo { uid: 1000, gid: 1000, pid: 1 };
        let mut client = PcmClient::new(ta, 8, false, "default", info);
        client.playback = Some(stream);
        let mut server = AioContext::new(tb, 8, false);

        let buf = vec![0u8; 2 * frame_size];
        std::thread::scope(|scope| {
            let drain = scope.spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(20));
                let reader = ShmMap::<PcmStatus>::attach_fd(dup_fd, capacity, frame_size).expect("attach shm");
                let mut scratch = vec![0u8; frame_size];
                assert_eq!(reader.ring().read(&mut scratch, 1), 1);
            });
            let client_thread = scope.spawn(move || {
                assert_eq!(client.write_frames(&buf, 2).unwrap(), 2);
                let written = client.write_frames(&buf[..frame_size], 1).unwrap();
                assert_eq!(written, 1);
                drop(client);
            });
            serve_loop(&mut server);
            client_thread.join().unwrap();
            drain.join().unwrap();
        });
    }

    #[test]
    fn hwparams_negotiation_locks_in_server_accepted_values() {
        let (mut client, mut server) = pair();
        let requested = hwparams();
        std::thread::scope(|scope| {
            let h = scope.spawn(move || {
                client.playback = Some(StreamRuntime::new_local(Direction::Playback, 4096, requested.frame_size()));
                let accepted = client.set_hwparams(Direction::Playback, requested).unwrap();
                assert_eq!(accepted.buffer_size, 1024);
                client
            });
            serve_one(&mut server, |_cmd, payload| {
                let p = request::decode_hwparams(payload).unwrap();
                request::encode_hwparams(&p)
            });
            let client = h.join().unwrap();
            assert_eq!(client.stream(Direction::Playback).unwrap().hwparams().unwrap().rate, 48_000);
        });
    }
}
