//! One direction (playback or capture) of a PCM client (spec.md §3
//! `ClientStream`, §4.6.4/§4.6.5 data path and pointer/xrun handling).

use dspd_common::{Direction, Errno, HwParams, PcmStatus, SwParams};
use dspd_mbx::Mailbox;
use dspd_ring::{RingConfig, RingFifo};
use dspd_shm::ShmMap;

use crate::src::SampleRateConverter;
use crate::state::ClientState;

/// Where a stream's ring FIFO and status mailbox actually live.
enum Backing {
    /// Attached to the device's shared-memory region (the normal case).
    Shm(ShmMap<PcmStatus>),
    /// Process-local storage, for tests and for an in-process-only
    /// loopback client that has no separate device process.
    Local { ring: Box<RingFifo>, mbx: Box<Mailbox<PcmStatus>> },
}

impl Backing {
    fn ring(&self) -> &RingFifo {
        match self {
            Backing::Shm(m) => m.ring(),
            Backing::Local { ring, .. } => ring,
        }
    }

    fn mailbox(&self) -> &Mailbox<PcmStatus> {
        match self {
            Backing::Shm(m) => m.mailbox(),
            Backing::Local { mbx, .. } => mbx,
        }
    }
}

/// Result of a [`StreamRuntime::write_frames`] or
/// [`StreamRuntime::read_frames`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub frames: usize,
    /// True the moment accumulated frames cross `start_threshold` for
    /// the first time since `prepare()`; the caller (which owns the
    /// transport) should issue a `Start` control request when this is
    /// set (spec.md §4.6.4: "auto-start on threshold crossing").
    pub should_trigger_start: bool,
}

/// One direction of a PCM client: its negotiated parameters, its ring
/// FIFO/mailbox, and the bookkeeping spec.md §4.6.4/§4.6.5 describe.
pub struct StreamRuntime {
    direction: Direction,
    state: ClientState,
    hwparams: Option<HwParams>,
    swparams: SwParams,
    backing: Backing,
    cli_appl_ptr: u64,
    /// Last `appl_ptr` the server is known to agree with; used to
    /// detect the need for a `SET_READ_PTR`/`SET_WRITE_PTR`
    /// resynchronization (spec.md §4.6.4).
    server_appl_ptr: u64,
    written_since_prepare: u64,
    triggered: bool,
    src: Option<Box<dyn SampleRateConverter>>,
    last_status: PcmStatus,
}

impl StreamRuntime {
    fn new(direction: Direction, backing: Backing) -> Self {
        StreamRuntime {
            direction,
            state: ClientState::Open,
            hwparams: None,
            swparams: SwParams::default(),
            backing,
            cli_appl_ptr: 0,
            server_appl_ptr: 0,
            written_since_prepare: 0,
            triggered: false,
            src: None,
            last_status: PcmStatus::default(),
        }
    }

    /// Attaches to a device-owned shared-memory region (spec.md §4.6.1:
    /// "shared-memory map attach follows").
    pub fn attach_shm(direction: Direction, map: ShmMap<PcmStatus>) -> Self {
        Self::new(direction, Backing::Shm(map))
    }

    /// Builds a stream backed by process-local storage instead of a
    /// shared-memory attach; used by tests and loopback setups that run
    /// client and device logic in one process.
    pub fn new_local(direction: Direction, ring_capacity: usize, ring_frame_size: usize) -> Self {
        let ring = RingFifo::new_boxed(RingConfig::new(ring_capacity, ring_frame_size));
        let mbx = Mailbox::new_boxed();
        Self::new(direction, Backing::Local { ring, mbx })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn hwparams(&self) -> Option<&HwParams> {
        self.hwparams.as_ref()
    }

    /// Records the server-accepted hardware parameters (spec.md §4.6.2:
    /// "client re-reads the authoritative result and locks it in").
    pub fn apply_hwparams(&mut self, params: HwParams) -> Result<(), Errno> {
        self.state.advance(ClientState::HwParams)?;
        self.hwparams = Some(params);
        Ok(())
    }

    pub fn apply_swparams(&mut self, params: SwParams) -> Result<(), Errno> {
        self.state.advance(ClientState::SwParams)?;
        self.swparams = params;
        Ok(())
    }

    pub fn set_src(&mut self, src: Box<dyn SampleRateConverter>) {
        self.src = Some(src);
    }

    /// Resets pointers and counters for a fresh run (spec.md §4.6.6:
    /// "`prepare`"; also the landing state after `reset`/recovering from
    /// `XRUN`).
    pub fn prepare(&mut self) -> Result<(), Errno> {
        self.state.advance(ClientState::Prepared)?;
        self.cli_appl_ptr = 0;
        self.server_appl_ptr = 0;
        self.written_since_prepare = 0;
        self.triggered = false;
        if let Some(src) = self.src.as_mut() {
            src.reset();
        }
        Ok(())
    }

    pub fn mark_running(&mut self) -> Result<(), Errno> {
        self.state.advance(ClientState::Running)?;
        self.triggered = true;
        Ok(())
    }

    pub fn mark_paused(&mut self, pause: bool) -> Result<(), Errno> {
        // spec.md §4.6.6: "pause(true) is a no-op when playback fill <
        // start_threshold" — the caller is expected to have already
        // checked that via `fill_frames()` before calling this.
        if pause {
            self.state.advance(ClientState::Paused)
        } else {
            self.state.advance(ClientState::Running)
        }
    }

    pub fn mark_draining(&mut self) -> Result<(), Errno> {
        self.state.advance(ClientState::Draining)
    }

    fn frame_size(&self) -> usize {
        self.hwparams.map(|p| p.frame_size()).unwrap_or(1)
    }

    fn buffer_frames(&self) -> u64 {
        self.hwparams.map(|p| p.buffer_size as u64).unwrap_or(0)
    }

    /// Frames queued in the ring the device has not yet consumed
    /// (playback) or the client has not yet read (capture).
    pub fn fill_frames(&self) -> u64 {
        let frame_size = self.frame_size().max(1);
        self.backing.ring().len() as u64 / frame_size as u64
    }

    /// Frames of free room left in the ring (spec.md §4.6.7: poll
    /// readiness is governed by `avail_min`, which on the playback side
    /// means "room to write").
    pub fn space_frames(&self) -> u64 {
        let frame_size = self.frame_size().max(1);
        self.backing.ring().space() as u64 / frame_size as u64
    }

    pub fn swparams(&self) -> SwParams {
        self.swparams
    }

    /// Writes up to `frames` frames from `buf` into the ring (spec.md
    /// §4.6.4, playback direction). Returns `-EAGAIN` when the FIFO is
    /// full; the caller decides whether to block via `wait()` or return
    /// the error to its own caller.
    pub fn write_frames(&mut self, buf: &[u8], frames: usize) -> Result<TransferOutcome, Errno> {
        if !matches!(self.state, ClientState::Prepared | ClientState::Running) {
            return Err(Errno::BadFd);
        }
        let n = self.backing.ring().write(buf, frames);
        if n == 0 && frames > 0 {
            return Ok(TransferOutcome {
                frames: 0,
                should_trigger_start: false,
            });
        }
        self.cli_appl_ptr += n as u64;
        self.written_since_prepare += n as u64;
        let should_trigger_start = !self.triggered
            && self.written_since_prepare >= self.swparams.start_threshold as u64
            && self.swparams.start_threshold > 0;
        Ok(TransferOutcome {
            frames: n,
            should_trigger_start,
        })
    }

    /// Reads up to `frames` frames into `buf` (spec.md §4.6.4, capture
    /// direction). Symmetric to [`write_frames`](Self::write_frames);
    /// auto-starts when the requested size already meets
    /// `start_threshold`.
    pub fn read_frames(&mut self, buf: &mut [u8], frames: usize) -> Result<TransferOutcome, Errno> {
        if !matches!(self.state, ClientState::Prepared | ClientState::Running) {
            return Err(Errno::BadFd);
        }
        let n = self.backing.ring().read(buf, frames);
        self.cli_appl_ptr += n as u64;
        let should_trigger_start =
            !self.triggered && frames as u64 >= self.swparams.start_threshold as u64 && self.swparams.start_threshold > 0;
        Ok(TransferOutcome {
            frames: n,
            should_trigger_start,
        })
    }

    /// Pulls the latest device-published status (spec.md §4.6.5:
    /// "`hw_pointer` ... derived from the latest mailbox snapshot").
    /// Also runs the auto-xrun check and transitions state on
    /// detection.
    pub fn refresh_status(&mut self) {
        self.last_status = self.backing.mailbox().read();
        if self.last_status.error < 0 {
            let _ = self.state.advance(ClientState::Xrun);
            return;
        }
        if self.check_auto_xrun() {
            let _ = self.state.advance(ClientState::Xrun);
        }
    }

    /// spec.md §4.6.5 auto-xrun rules: playback overruns its own buffer
    /// when `appl_ptr - hw_ptr > buffer_size`; capture underruns
    /// (from the client's point of view, it has fallen behind the
    /// device) when `hw_ptr - appl_ptr > buffer_size`.
    fn check_auto_xrun(&self) -> bool {
        let buffer_size = self.buffer_frames();
        if buffer_size == 0 {
            return false;
        }
        match self.direction {
            Direction::Playback => self.cli_appl_ptr.wrapping_sub(self.last_status.hw_ptr) > buffer_size,
            Direction::Capture => self.last_status.hw_ptr.wrapping_sub(self.cli_appl_ptr) > buffer_size,
        }
    }

    pub fn hw_pointer(&self) -> u64 {
        let buffer_size = self.buffer_frames();
        if buffer_size == 0 {
            self.last_status.hw_ptr
        } else {
            self.last_status.hw_ptr % buffer_size
        }
    }

    /// True when the client's local `appl_ptr` has drifted from what the
    /// server last acknowledged, meaning a `SET_READ_PTR`/
    /// `SET_WRITE_PTR` resync is owed before the next read/write/
    /// pointer/delay/poll call (spec.md §4.6.4).
    pub fn needs_resync(&self) -> bool {
        self.cli_appl_ptr != self.server_appl_ptr
    }

    /// Records that the server has acknowledged `self.cli_appl_ptr`
    /// (called after successfully sending `SET_READ_PTR`/
    /// `SET_WRITE_PTR`).
    pub fn ack_resync(&mut self) {
        self.server_appl_ptr = self.cli_appl_ptr;
    }

    pub fn cli_appl_ptr(&self) -> u64 {
        self.cli_appl_ptr
    }

    /// spec.md §4.6.9: delay reporting. Playback reports `-EIO` when
    /// `appl == hw` and the buffer is full (nothing left to play but the
    /// ring says "full", i.e. stalled), `-EPIPE` when the device has
    /// flagged an underrun, and otherwise the server's `delay` field,
    /// adjusted for any SRC latency this stream is carrying.
    pub fn delay(&self) -> Result<i32, Errno> {
        if self.last_status.error == -(libc::EPIPE) {
            return Err(Errno::Pipe);
        }
        let buffer_size = self.buffer_frames();
        if self.direction == Direction::Playback
            && self.cli_appl_ptr == self.last_status.hw_ptr
            && buffer_size > 0
            && self.fill_frames() >= buffer_size
        {
            return Err(Errno::Io);
        }
        let src_latency = self.src.as_ref().map(|s| s.latency_frames()).unwrap_or(0) as i32;
        Ok(self.last_status.delay + src_latency)
    }

    pub fn last_status(&self) -> PcmStatus {
        self.last_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dspd_common::{HwParamFlags, SampleFormat};

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

    fn prepared_stream(direction: Direction) -> StreamRuntime {
        let mut s = StreamRuntime::new_local(direction, 4096, hwparams().frame_size());
        s.apply_hwparams(hwparams()).unwrap();
        s.apply_swparams(SwParams {
            avail_min: 64,
            start_threshold: 128,
            stop_threshold: 1024,
        })
        .unwrap();
        s.prepare().unwrap();
        s
    }

    #[test]
    fn write_frames_accumulates_and_triggers_start_at_threshold() {
        let mut s = prepared_stream(Direction::Playback);
        let frame_size = hwparams().frame_size();
        let buf = vec![0u8; 100 * frame_size];
        let out = s.write_frames(&buf, 100).unwrap();
        assert_eq!(out.frames, 100);
        assert!(!out.should_trigger_start);

        let buf2 = vec![0u8; 40 * frame_size];
        let out2 = s.write_frames(&buf2, 40).unwrap();
        assert_eq!(out2.frames, 40);
        assert!(out2.should_trigger_start);
    }

    #[test]
    fn write_rejected_before_prepared() {
        let mut s = StreamRuntime::new_local(Direction::Playback, 4096, hwparams().frame_size());
        let buf = vec![0u8; 16];
        assert_eq!(s.write_frames(&buf, 1), Err(Errno::BadFd));
    }

    #[test]
    fn resync_detection_round_trips() {
        let mut s = prepared_stream(Direction::Playback);
        assert!(!s.needs_resync());
        let frame_size = hwparams().frame_size();
        s.write_frames(&vec![0u8; 4 * frame_size], 4).unwrap();
        assert!(s.needs_resync());
        s.ack_resync();
        assert!(!s.needs_resync());
    }

    #[test]
    fn playback_auto_xrun_when_appl_outruns_hw_beyond_buffer() {
        let mut s = prepared_stream(Direction::Playback);
        s.mark_running().unwrap();
        let frame_size = hwparams().frame_size();
        let buf = vec![0u8; 4096];
        s.write_frames(&buf, 4096 / frame_size).unwrap();
        // hw_ptr stays at 0 (device hasn't consumed anything); appl_ptr
        // has advanced past buffer_size (1024).
        s.refresh_status();
        assert_eq!(s.state(), ClientState::Xrun);
    }

    #[test]
    fn delay_reports_epipe_when_device_signals_underrun() {
        let mut s = prepared_stream(Direction::Playback);
        s.mark_running().unwrap();
        // Directly poke last_status to simulate a device-reported error,
        // bypassing the mailbox since this is a local-only stream.
        s.last_status.error = -(libc::EPIPE);
        assert_eq!(s.delay(), Err(Errno::Pipe));
    }
}
