//! Shared PCM parameter and status types (spec.md §3 `ClientStream`,
//! §4.6.2/§4.6.3, §6 shared-memory section layout).

use bitflags::bitflags;

/// Direction of a PCM stream within a client (spec.md §3 `ClientStream`:
/// "one per direction (playback/capture) within a PCM Client").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Playback,
    Capture,
}

impl Direction {
    pub fn other(self) -> Direction {
        match self {
            Direction::Playback => Direction::Capture,
            Direction::Capture => Direction::Playback,
        }
    }

    /// Bit position used when a stream mask packs both directions into one
    /// integer (`sbits` in the original source, e.g. `dspd_rclient_wait`).
    pub fn bit(self) -> u32 {
        match self {
            Direction::Playback => 1,
            Direction::Capture => 2,
        }
    }
}

/// On-wire sample format. Only the handful the SRC contract and the
/// client runtime actually move are modeled; anything else is rejected at
/// `set_hwparams`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleFormat {
    S16Le,
    S32Le,
    Float32Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::S16Le => 2,
            SampleFormat::S32Le | SampleFormat::Float32Le => 4,
        }
    }
}

bitflags! {
    /// `flags` field of the hw params negotiation message (spec.md
    /// §4.6.2: "flags (SHM/resample/translate/...)").
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HwParamFlags: u32 {
        const SHM          = 1 << 0;
        const RESAMPLE      = 1 << 1;
        const TRANSLATE     = 1 << 2;
        const EXCLUSIVE     = 1 << 3;
    }
}

/// Default minimum number of fragments that must fit in the buffer
/// (spec.md §4.6.2: "buffer_size >= min_periods x fragment_size").
pub const DEFAULT_MIN_PERIODS: u32 = 3;

/// Hardware parameters as negotiated between client and server
/// (spec.md §4.6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwParams {
    pub rate: u32,
    pub format: SampleFormat,
    pub channels: u8,
    pub fragment_size: u32,
    pub buffer_size: u32,
    pub flags: HwParamFlags,
    pub src_quality: u8,
}

impl HwParams {
    /// Clamps `fragment_size`/`buffer_size` to spec.md §4.6.2's rule:
    /// buffer holds at least `min_periods` fragments, and buffer size is
    /// rounded up to a whole multiple of the fragment size.
    pub fn clamp_buffer(&mut self, min_periods: u32) {
        let min_buffer = self.fragment_size.saturating_mul(min_periods);
        if self.buffer_size < min_buffer {
            self.buffer_size = min_buffer;
        }
        if self.fragment_size > 0 {
            let rem = self.buffer_size % self.fragment_size;
            if rem != 0 {
                self.buffer_size += self.fragment_size - rem;
            }
        }
    }

    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }
}

/// Software parameters (spec.md §4.6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwParams {
    pub avail_min: u32,
    pub start_threshold: u32,
    pub stop_threshold: u32,
}

/// Mailbox payload published by the device thread and read by the PCM
/// client runtime (spec.md §3 `ClientStream`, §6 shared-memory layout).
/// Must be `Copy` — it is stored inside a `dspd_mbx::Mailbox<PcmStatus>`
/// slot and read via bitwise copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PcmStatus {
    pub appl_ptr: u64,
    pub hw_ptr: u64,
    pub tstamp: u64,
    pub trigger_tstamp: u64,
    pub delay_tstamp: u64,
    pub avail: u32,
    pub delay: i32,
    /// Negative errno, or 0. Mirrors `dspd_pcmcli_status.error`.
    pub error: i32,
}

/// `uid`/`gid`/`pid` of a connecting client (spec.md §4.6.1: "publishes
/// client info (uid/gid/pid)").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientInfo {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

/// Server-reported device summary, returned from a "default device" or
/// by-name lookup (spec.md §4.6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceStat {
    pub name: String,
    pub playback: Option<HwParams>,
    pub capture: Option<HwParams>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_rounds_up_to_fragment_multiple() {
        let mut p = HwParams {
            rate: 48_000,
            format: SampleFormat::S16Le,
            channels: 2,
            fragment_size: 256,
            buffer_size: 500,
            flags: HwParamFlags::empty(),
            src_quality: 0,
        };
        p.clamp_buffer(DEFAULT_MIN_PERIODS);
        // min_buffer = 768, 500 rounds up to 768 already a multiple of 256.
        assert_eq!(p.buffer_size, 768);
    }

    #[test]
    fn clamp_keeps_larger_non_multiple_rounded_up() {
        let mut p = HwParams {
            rate: 48_000,
            format: SampleFormat::S16Le,
            channels: 2,
            fragment_size: 300,
            buffer_size: 1000,
            flags: HwParamFlags::empty(),
            src_quality: 0,
        };
        p.clamp_buffer(DEFAULT_MIN_PERIODS);
        // min_buffer = 900, but 1000 > 900 so base is 1000, round up to 1200.
        assert_eq!(p.buffer_size, 1200);
    }
}
