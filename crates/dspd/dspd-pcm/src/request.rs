//! Control request codes carried in a frame's `cmd` field (spec.md
//! §4.6.6 control operations), grounded on the `dspd_rclient_*`
//! operation surface in `rclient.h`.

/// One control operation the PCM client runtime issues over the
/// transport (`AioContext::sync_ctl`'s `req` argument).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PcmRequest {
    /// `dspd_rclient_connect`: resolve a device and bind a stream to it.
    Connect = 1,
    /// `dspd_rclient_set_hw_params`.
    SetHwParams = 2,
    /// `dspd_rclient_set_sw_params`.
    SetSwParams = 3,
    /// `dspd_rclient_ctl(DSPD_SCTL_CLIENT_START)`.
    Start = 4,
    /// Stop the stream (halts the device side of the ring).
    Stop = 5,
    /// `dspd_rclient_ctl` pause/unpause.
    Pause = 6,
    /// `dspd_rclient_drain`.
    Drain = 7,
    /// Transitions `RUNNING|XRUN → PREPARED`.
    Prepare = 8,
    /// Resets pointers and counters back to a freshly-opened state.
    Reset = 9,
    /// `dspd_rclient_set_read_ptr`.
    SetReadPtr = 10,
    /// `dspd_rclient_set_write_ptr`.
    SetWritePtr = 11,
    /// `dspd_rclient_status`/`dspd_rclient_fast_status`.
    GetStatus = 12,
    /// `dspd_rclient_detach`.
    Disconnect = 13,
}

impl PcmRequest {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// Wire payload encodings for the control requests above. Each function
/// pairs with a `decode_*` the far end (or, for replies, this end) uses;
/// sizes are fixed so neither side needs a length prefix beyond the
/// frame header's own `total_len`.
use dspd_common::{ClientInfo, HwParamFlags, HwParams, PcmStatus, SampleFormat, SwParams};

fn format_code(f: SampleFormat) -> u8 {
    match f {
        SampleFormat::S16Le => 0,
        SampleFormat::S32Le => 1,
        SampleFormat::Float32Le => 2,
    }
}

fn format_from_code(c: u8) -> Option<SampleFormat> {
    Some(match c {
        0 => SampleFormat::S16Le,
        1 => SampleFormat::S32Le,
        2 => SampleFormat::Float32Le,
        _ => return None,
    })
}

/// `Connect` request payload: client credentials plus the device name
/// (spec.md §4.6.1: "publishes client info (uid/gid/pid)").
pub fn encode_connect(info: ClientInfo, device: &str) -> Vec<u8> {
    let name = device.as_bytes();
    let mut buf = Vec::with_capacity(12 + 4 + name.len());
    buf.extend_from_slice(&info.uid.to_le_bytes());
    buf.extend_from_slice(&info.gid.to_le_bytes());
    buf.extend_from_slice(&info.pid.to_le_bytes());
    buf.extend_from_slice(&(name.len() as u32).to_le_bytes());
    buf.extend_from_slice(name);
    buf
}

pub const HWPARAMS_WIRE_SIZE: usize = 19;

/// `SetHwParams` request/reply payload (spec.md §4.6.2).
pub fn encode_hwparams(p: &HwParams) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HWPARAMS_WIRE_SIZE);
    buf.extend_from_slice(&p.rate.to_le_bytes());
    buf.push(format_code(p.format));
    buf.push(p.channels);
    buf.extend_from_slice(&p.fragment_size.to_le_bytes());
    buf.extend_from_slice(&p.buffer_size.to_le_bytes());
    buf.extend_from_slice(&p.flags.bits().to_le_bytes());
    buf.push(p.src_quality);
    buf
}

pub fn decode_hwparams(buf: &[u8]) -> Option<HwParams> {
    if buf.len() < HWPARAMS_WIRE_SIZE {
        return None;
    }
    Some(HwParams {
        rate: u32::from_le_bytes(buf[0..4].try_into().ok()?),
        format: format_from_code(buf[4])?,
        channels: buf[5],
        fragment_size: u32::from_le_bytes(buf[6..10].try_into().ok()?),
        buffer_size: u32::from_le_bytes(buf[10..14].try_into().ok()?),
        flags: HwParamFlags::from_bits_truncate(u32::from_le_bytes(buf[14..18].try_into().ok()?)),
        src_quality: buf[18],
    })
}

pub const SWPARAMS_WIRE_SIZE: usize = 12;

/// `SetSwParams` request payload (spec.md §4.6.3).
pub fn encode_swparams(p: &SwParams) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SWPARAMS_WIRE_SIZE);
    buf.extend_from_slice(&p.avail_min.to_le_bytes());
    buf.extend_from_slice(&p.start_threshold.to_le_bytes());
    buf.extend_from_slice(&p.stop_threshold.to_le_bytes());
    buf
}

pub fn decode_swparams(buf: &[u8]) -> Option<SwParams> {
    if buf.len() < SWPARAMS_WIRE_SIZE {
        return None;
    }
    Some(SwParams {
        avail_min: u32::from_le_bytes(buf[0..4].try_into().ok()?),
        start_threshold: u32::from_le_bytes(buf[4..8].try_into().ok()?),
        stop_threshold: u32::from_le_bytes(buf[8..12].try_into().ok()?),
    })
}

/// `SetReadPtr`/`SetWritePtr` request payload: the client's current
/// `appl_ptr` (spec.md §4.6.4 resynchronization).
pub fn encode_appl_ptr(ptr: u64) -> Vec<u8> {
    ptr.to_le_bytes().to_vec()
}

pub const STATUS_WIRE_SIZE: usize = 52;

/// `GetStatus` reply payload (spec.md §4.6.5, §6 `PcmStatus` mailbox
/// layout — the same fields, carried over the wire instead of mmap for
/// transports with no shared memory).
pub fn encode_status(s: &PcmStatus) -> Vec<u8> {
    let mut buf = Vec::with_capacity(STATUS_WIRE_SIZE);
    buf.extend_from_slice(&s.appl_ptr.to_le_bytes());
    buf.extend_from_slice(&s.hw_ptr.to_le_bytes());
    buf.extend_from_slice(&s.tstamp.to_le_bytes());
    buf.extend_from_slice(&s.trigger_tstamp.to_le_bytes());
    buf.extend_from_slice(&s.delay_tstamp.to_le_bytes());
    buf.extend_from_slice(&s.avail.to_le_bytes());
    buf.extend_from_slice(&s.delay.to_le_bytes());
    buf.extend_from_slice(&s.error.to_le_bytes());
    buf
}

pub fn decode_status(buf: &[u8]) -> Option<PcmStatus> {
    if buf.len() < STATUS_WIRE_SIZE {
        return None;
    }
    Some(PcmStatus {
        appl_ptr: u64::from_le_bytes(buf[0..8].try_into().ok()?),
        hw_ptr: u64::from_le_bytes(buf[8..16].try_into().ok()?),
        tstamp: u64::from_le_bytes(buf[16..24].try_into().ok()?),
        trigger_tstamp: u64::from_le_bytes(buf[24..32].try_into().ok()?),
        delay_tstamp: u64::from_le_bytes(buf[32..40].try_into().ok()?),
        avail: u32::from_le_bytes(buf[40..44].try_into().ok()?),
        delay: i32::from_le_bytes(buf[44..48].try_into().ok()?),
        error: i32::from_le_bytes(buf[48..52].try_into().ok()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hwparams_round_trip() {
        let p = HwParams {
            rate: 48_000,
            format: SampleFormat::Float32Le,
            channels: 2,
            fragment_size: 256,
            buffer_size: 1024,
            flags: HwParamFlags::SHM | HwParamFlags::RESAMPLE,
            src_quality: 3,
        };
        let buf = encode_hwparams(&p);
        assert_eq!(decode_hwparams(&buf), Some(p));
    }

    #[test]
    fn swparams_round_trip() {
        let p = SwParams {
            avail_min: 64,
            start_threshold: 128,
            stop_threshold: 4096,
        };
        let buf = encode_swparams(&p);
        assert_eq!(decode_swparams(&buf), Some(p));
    }

    #[test]
    fn connect_payload_carries_device_name() {
        let info = ClientInfo { uid: 1000, gid: 1000, pid: 42 };
        let buf = encode_connect(info, "default");
        assert_eq!(&buf[12..16], &7u32.to_le_bytes());
        assert_eq!(&buf[16..], b"default");
    }
}
