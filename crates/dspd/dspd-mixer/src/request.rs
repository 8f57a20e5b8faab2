//! Control request codes and wire payloads for the mixer control client
//! (spec.md §4.7), grounded on `ctlcli.c`'s `DSPD_SCTL_SERVER_MIXER_*`
//! request codes and their `struct dspd_mix_info`/`dspd_mix_val`/
//! `dspd_mix_range` payloads.

use dspd_common::{ElemMask, EventMask};

use crate::element::{EnumChoice, MixInfo, MixRange};

/// One mixer control request issued over the transport
/// (`AioContext::sync_ctl`'s `req` argument).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MixerRequest {
    /// `DSPD_SCTL_SERVER_MIXER_ELEM_COUNT`.
    ElemCount = 50,
    /// `DSPD_SCTL_SERVER_MIXER_ELEM_INFO`.
    ElemInfo = 51,
    /// `DSPD_SCTL_SERVER_MIXER_GETVAL`.
    GetVal = 52,
    /// `DSPD_SCTL_SERVER_MIXER_SETVAL`.
    SetVal = 53,
    /// `DSPD_SCTL_SERVER_MIXER_GETRANGE`.
    GetRange = 54,
    /// Enum choice lookup (source overloads `GETRANGE`'s request code
    /// for this; kept distinct here since nothing requires reusing it).
    GetEnumInfo = 55,
}

impl MixerRequest {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

/// `DSPD_SOCKSRV_REQ_EVENT`: the socket-server-level request that
/// (un)subscribes this context to mixer change events (spec.md §4.7
/// `subscribe`).
pub const SOCKSRV_REQ_EVENT: u32 = 1;

/// `DSPD_STREAM_SOCKSRV`: the pseudo-stream id used for requests
/// addressed to the socket server itself rather than a bound device.
pub const STREAM_SOCKSRV: i32 = -1;

/// Sentinel `elem` value in a `ControlEvent` meaning "the device itself
/// was removed", not any one element (`SS_DEV_REMOVE` in the source).
pub const SS_DEV_REMOVE: u32 = u32::MAX;

/// `DSPD_EVENT_SETFLAGS` payload requesting (un)subscription
/// (`dspd_ctlcli_subscribe`'s `op->in.evt`).
pub fn encode_subscribe_event(subscribe: bool, device_is_server: bool) -> Vec<u8> {
    const EVENT_SETFLAGS: u32 = 2;
    const FLAG_CONTROL: u32 = 1 << 0;
    const FLAG_VCTRL: u32 = 1 << 1;
    let mut flags = 0u32;
    if subscribe {
        flags |= FLAG_CONTROL;
        if device_is_server {
            flags |= FLAG_VCTRL;
        }
    }
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&EVENT_SETFLAGS.to_le_bytes());
    buf.extend_from_slice(&flags.to_le_bytes());
    buf
}

pub fn decode_subscribe_reply(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes(buf[0..4].try_into().ok()?))
}

/// `DSPD_SCTL_SERVER_MIXER_ELEM_COUNT` reply payload.
pub fn decode_elem_count(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes(buf[0..4].try_into().ok()?))
}

/// `ELEM_INFO` request payload: the index to fetch (`-1` fetches
/// nothing useful; callers always pass a valid index here, unlike the
/// source's signed `pending_element_pos` convention).
pub fn encode_elem_info_request(index: u32) -> Vec<u8> {
    index.to_le_bytes().to_vec()
}

const MIX_NAME_LEN: usize = 44;
pub const MIX_INFO_WIRE_SIZE: usize = MIX_NAME_LEN + 4 + 8 + 4 + 4;

/// `struct dspd_mix_info` on the wire: fixed-length name, capability
/// flags, value-change timestamp, update counter, and the server's
/// opaque hardware-element index.
pub fn encode_mix_info(info: &MixInfo) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIX_INFO_WIRE_SIZE);
    let mut name_bytes = [0u8; MIX_NAME_LEN];
    let src = info.name.as_bytes();
    let n = src.len().min(MIX_NAME_LEN);
    name_bytes[..n].copy_from_slice(&src[..n]);
    buf.extend_from_slice(&name_bytes);
    buf.extend_from_slice(&info.flags.bits().to_le_bytes());
    buf.extend_from_slice(&info.tstamp.to_le_bytes());
    buf.extend_from_slice(&info.update_count.to_le_bytes());
    buf.extend_from_slice(&info.hwinfo.to_le_bytes());
    buf
}

pub fn decode_mix_info(buf: &[u8]) -> Option<MixInfo> {
    if buf.len() < MIX_INFO_WIRE_SIZE {
        return None;
    }
    let name_bytes = &buf[0..MIX_NAME_LEN];
    let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(MIX_NAME_LEN);
    let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
    let mut off = MIX_NAME_LEN;
    let flags = ElemMask::from_bits_truncate(u32::from_le_bytes(buf[off..off + 4].try_into().ok()?));
    off += 4;
    let tstamp = u64::from_le_bytes(buf[off..off + 8].try_into().ok()?);
    off += 8;
    let update_count = u32::from_le_bytes(buf[off..off + 4].try_into().ok()?);
    off += 4;
    let hwinfo = u32::from_le_bytes(buf[off..off + 4].try_into().ok()?);
    Some(MixInfo {
        name,
        flags,
        tstamp,
        update_count,
        hwinfo,
    })
}

bitflags::bitflags! {
    /// `DSPD_CTRLF_*` flags carried with a get/set-value request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CtrlFlags: u32 {
        /// Scale the value into a 0-100 percentage on the wire
        /// (`dspd_ctlcli_set_scale_pct`).
        const SCALE_PCT    = 1 << 0;
        /// Truncate `tstamp` comparisons to 32 bits across refresh
        /// (spec.md §9 Open Question 3 / SPEC_FULL.md §D.3).
        const TSTAMP_32BIT = 1 << 1;
    }
}

pub const MIX_VAL_REQUEST_WIRE_SIZE: usize = 28;

/// `struct dspd_mix_val` request payload (get/set a channel's value).
pub fn encode_mix_val_request(index: u32, elem_type: ElemMask, flags: CtrlFlags, channel: i32, value: i32, tstamp: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIX_VAL_REQUEST_WIRE_SIZE);
    buf.extend_from_slice(&index.to_le_bytes());
    buf.extend_from_slice(&elem_type.bits().to_le_bytes());
    buf.extend_from_slice(&flags.bits().to_le_bytes());
    buf.extend_from_slice(&channel.to_le_bytes());
    buf.extend_from_slice(&value.to_le_bytes());
    buf.extend_from_slice(&tstamp.to_le_bytes());
    buf
}

pub const MIX_VAL_REPLY_WIRE_SIZE: usize = 20;

/// `struct dspd_mix_val` reply payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MixValReply {
    pub index: u32,
    pub value: i32,
    pub update_count: u32,
    pub tstamp: u64,
}

pub fn decode_mix_val_reply(buf: &[u8]) -> Option<MixValReply> {
    if buf.len() < MIX_VAL_REPLY_WIRE_SIZE {
        return None;
    }
    Some(MixValReply {
        index: u32::from_le_bytes(buf[0..4].try_into().ok()?),
        value: i32::from_le_bytes(buf[4..8].try_into().ok()?),
        update_count: u32::from_le_bytes(buf[8..12].try_into().ok()?),
        tstamp: u64::from_le_bytes(buf[12..20].try_into().ok()?),
    })
}

pub fn encode_mix_range(r: &MixRange) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&r.min.to_le_bytes());
    buf.extend_from_slice(&r.max.to_le_bytes());
    buf.extend_from_slice(&r.step.to_le_bytes());
    buf
}

pub fn decode_mix_range(buf: &[u8]) -> Option<MixRange> {
    if buf.len() < 12 {
        return None;
    }
    Some(MixRange {
        min: i32::from_le_bytes(buf[0..4].try_into().ok()?),
        max: i32::from_le_bytes(buf[4..8].try_into().ok()?),
        step: i32::from_le_bytes(buf[8..12].try_into().ok()?),
    })
}

/// `ELEM_GET_ENUM_INFO` request payload: `{elem_idx, enum_idx}`.
pub fn encode_enum_info_request(elem_index: u32, enum_index: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&elem_index.to_le_bytes());
    buf.extend_from_slice(&enum_index.to_le_bytes());
    buf
}

/// The reply reuses `struct dspd_mix_info`'s name field to carry the
/// enumerated choice's label (source: `dspd_ctlcli_elem_get_enum_info`
/// decodes the same `dspd_mix_info` shape).
pub fn decode_enum_choice(buf: &[u8]) -> Option<EnumChoice> {
    let info = decode_mix_info(buf)?;
    Some(EnumChoice { name: info.name })
}

/// `struct socksrv_ctl_event` payload carried by a `Control`
/// [`dspd_common::EventCode`] frame.
pub fn decode_control_event(buf: &[u8]) -> Option<(u32, u32, EventMask)> {
    if buf.len() < 12 {
        return None;
    }
    let card = u32::from_le_bytes(buf[0..4].try_into().ok()?);
    let elem = u32::from_le_bytes(buf[4..8].try_into().ok()?);
    let mask = EventMask::from_bits_truncate(u32::from_le_bytes(buf[8..12].try_into().ok()?));
    Some((card, elem, mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_info_round_trip() {
        let info = MixInfo {
            name: "Master Playback Volume".to_string(),
            flags: ElemMask::PVOL | ElemMask::PVJOINED,
            tstamp: 0xdead_beef_0000_0001,
            update_count: 7,
            hwinfo: 3,
        };
        let buf = encode_mix_info(&info);
        assert_eq!(buf.len(), MIX_INFO_WIRE_SIZE);
        assert_eq!(decode_mix_info(&buf), Some(info));
    }

    #[test]
    fn name_longer_than_wire_field_is_truncated_not_panicking() {
        let info = MixInfo {
            name: "x".repeat(200),
            flags: ElemMask::empty(),
            tstamp: 0,
            update_count: 0,
            hwinfo: 0,
        };
        let buf = encode_mix_info(&info);
        let back = decode_mix_info(&buf).unwrap();
        assert_eq!(back.name.len(), MIX_NAME_LEN);
    }

    #[test]
    fn control_event_round_trip() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&EventMask::VALUE.bits().to_le_bytes());
        assert_eq!(decode_control_event(&buf), Some((7, 3, EventMask::VALUE)));
    }
}
