//! Mirror of one server-side mixer element (spec.md §3 `MixerElement`),
//! grounded on `ctlcli.c`'s `struct dspd_ctl_elem`/`dspd_mix_info`.

use dspd_common::ElemMask;

/// Value range an integer control accepts (`dspd_mix_range`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MixRange {
    pub min: i32,
    pub max: i32,
    pub step: i32,
}

/// One enumerated choice of an `ENUM`-flagged element
/// (`dspd_ctlcli_elem_get_enum_info`'s per-index result).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnumChoice {
    pub name: String,
}

/// `dspd_mix_info`: identity, capability flags, and the timestamps the
/// refresh algorithm uses to tell a value change from a remove+add
/// (spec.md §4.7: "matching tstamp+flags+name means a value-change
/// event").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MixInfo {
    pub name: String,
    pub flags: ElemMask,
    pub tstamp: u64,
    pub update_count: u32,
    pub hwinfo: u32,
}

impl MixInfo {
    /// Compares two infos the way `internal_refresh_cb`'s per-index
    /// comparison does, truncating the timestamp to 32 bits first when
    /// the device reports `TSTAMP_32BIT` (spec.md §D.3).
    pub fn same_identity(&self, other: &MixInfo, tstamp_32bit: bool) -> bool {
        let (a, b) = if tstamp_32bit {
            (self.tstamp as u32 as u64, other.tstamp as u32 as u64)
        } else {
            (self.tstamp, other.tstamp)
        };
        self.name == other.name && self.flags == other.flags && a == b
    }
}

/// `dspd_ctl_elem`: one dense slot of the client's local mirror
/// (spec.md §3: "the client holds a dense array mirroring the server's
/// set of elements").
#[derive(Debug, Clone, Default)]
pub struct MixerElement {
    pub info: MixInfo,
    /// Index on the server side; differs from this slot's own index
    /// only while a refresh is shuffling the mirror (not currently
    /// reordered — kept for parity with the source's field).
    pub real_element_index: u32,
    pub removed: bool,
    /// Set once this slot has received at least one `ELEM_INFO` reply.
    pub initialized: bool,
}
