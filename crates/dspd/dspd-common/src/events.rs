//! Out-of-band event payloads (spec.md §4.5.2 "server-initiated events",
//! §4.9 mixer element change notification).

use bitflags::bitflags;

/// Event codes carried in the `cmd` field of an unsolicited reply frame
/// (spec.md §4.5.2: "HOTPLUG, SETFLAGS, CONTROL").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventCode {
    /// A device appeared or disappeared.
    Hotplug = 1,
    /// A stream's negotiated flags changed out from under the client.
    SetFlags = 2,
    /// A mixer element changed; payload is a `ControlEvent`.
    Control = 3,
}

impl EventCode {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => EventCode::Hotplug,
            2 => EventCode::SetFlags,
            3 => EventCode::Control,
            _ => return None,
        })
    }
}

/// Payload of a `Control` event (spec.md §4.9: "mixer element change
/// notification carries card/elem/mask").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlEvent {
    pub card: u32,
    pub elem: u32,
    pub mask: EventMask,
}

bitflags! {
    /// `DSPD_CTL_EVENT_MASK_*`: what changed about one mixer element
    /// (spec.md §6: "mask is a bitfield drawn from {ADD, REMOVE, VALUE,
    /// INFO, OVERFLOW}"). Distinct from [`ElemMask`], which describes an
    /// element's *capabilities* rather than what just changed about it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u32 {
        const ADD      = 1 << 0;
        const REMOVE   = 1 << 1;
        const VALUE    = 1 << 2;
        const INFO     = 1 << 3;
        const OVERFLOW = 1 << 4;
    }
}

bitflags! {
    /// Mixer element capability/state bits (spec.md §6 mixer element
    /// table: PVOL/CVOL/PMONO/CMONO/PSWITCH/CSWITCH/...).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ElemMask: u32 {
        const PVOL        = 1 << 0;
        const CVOL        = 1 << 1;
        const PMONO       = 1 << 2;
        const CMONO       = 1 << 3;
        const PSWITCH     = 1 << 4;
        const CSWITCH     = 1 << 5;
        const PDB         = 1 << 6;
        const CDB         = 1 << 7;
        const COMMSWITCH  = 1 << 8;
        const COMMVOL     = 1 << 9;
        const PVJOINED    = 1 << 10;
        const CVJOINED    = 1 << 11;
        const PSWJOINED   = 1 << 12;
        const CSWJOINED   = 1 << 13;
        const CSWEXCL     = 1 << 14;
        const ENUM        = 1 << 15;
        const PENUM       = 1 << 16;
        const CENUM       = 1 << 17;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_code_roundtrip() {
        assert_eq!(EventCode::from_raw(3), Some(EventCode::Control));
        assert_eq!(EventCode::from_raw(0), None);
    }

    #[test]
    fn elem_mask_joined_bits_distinct_from_volume_bits() {
        let m = ElemMask::PVOL | ElemMask::PVJOINED;
        assert!(m.contains(ElemMask::PVOL));
        assert!(m.contains(ElemMask::PVJOINED));
        assert!(!m.contains(ElemMask::CVOL));
    }

    #[test]
    fn event_mask_is_distinct_namespace_from_elem_mask() {
        // ADD and PVOL share bit 0 numerically but are different types;
        // this would not compile if EventMask and ElemMask were the same type.
        assert_eq!(EventMask::ADD.bits(), ElemMask::PVOL.bits());
        let overflow_and_remove = EventMask::OVERFLOW | EventMask::REMOVE;
        assert!(!overflow_and_remove.contains(EventMask::ADD));
    }
}
