//! A channel's position layout (spec.md §4.10), grounded on `chmap.c`'s
//! `struct dspd_chmap` and `dspd_chmap_getdefault`.

use std::fmt;
use std::str::FromStr;

use dspd_common::Errno;

use crate::position::ChannelPosition;

/// The position assigned to each index of a PCM frame (e.g. index 0 is
/// front-left, index 1 is front-right, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionMap {
    positions: Vec<ChannelPosition>,
}

impl PositionMap {
    pub fn new(positions: Vec<ChannelPosition>) -> Result<Self, Errno> {
        let map = PositionMap { positions };
        map.validate()?;
        Ok(map)
    }

    /// spec.md §4.10: "reject maps whose channel count is 0 or > LAST".
    fn validate(&self) -> Result<(), Errno> {
        if self.positions.is_empty() {
            return Err(Errno::Dom);
        }
        if self.positions.len() as u32 > ChannelPosition::LAST {
            return Err(Errno::ChRng);
        }
        Ok(())
    }

    pub fn channels(&self) -> usize {
        self.positions.len()
    }

    pub fn positions(&self) -> &[ChannelPosition] {
        &self.positions
    }

    /// First index carrying `pos`, or `None` if it is not present
    /// (`chmap.c: dspd_chmap_index`).
    pub fn index_of(&self, pos: ChannelPosition) -> Option<usize> {
        self.positions.iter().position(|p| *p == pos)
    }

    /// A default sequential layout for `channels` channels (`chmap.c:
    /// dspd_pcm_chmap_get_default`). Mono gets the dedicated `MONO`
    /// position; everything else is `FL, FR, RL, RR, FC, ...` in
    /// declaration order. Returns `None` for `channels == 0` or more
    /// channels than positions exist, mirroring `get_default(0) ==
    /// NULL`.
    pub fn default_map(channels: usize) -> Option<Self> {
        if channels == 0 {
            return None;
        }
        if channels == 1 {
            return Some(PositionMap {
                positions: vec![ChannelPosition::Mono],
            });
        }
        if channels as u32 > ChannelPosition::MAX_SEQUENTIAL_CHANNELS {
            return None;
        }
        let base = ChannelPosition::Fl.as_u32();
        let positions = (0..channels as u32)
            .map(|i| ChannelPosition::from_u32(base + i).expect("within MAX_SEQUENTIAL_CHANNELS"))
            .collect();
        Some(PositionMap { positions })
    }

    /// A wildcard layout of `channels` unspecified positions
    /// (`chmap.h: dspd_pcm_chmap_any`): used by a caller that accepts
    /// whatever layout its peer offers, so routing only has to agree
    /// on channel count.
    pub fn any(channels: usize) -> Option<Self> {
        if channels == 0 || channels as u32 > ChannelPosition::LAST {
            return None;
        }
        Some(PositionMap {
            positions: vec![ChannelPosition::Unknown; channels],
        })
    }

    pub fn is_wildcard(&self) -> bool {
        self.positions.iter().all(|p| *p == ChannelPosition::Unknown)
    }
}

impl fmt::Display for PositionMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .positions
            .iter()
            .map(|p| p.abbrev())
            .collect::<Vec<_>>()
            .join(",");
        f.write_str(&joined)
    }
}

impl FromStr for PositionMap {
    type Err = Errno;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let positions = s
            .split(',')
            .map(|tok| tok.parse::<ChannelPosition>().map_err(|_| Errno::Dom))
            .collect::<Result<Vec<_>, _>>()?;
        PositionMap::new(positions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_rejects_zero_channels() {
        assert!(PositionMap::default_map(0).is_none());
    }

    #[test]
    fn default_mono_map_uses_mono_position() {
        let map = PositionMap::default_map(1).unwrap();
        assert_eq!(map.positions(), &[ChannelPosition::Mono]);
    }

    #[test]
    fn default_stereo_map_is_front_left_right() {
        let map = PositionMap::default_map(2).unwrap();
        assert_eq!(map.positions(), &[ChannelPosition::Fl, ChannelPosition::Fr]);
    }

    #[test]
    fn default_map_beyond_sequential_capacity_is_none() {
        assert!(PositionMap::default_map(1000).is_none());
    }

    #[test]
    fn any_builds_unknown_positions_and_reports_wildcard() {
        let map = PositionMap::any(4).unwrap();
        assert_eq!(map.channels(), 4);
        assert!(map.is_wildcard());
    }

    #[test]
    fn to_string_then_from_str_round_trips() {
        let map = PositionMap::default_map(6).unwrap();
        let text = map.to_string();
        let parsed: PositionMap = text.parse().unwrap();
        assert_eq!(parsed, map);
    }

    #[test]
    fn empty_map_is_rejected() {
        assert!(matches!(PositionMap::new(vec![]), Err(Errno::Dom)));
    }
}
