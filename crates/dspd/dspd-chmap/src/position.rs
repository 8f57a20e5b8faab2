//! Channel positions (spec.md §4.10), grounded on `chmap.h`'s
//! `enum dspd_pcm_chmap_positions`.

use std::fmt;
use std::str::FromStr;

/// A single logical speaker/microphone position. Order matches the
/// original enum so `as u32` stays stable across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ChannelPosition {
    Unknown = 0,
    Na,
    Mono,
    Fl,
    Fr,
    Rl,
    Rr,
    Fc,
    Lfe,
    Sl,
    Sr,
    Rc,
    Flc,
    Frc,
    Rlc,
    Rrc,
    Flw,
    Frw,
    Flh,
    Fch,
    Frh,
    Tc,
    Tfl,
    Tfr,
    Tfc,
    Trl,
    Trr,
    Trc,
    Tflc,
    Tfrc,
    Tsl,
    Tsr,
    Llfe,
    Rlfe,
    Bc,
    Blc,
    Brc,
}

impl ChannelPosition {
    /// Highest defined position value (spec.md "reject maps ... `>
    /// LAST`").
    pub const LAST: u32 = ChannelPosition::Brc as u32;

    /// Number of distinct front/surround positions available for a
    /// sequential default layout (`LAST - FL + 1`, `chmap.h`'s
    /// `DSPD_CHMAP_MAXCHAN`).
    pub const MAX_SEQUENTIAL_CHANNELS: u32 = ChannelPosition::LAST - ChannelPosition::Fl as u32 + 1;

    const ALL: &'static [ChannelPosition] = &[
        ChannelPosition::Unknown,
        ChannelPosition::Na,
        ChannelPosition::Mono,
        ChannelPosition::Fl,
        ChannelPosition::Fr,
        ChannelPosition::Rl,
        ChannelPosition::Rr,
        ChannelPosition::Fc,
        ChannelPosition::Lfe,
        ChannelPosition::Sl,
        ChannelPosition::Sr,
        ChannelPosition::Rc,
        ChannelPosition::Flc,
        ChannelPosition::Frc,
        ChannelPosition::Rlc,
        ChannelPosition::Rrc,
        ChannelPosition::Flw,
        ChannelPosition::Frw,
        ChannelPosition::Flh,
        ChannelPosition::Fch,
        ChannelPosition::Frh,
        ChannelPosition::Tc,
        ChannelPosition::Tfl,
        ChannelPosition::Tfr,
        ChannelPosition::Tfc,
        ChannelPosition::Trl,
        ChannelPosition::Trr,
        ChannelPosition::Trc,
        ChannelPosition::Tflc,
        ChannelPosition::Tfrc,
        ChannelPosition::Tsl,
        ChannelPosition::Tsr,
        ChannelPosition::Llfe,
        ChannelPosition::Rlfe,
        ChannelPosition::Bc,
        ChannelPosition::Blc,
        ChannelPosition::Brc,
    ];

    pub fn from_u32(raw: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|p| *p as u32 == raw)
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Short name used on the wire and in config files (`chmap.c:
    /// dspd_pcm_chmap_channel_name(pos, abbrev = true)`).
    pub fn abbrev(self) -> &'static str {
        match self {
            ChannelPosition::Unknown => "UNKNOWN",
            ChannelPosition::Na => "NA",
            ChannelPosition::Mono => "MONO",
            ChannelPosition::Fl => "FL",
            ChannelPosition::Fr => "FR",
            ChannelPosition::Rl => "RL",
            ChannelPosition::Rr => "RR",
            ChannelPosition::Fc => "FC",
            ChannelPosition::Lfe => "LFE",
            ChannelPosition::Sl => "SL",
            ChannelPosition::Sr => "SR",
            ChannelPosition::Rc => "RC",
            ChannelPosition::Flc => "FLC",
            ChannelPosition::Frc => "FRC",
            ChannelPosition::Rlc => "RLC",
            ChannelPosition::Rrc => "RRC",
            ChannelPosition::Flw => "FLW",
            ChannelPosition::Frw => "FRW",
            ChannelPosition::Flh => "FLH",
            ChannelPosition::Fch => "FCH",
            ChannelPosition::Frh => "FRH",
            ChannelPosition::Tc => "TC",
            ChannelPosition::Tfl => "TFL",
            ChannelPosition::Tfr => "TFR",
            ChannelPosition::Tfc => "TFC",
            ChannelPosition::Trl => "TRL",
            ChannelPosition::Trr => "TRR",
            ChannelPosition::Trc => "TRC",
            ChannelPosition::Tflc => "TFLC",
            ChannelPosition::Tfrc => "TFRC",
            ChannelPosition::Tsl => "TSL",
            ChannelPosition::Tsr => "TSR",
            ChannelPosition::Llfe => "LLFE",
            ChannelPosition::Rlfe => "RLFE",
            ChannelPosition::Bc => "BC",
            ChannelPosition::Blc => "BLC",
            ChannelPosition::Brc => "BRC",
        }
    }

    /// Long name for diagnostics (`chmap_channel_name(pos, abbrev =
    /// false)`).
    pub fn long_name(self) -> &'static str {
        match self {
            ChannelPosition::Unknown => "unspecified",
            ChannelPosition::Na => "silent",
            ChannelPosition::Mono => "mono",
            ChannelPosition::Fl => "front left",
            ChannelPosition::Fr => "front right",
            ChannelPosition::Rl => "rear left",
            ChannelPosition::Rr => "rear right",
            ChannelPosition::Fc => "front center",
            ChannelPosition::Lfe => "LFE",
            ChannelPosition::Sl => "side left",
            ChannelPosition::Sr => "side right",
            ChannelPosition::Rc => "rear center",
            ChannelPosition::Flc => "front left center",
            ChannelPosition::Frc => "front right center",
            ChannelPosition::Rlc => "rear left center",
            ChannelPosition::Rrc => "rear right center",
            ChannelPosition::Flw => "front left wide",
            ChannelPosition::Frw => "front right wide",
            ChannelPosition::Flh => "front left high",
            ChannelPosition::Fch => "front center high",
            ChannelPosition::Frh => "front right high",
            ChannelPosition::Tc => "top center",
            ChannelPosition::Tfl => "top front left",
            ChannelPosition::Tfr => "top front right",
            ChannelPosition::Tfc => "top front center",
            ChannelPosition::Trl => "top rear left",
            ChannelPosition::Trr => "top rear right",
            ChannelPosition::Trc => "top rear center",
            ChannelPosition::Tflc => "top front left center",
            ChannelPosition::Tfrc => "top front right center",
            ChannelPosition::Tsl => "top side left",
            ChannelPosition::Tsr => "top side right",
            ChannelPosition::Llfe => "left LFE",
            ChannelPosition::Rlfe => "right LFE",
            ChannelPosition::Bc => "bottom center",
            ChannelPosition::Blc => "bottom left center",
            ChannelPosition::Brc => "bottom right center",
        }
    }
}

impl fmt::Display for ChannelPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.abbrev())
    }
}

impl FromStr for ChannelPosition {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.abbrev() == upper)
            .ok_or(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_position_round_trips_through_its_abbreviation() {
        for pos in ChannelPosition::ALL.iter().copied() {
            let parsed: ChannelPosition = pos.abbrev().parse().unwrap();
            assert_eq!(parsed, pos);
        }
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("fl".parse::<ChannelPosition>().unwrap(), ChannelPosition::Fl);
    }

    #[test]
    fn unknown_token_does_not_parse() {
        assert!("NOT_A_CHANNEL".parse::<ChannelPosition>().is_err());
    }

    #[test]
    fn last_matches_highest_variant() {
        assert_eq!(ChannelPosition::LAST, ChannelPosition::Brc as u32);
        assert_eq!(ChannelPosition::from_u32(ChannelPosition::LAST), Some(ChannelPosition::Brc));
    }
}
