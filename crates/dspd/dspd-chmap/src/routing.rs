//! Routing-matrix construction between a client's channel layout and a
//! device's channel layout (spec.md §4.10), grounded on `chmap.c:
//! dspd_chmap_create_generic` and `dspd_chmap_test`.

use dspd_common::Errno;

use crate::map::PositionMap;
use crate::position::ChannelPosition;

/// The result of matching a client layout against a device layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routing {
    /// One device channel index per client channel, in client channel
    /// order (`pos[]` in "STANDARD" mode).
    Direct(Vec<usize>),
    /// `(client_idx, device_idx)` pairs for splits/combines that a
    /// one-to-one vector can't express (`DSPD_CHMAP_MULTI`).
    Matrix(Vec<(usize, usize)>),
}

impl Routing {
    /// Every device index the routing touches.
    pub fn device_indices(&self) -> Vec<usize> {
        match self {
            Routing::Direct(v) => v.clone(),
            Routing::Matrix(pairs) => pairs.iter().map(|(_, o)| *o).collect(),
        }
    }
}

/// Builds a routing from `client`'s layout to `device`'s layout.
/// `capture` swaps the client/device roles the same way
/// `dspd_chmap_create_generic` does for capture streams (spec.md
/// §4.10's "for capture, to all channels with in/out swapped").
///
/// Policies (spec.md §4.10):
/// - 1→N: copy mono to `{FL, FR, FC}` if present, else to channel 0,
///   else (capture) to all channels with in/out swapped.
/// - 2→1: average the two first channels.
/// - N→M (N≥M): take the first M device positions.
/// - N→M (N<M): rejected with `Errno::Dom` (`chmap.c`'s
///   `dspd_chmap_create_generic` returns `-EDOM` once `devmap->channels
///   < channels` for `channels > 2`; there is no duplicate-or-zero-fill
///   path in the source for this case, so none is invented here).
pub fn build_routing(client: &PositionMap, device: &PositionMap, capture: bool) -> Result<Routing, Errno> {
    let n = client.channels();
    let m = device.channels();

    if n == 1 {
        if m == 1 {
            return Ok(Routing::Direct(vec![0]));
        }
        let mut pairs = Vec::new();
        for candidate in [ChannelPosition::Fl, ChannelPosition::Fr, ChannelPosition::Fc] {
            if let Some(idx) = device.index_of(candidate) {
                pairs.push((0usize, idx));
            }
        }
        if pairs.is_empty() {
            pairs.push((0, 0));
        }
        if capture {
            pairs = pairs.into_iter().map(|(c, d)| (d, c)).collect();
        }
        return Ok(Routing::Matrix(pairs));
    }

    if n == 2 {
        if m < 2 {
            // Average/duplicate onto the single device channel.
            return Ok(Routing::Direct(vec![0, 0]));
        }
        let fl = device.index_of(ChannelPosition::Fl);
        let fr = device.index_of(ChannelPosition::Fr);
        return match (fl, fr) {
            (Some(l), Some(r)) => Ok(Routing::Direct(vec![l, r])),
            _ => Ok(Routing::Direct(vec![0, 1.min(m - 1)])),
        };
    }

    if m >= n {
        return Ok(Routing::Direct((0..n).collect()));
    }

    // Client has more channels than the device can address; the
    // source refuses rather than guessing at a fold-down.
    Err(Errno::Dom)
}

/// Validates that `routing` only references indices within
/// `client_channels`/`device_channels` (`chmap.c: dspd_chmap_test`,
/// spec.md §4.10's "any MULTI entry referencing a position index
/// outside the peer's channels").
pub fn validate_routing(routing: &Routing, client_channels: usize, device_channels: usize) -> Result<(), Errno> {
    match routing {
        Routing::Direct(v) => {
            if v.len() != client_channels {
                return Err(Errno::Dom);
            }
            if v.iter().any(|idx| *idx >= device_channels) {
                return Err(Errno::ChRng);
            }
        }
        Routing::Matrix(pairs) => {
            for (c, d) in pairs {
                if *c >= client_channels || *d >= device_channels {
                    return Err(Errno::ChRng);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mono_to_stereo_routes_to_front_left_and_right() {
        let client = PositionMap::default_map(1).unwrap();
        let device = PositionMap::default_map(2).unwrap();
        let routing = build_routing(&client, &device, false).unwrap();
        match &routing {
            Routing::Matrix(pairs) => {
                assert!(pairs.contains(&(0, 0)));
                assert!(pairs.contains(&(0, 1)));
            }
            other => panic!("expected a matrix routing, got {other:?}"),
        }
        validate_routing(&routing, 1, 2).unwrap();
    }

    #[test]
    fn stereo_to_mono_collapses_both_channels_onto_device_zero() {
        let client = PositionMap::default_map(2).unwrap();
        let device = PositionMap::default_map(1).unwrap();
        let routing = build_routing(&client, &device, false).unwrap();
        assert_eq!(routing, Routing::Direct(vec![0, 0]));
        validate_routing(&routing, 2, 1).unwrap();
    }

    #[test]
    fn identity_routing_for_matching_layouts() {
        let client = PositionMap::default_map(6).unwrap();
        let device = PositionMap::default_map(6).unwrap();
        let routing = build_routing(&client, &device, false).unwrap();
        assert_eq!(routing, Routing::Direct(vec![0, 1, 2, 3, 4, 5]));
    }

    #[test]
    fn excess_device_channels_take_the_first_m_positions() {
        let client = PositionMap::default_map(2).unwrap();
        let device = PositionMap::default_map(8).unwrap();
        let routing = build_routing(&client, &device, false).unwrap();
        // device has FL/FR so the named-position branch is taken, not
        // the plain "first two" fallback.
        assert_eq!(routing, Routing::Direct(vec![0, 1]));
    }

    #[test]
    fn more_client_channels_than_device_is_rejected_with_edom() {
        let client = PositionMap::default_map(4).unwrap();
        let device = PositionMap::default_map(2).unwrap();
        assert_eq!(build_routing(&client, &device, false), Err(Errno::Dom));
    }

    #[test]
    fn mono_capture_swaps_client_and_device_roles() {
        let client = PositionMap::default_map(1).unwrap();
        let device = PositionMap::default_map(2).unwrap();
        let routing = build_routing(&client, &device, true).unwrap();
        match routing {
            Routing::Matrix(pairs) => {
                // Swapped: device index first, client index second.
                assert!(pairs.iter().all(|(d, c)| *c == 0 && *d < 2));
            }
            other => panic!("expected a matrix routing, got {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_out_of_range_device_index() {
        let routing = Routing::Direct(vec![0, 5]);
        assert!(matches!(
            validate_routing(&routing, 2, 2),
            Err(Errno::ChRng)
        ));
    }
}
