//! Mobile-overlay next-hop selection, shared by the client's DTN mode
//! and the gateway relay: both evaluate the same rule, just from their
//! own coordinates.

use crate::location::distance;
use std::collections::HashMap;
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

/// A beacon-derived neighbor: distance and hop count at the time of
/// the last KALIVE/GKALIVE heard from it.
#[derive(Debug, Clone, Copy)]
pub struct NeighborInfo {
    pub distance: f32,
    pub position: (f32, f32),
    pub last_seen: Instant,
    pub hops: u8,
}

/// address -> beacon-derived info. Regenerated (entries upserted) on
/// every beacon received; pruned by age.
pub type NeighborMap = HashMap<Ipv6Addr, NeighborInfo>;

/// Drops every entry in `map` whose `last_seen` is older than `max_age`.
pub fn prune_stale(map: &mut NeighborMap, now: Instant, max_age: Duration) {
    map.retain(|_, info| now.duration_since(info.last_seen) <= max_age);
}

fn closest(map: &NeighborMap) -> Option<(Ipv6Addr, NeighborInfo)> {
    map.iter()
        .map(|(addr, info)| (*addr, *info))
        .min_by(|a, b| {
            a.1.distance
                .partial_cmp(&b.1.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.hops.cmp(&b.1.hops))
        })
}

/// Closest gateway if directly adjacent (`hops == 0`); else the
/// closest mobile neighbor, when its distance scaled by 1.1 still
/// undercuts the closest gateway's distance and it hasn't exhausted
/// its hop budget; else the closest gateway; else `None` if nothing
/// has beaconed recently.
pub fn preferred_next_hop(gateways: &NeighborMap, mobiles: &NeighborMap) -> Option<Ipv6Addr> {
    let gateway = closest(gateways);

    if let Some((addr, info)) = gateway {
        if info.hops == 0 {
            return Some(addr);
        }
    }

    if let Some((mobile_addr, mobile)) = closest(mobiles) {
        let beats_gateway = match gateway {
            Some((_, gw)) => mobile.distance * 1.1 < gw.distance,
            None => true,
        };
        if beats_gateway && mobile.hops < 3 {
            return Some(mobile_addr);
        }
    }

    gateway.map(|(addr, _)| addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(distance: f32, hops: u8, age: Duration) -> NeighborInfo {
        NeighborInfo {
            distance,
            position: (0.0, 0.0),
            last_seen: Instant::now() - age,
            hops,
        }
    }

    #[test]
    fn s6_prefers_closer_mobile_neighbor_over_farther_gateway() {
        let mut gateways = NeighborMap::new();
        gateways.insert("fe80::1".parse().unwrap(), neighbor(30.0, 1, Duration::ZERO));
        let mut mobiles = NeighborMap::new();
        mobiles.insert("fe80::2".parse().unwrap(), neighbor(8.0, 2, Duration::ZERO));

        let preferred = preferred_next_hop(&gateways, &mobiles);
        assert_eq!(preferred, Some("fe80::2".parse().unwrap()));
    }

    #[test]
    fn s6_reverts_to_gateway_once_mobile_goes_stale() {
        let mut gateways = NeighborMap::new();
        let gw_addr: Ipv6Addr = "fe80::1".parse().unwrap();
        gateways.insert(gw_addr, neighbor(30.0, 1, Duration::ZERO));
        let mut mobiles = NeighborMap::new();
        mobiles.insert("fe80::2".parse().unwrap(), neighbor(8.0, 2, Duration::ZERO));

        let now = Instant::now();
        prune_stale(&mut mobiles, now + Duration::from_secs(11), Duration::from_secs(10));
        assert!(mobiles.is_empty());
        assert_eq!(preferred_next_hop(&gateways, &mobiles), Some(gw_addr));
    }

    #[test]
    fn directly_adjacent_gateway_is_always_preferred() {
        let mut gateways = NeighborMap::new();
        let gw_addr: Ipv6Addr = "fe80::1".parse().unwrap();
        gateways.insert(gw_addr, neighbor(2.0, 0, Duration::ZERO));
        let mut mobiles = NeighborMap::new();
        mobiles.insert("fe80::2".parse().unwrap(), neighbor(0.5, 1, Duration::ZERO));

        assert_eq!(preferred_next_hop(&gateways, &mobiles), Some(gw_addr));
    }

    #[test]
    fn distance_helper_still_euclidean() {
        assert_eq!(distance((0.0, 0.0), (6.0, 8.0)), 10.0);
    }
}
