//! Longest-prefix-match IP router: selects the best egress NIC for a
//! destination address from a set of registered CIDR routes.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;

/// Route metrics, ascending preference.
pub mod metric {
    pub const CONNECTED: u32 = 0;
    pub const LOCAL: u32 = 1;
    pub const STATIC: u32 = 2;
    pub const REMOTE: u32 = 3;
}

/// A single NIC's claim on a CIDR.
pub struct RouteInfo {
    pub nic_id: u64,
    pub nic_name: String,
    pub metric: u32,
    match_count: AtomicU64,
}

/// All route entries registered for one CIDR.
#[derive(Default)]
pub struct RouteSet {
    pub routes: Vec<RouteInfo>,
}

impl RouteSet {
    fn find_best(&self) -> Option<&RouteInfo> {
        self.routes.iter().min_by(|a, b| {
            a.metric
                .cmp(&b.metric)
                .then(a.match_count.load(Ordering::Relaxed).cmp(&b.match_count.load(Ordering::Relaxed)))
        })
    }
}

/// A JSON-friendly snapshot of one CIDR's route set, for the `routesN_list`
/// admin command.
#[derive(Serialize)]
pub struct RouteSnapshot {
    pub network: String,
    pub routes: Vec<RouteSnapshotEntry>,
}

#[derive(Serialize)]
pub struct RouteSnapshotEntry {
    pub nic_id: u64,
    pub nic_name: String,
    pub metric: u32,
    pub match_count: u64,
}

/// Per-IP-version router: an [`crate::iptrie::IpTrie`] of [`RouteSet`]s plus
/// a distinguished default route, behind a single reader/writer lock.
pub struct Router {
    inner: RwLock<RouterInner>,
    max_bits: u32,
}

struct RouterInner {
    routes: crate::iptrie::IpTrie<(IpAddr, u32, RouteSet)>,
    default_route: RouteSet,
}

impl Router {
    /// `max_bits` is 32 for IPv4, 128 for IPv6.
    pub fn new(max_bits: u32) -> Self {
        Self {
            inner: RwLock::new(RouterInner {
                routes: crate::iptrie::IpTrie::new(max_bits),
                default_route: RouteSet::default(),
            }),
            max_bits,
        }
    }

    /// Register `nic_id` for `network/mask_len` at `metric`; a duplicate
    /// `nic_id` on the same prefix is dropped silently.
    pub fn register_route(&self, network: IpAddr, mask_len: u32, nic_id: u64, nic_name: &str, metric: u32) {
        let mut guard = self.inner.write();
        let route_set = if mask_len == 0 {
            &mut guard.default_route
        } else {
            let (_, _, set) = guard
                .routes
                .get_or_insert_exact_with(network, mask_len, || (network, mask_len, RouteSet::default()));
            set
        };

        if route_set.routes.iter().any(|r| r.nic_id == nic_id) {
            tracing::warn!(nic_id, "duplicate route registration");
            return;
        }

        route_set.routes.push(RouteInfo {
            nic_id,
            nic_name: nic_name.to_string(),
            metric,
            match_count: AtomicU64::new(0),
        });
    }

    /// Remove `nic_id`'s claim on `network/mask_len`; drop the trie node
    /// once its route set is empty.
    pub fn remove_route(&self, network: IpAddr, mask_len: u32, nic_id: u64) {
        let mut guard = self.inner.write();
        if mask_len == 0 {
            guard.default_route.routes.retain(|r| r.nic_id != nic_id);
            return;
        }
        let empty = if let Some((_, _, set)) = guard.routes.search_exact_mut(network, mask_len) {
            set.routes.retain(|r| r.nic_id != nic_id);
            set.routes.is_empty()
        } else {
            false
        };
        if empty {
            guard.routes.remove(network, mask_len);
        }
    }

    /// Longest-prefix lookup; falls back to the default route; picks the
    /// lowest-metric entry (ties broken by the lowest match count) and
    /// bumps its counter. Returns 0 if no route matches.
    pub fn get_destination(&self, ip: IpAddr) -> u64 {
        let guard = self.inner.read();
        let set = guard
            .routes
            .search(ip)
            .map(|(_, _, set)| set)
            .unwrap_or(&guard.default_route);
        match set.find_best() {
            Some(best) => {
                best.match_count.fetch_add(1, Ordering::Relaxed);
                best.nic_id
            }
            None => 0,
        }
    }

    /// Snapshot every registered route for the admin `list` command.
    pub fn list(&self) -> Vec<RouteSnapshot> {
        let guard = self.inner.read();
        let mut out = Vec::new();
        guard.routes.iterate(|(network, mask_len, set)| {
            out.push(snapshot(&format!("{network}/{mask_len}"), set));
        });
        if !guard.default_route.routes.is_empty() {
            out.push(snapshot("0.0.0.0/0", &guard.default_route));
        }
        out
    }

    /// Address-family width this router was constructed with.
    pub fn max_bits(&self) -> u32 {
        self.max_bits
    }
}

fn snapshot(network: &str, set: &RouteSet) -> RouteSnapshot {
    RouteSnapshot {
        network: network.to_string(),
        routes: set
            .routes
            .iter()
            .map(|r| RouteSnapshotEntry {
                nic_id: r.nic_id,
                nic_name: r.nic_name.clone(),
                metric: r.metric,
                match_count: r.match_count.load(Ordering::Relaxed),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn lpm_and_tie_break_scenario() {
        let router = Router::new(32);
        router.register_route(v4("192.168.1.0"), 24, 1, "nic1", metric::STATIC);
        assert_eq!(router.get_destination(v4("192.168.1.1")), 1);

        router.register_route(v4("192.168.1.0"), 24, 2, "nic2", 1);
        assert_eq!(router.get_destination(v4("192.168.1.1")), 2);

        router.remove_route(v4("192.168.1.0"), 24, 2);
        assert_eq!(router.get_destination(v4("192.168.1.1")), 1);

        router.register_route(v4("192.168.1.1"), 32, 3, "nic3", 1);
        assert_eq!(router.get_destination(v4("192.168.1.1")), 3);
    }

    #[test]
    fn duplicate_nic_on_same_prefix_is_ignored() {
        let router = Router::new(32);
        router.register_route(v4("10.0.0.0"), 8, 1, "nic1", metric::CONNECTED);
        router.register_route(v4("10.0.0.0"), 8, 1, "nic1", metric::CONNECTED);
        let snaps = router.list();
        assert_eq!(snaps[0].routes.len(), 1);
    }

    #[test]
    fn best_route_tie_break_alternates_to_equalize_match_counts() {
        let router = Router::new(32);
        router.register_route(v4("10.0.0.0"), 8, 1, "a", metric::STATIC);
        router.register_route(v4("10.0.0.0"), 8, 2, "b", metric::STATIC);
        let mut chosen = Vec::new();
        for _ in 0..4 {
            chosen.push(router.get_destination(v4("10.1.2.3")));
        }
        assert_eq!(chosen, vec![1, 2, 1, 2]);
    }

    #[test]
    fn no_match_falls_back_to_zero_without_default_route() {
        let router = Router::new(32);
        assert_eq!(router.get_destination(v4("1.2.3.4")), 0);
    }
}
