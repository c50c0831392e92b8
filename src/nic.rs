//! Virtual NIC abstraction and the central NIC manager.
//!
//! The manager owns the single reference to every live NIC; every other
//! subsystem holds only its 64-bit id. NICs are polymorphic over their
//! implementation (a TUN device, a per-connection CSTP tunnel peer) behind
//! a trait object.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::packet::PacketDescriptor;
use crate::router::{metric, Router};

/// NIC kind, for admin introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NicKind {
    Tun,
    Tunnel,
    Peer,
    Client,
}

/// Cumulative byte/packet counters for one NIC.
#[derive(Debug, Default, Serialize)]
pub struct TransferStat {
    pub send_byte: AtomicU64Wrap,
    pub receive_byte: AtomicU64Wrap,
    pub send_packet: AtomicU64Wrap,
    pub receive_packet: AtomicU64Wrap,
}

/// A `Serialize`-able wrapper around `AtomicU64` (serde has no impl for the
/// atomic type itself).
#[derive(Debug, Default)]
pub struct AtomicU64Wrap(pub AtomicU64);

impl Serialize for AtomicU64Wrap {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(self.0.load(Ordering::Relaxed))
    }
}

impl TransferStat {
    pub fn add_send(&self, bytes: u64) {
        self.send_byte.0.fetch_add(bytes, Ordering::Relaxed);
        self.send_packet.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_receive(&self, bytes: u64) {
        self.receive_byte.0.fetch_add(bytes, Ordering::Relaxed);
        self.receive_packet.0.fetch_add(1, Ordering::Relaxed);
    }
}

/// The capability set every virtual interface exposes to the manager and
/// the dispatcher.
pub trait Nic: Send + Sync {
    fn id(&self) -> u64;
    fn name(&self) -> &str;
    fn kind(&self) -> NicKind;
    fn peer_ip(&self) -> Option<IpAddr>;
    fn virtual_ip(&self) -> Option<IpAddr>;
    /// CIDRs attached at registration time, as `(network, mask_len)`.
    fn routes(&self) -> Vec<(IpAddr, u32)>;
    fn write_data(&self, packet: &PacketDescriptor);
    fn end(&self);
    fn stats(&self) -> &TransferStat;
}

/// `nicId -> NIC` map, held under a reader/writer lock.
pub struct NicManager {
    nics: RwLock<HashMap<u64, Arc<dyn Nic>>>,
    router_v4: Arc<Router>,
    router_v6: Arc<Router>,
}

impl NicManager {
    pub fn new(router_v4: Arc<Router>, router_v6: Arc<Router>) -> Self {
        Self {
            nics: RwLock::new(HashMap::new()),
            router_v4,
            router_v6,
        }
    }

    /// Insert `nic` (dropped silently if its id is already registered) and
    /// register each of its declared routes with the matching-version
    /// router at metric CONNECTED.
    pub fn register_nic(&self, nic: Arc<dyn Nic>) {
        let id = nic.id();
        {
            let mut map = self.nics.write();
            if map.contains_key(&id) {
                tracing::warn!(id, "duplicate NIC registration");
                return;
            }
            map.insert(id, nic.clone());
        }

        for (network, mask_len) in nic.routes() {
            let router = self.router_for(network);
            router.register_route(network, mask_len, id, nic.name(), metric::CONNECTED);
        }
    }

    /// Remove `id`'s routes from both routers, then drop the NIC entry.
    pub fn remove_nic(&self, id: u64) {
        let nic = {
            let mut map = self.nics.write();
            map.remove(&id)
        };
        if let Some(nic) = nic {
            for (network, mask_len) in nic.routes() {
                self.router_for(network).remove_route(network, mask_len, id);
            }
        }
    }

    pub fn name_of(&self, id: u64) -> Option<String> {
        self.nics.read().get(&id).map(|n| n.name().to_string())
    }

    /// Resolve `id` and forward `packet` to it, if still registered.
    pub fn write_data(&self, id: u64, packet: &PacketDescriptor) {
        if let Some(nic) = self.nics.read().get(&id) {
            nic.write_data(packet);
        }
    }

    /// Call `end()` on every registered NIC (process shutdown / SIGTERM).
    pub fn flush(&self) {
        for nic in self.nics.read().values() {
            nic.end();
        }
    }

    fn router_for(&self, ip: IpAddr) -> &Arc<Router> {
        match ip {
            IpAddr::V4(_) => &self.router_v4,
            IpAddr::V6(_) => &self.router_v6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FakeNic {
        id: u64,
        name: String,
        routes: Vec<(IpAddr, u32)>,
        stats: TransferStat,
        ended: AtomicBool,
    }

    impl Nic for FakeNic {
        fn id(&self) -> u64 {
            self.id
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> NicKind {
            NicKind::Tun
        }
        fn peer_ip(&self) -> Option<IpAddr> {
            None
        }
        fn virtual_ip(&self) -> Option<IpAddr> {
            None
        }
        fn routes(&self) -> Vec<(IpAddr, u32)> {
            self.routes.clone()
        }
        fn write_data(&self, _packet: &PacketDescriptor) {}
        fn end(&self) {
            self.ended.store(true, Ordering::Relaxed);
        }
        fn stats(&self) -> &TransferStat {
            &self.stats
        }
    }

    #[test]
    fn register_wires_routes_into_router_and_remove_unwires() {
        let v4 = Arc::new(Router::new(32));
        let v6 = Arc::new(Router::new(128));
        let manager = NicManager::new(v4.clone(), v6.clone());

        let nic = Arc::new(FakeNic {
            id: 7,
            name: "tun0".into(),
            routes: vec![("10.0.0.0".parse().unwrap(), 24)],
            stats: TransferStat::default(),
            ended: AtomicBool::new(false),
        });
        manager.register_nic(nic.clone());
        assert_eq!(v4.get_destination("10.0.0.5".parse().unwrap()), 7);

        manager.remove_nic(7);
        assert_eq!(v4.get_destination("10.0.0.5".parse().unwrap()), 0);
    }

    #[test]
    fn flush_ends_every_nic() {
        let v4 = Arc::new(Router::new(32));
        let v6 = Arc::new(Router::new(128));
        let manager = NicManager::new(v4, v6);
        let nic = Arc::new(FakeNic {
            id: 1,
            name: "n".into(),
            routes: vec![],
            stats: TransferStat::default(),
            ended: AtomicBool::new(false),
        });
        manager.register_nic(nic.clone());
        manager.flush();
        assert!(nic.ended.load(Ordering::Relaxed));
    }
}
