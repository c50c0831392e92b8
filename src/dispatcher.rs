//! Forwarding dispatcher: glues NIC ingress to flow resolution, router
//! lookup and NIC egress.

use std::sync::Arc;

use crate::flow::FlowManager;
use crate::nic::NicManager;
use crate::packet::{Direction, PacketDescriptor};
use crate::router::Router;

/// Everything the dispatcher needs to resolve and forward one packet.
pub struct Dispatcher {
    pub flows: Arc<FlowManager>,
    pub router_v4: Arc<Router>,
    pub router_v6: Arc<Router>,
    pub nics: Arc<NicManager>,
}

impl Dispatcher {
    pub fn new(
        flows: Arc<FlowManager>,
        router_v4: Arc<Router>,
        router_v6: Arc<Router>,
        nics: Arc<NicManager>,
    ) -> Self {
        Self {
            flows,
            router_v4,
            router_v6,
            nics,
        }
    }

    /// Dispatch one packet: drop multicast, resolve/create its flow, drop
    /// if blocked, resolve the egress NIC on first sight, then write to the
    /// ingress or egress NIC depending on direction.
    pub fn dispatch(&self, packet: PacketDescriptor) {
        if packet.is_multicast_destination() {
            return;
        }

        let Some(flow) = self.flows.get_flow(&packet) else {
            return;
        };

        if flow.is_blocked() {
            return;
        }

        if flow.out_nic() == 0 {
            let router = match packet.dst_ip {
                std::net::IpAddr::V4(_) => &self.router_v4,
                std::net::IpAddr::V6(_) => &self.router_v6,
            };
            let out_nic = router.get_destination(packet.dst_ip);
            if out_nic == 0 || out_nic == packet.in_nic {
                return;
            }
            flow.set_out_nic(out_nic, &self.nics);
        }

        let target = match packet.direction_relative_to(flow.source) {
            Direction::Receive => packet.in_nic,
            Direction::Send => flow.out_nic(),
        };
        self.nics.write_data(target, &packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nic::{Nic, NicKind, TransferStat};
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingNic {
        id: u64,
        routes: Vec<(IpAddr, u32)>,
        writes: AtomicU32,
        stats: TransferStat,
    }

    impl Nic for CountingNic {
        fn id(&self) -> u64 {
            self.id
        }
        fn name(&self) -> &str {
            "nic"
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
        fn write_data(&self, _packet: &PacketDescriptor) {
            self.writes.fetch_add(1, Ordering::Relaxed);
        }
        fn end(&self) {}
        fn stats(&self) -> &TransferStat {
            &self.stats
        }
    }

    fn udp_packet(src: &str, dst: &str, in_nic: u64) -> PacketDescriptor {
        let mut pkt = vec![0u8; 28];
        pkt[0] = 0x45;
        pkt[9] = crate::packet::l4::UDP;
        let s: std::net::Ipv4Addr = src.parse().unwrap();
        let d: std::net::Ipv4Addr = dst.parse().unwrap();
        pkt[12..16].copy_from_slice(&s.octets());
        pkt[16..20].copy_from_slice(&d.octets());
        let mut p = PacketDescriptor::parse(pkt).unwrap();
        p.in_nic = in_nic;
        p
    }

    #[test]
    fn routes_first_packet_of_flow_to_resolved_egress_nic() {
        let router_v4 = Arc::new(Router::new(32));
        let router_v6 = Arc::new(Router::new(128));
        let nics = Arc::new(NicManager::new(router_v4.clone(), router_v6.clone()));
        let egress = Arc::new(CountingNic {
            id: 2,
            routes: vec![("10.0.1.0".parse().unwrap(), 24)],
            writes: AtomicU32::new(0),
            stats: TransferStat::default(),
        });
        nics.register_nic(egress.clone());

        let flows = Arc::new(FlowManager::new(4, 60, 100));
        let dispatcher = Dispatcher::new(flows, router_v4, router_v6, nics);

        let packet = udp_packet("10.0.0.5", "10.0.1.5", 1);
        dispatcher.dispatch(packet);
        assert_eq!(egress.writes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drops_multicast_destination() {
        let router_v4 = Arc::new(Router::new(32));
        let router_v6 = Arc::new(Router::new(128));
        let nics = Arc::new(NicManager::new(router_v4.clone(), router_v6.clone()));
        let flows = Arc::new(FlowManager::new(4, 60, 100));
        let dispatcher = Dispatcher::new(flows, router_v4, router_v6, nics);
        let packet = udp_packet("10.0.0.5", "224.0.0.1", 1);
        dispatcher.dispatch(packet); // must not panic, simply drop
    }
}
