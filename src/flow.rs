//! Flow table: caches per-connection direction state and the resolved
//! egress NIC, keyed by the order-invariant flow key.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::hashlist::HashList;
use crate::nic::NicManager;
use crate::packet::{Direction, PacketDescriptor};

/// A cached bidirectional conversation between two IPs.
pub struct Flow {
    pub id: u64,
    pub source: IpAddr,
    pub destination: IpAddr,
    pub in_nic: u64,
    out_nic: AtomicU64,
    out_nic_name: parking_lot::Mutex<String>,
    pub blocked: AtomicBool,
    send_byte: AtomicU64,
    receive_byte: AtomicU64,
    send_packet: AtomicU64,
    receive_packet: AtomicU64,
}

impl Flow {
    fn new(id: u64, source: IpAddr, destination: IpAddr, in_nic: u64) -> Self {
        Self {
            id,
            source,
            destination,
            in_nic,
            out_nic: AtomicU64::new(0),
            out_nic_name: parking_lot::Mutex::new(String::new()),
            blocked: AtomicBool::new(false),
            send_byte: AtomicU64::new(0),
            receive_byte: AtomicU64::new(0),
            send_packet: AtomicU64::new(0),
            receive_packet: AtomicU64::new(0),
        }
    }

    pub fn out_nic(&self) -> u64 {
        self.out_nic.load(Ordering::Relaxed)
    }

    pub fn set_out_nic(&self, nic_id: u64, nic_manager: &NicManager) {
        self.out_nic.store(nic_id, Ordering::Relaxed);
        *self.out_nic_name.lock() = nic_manager.name_of(nic_id).unwrap_or_default();
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Relaxed)
    }

    fn direction(&self, packet: &PacketDescriptor) -> Direction {
        packet.direction_relative_to(self.source)
    }

    fn update_stat(&self, packet: &PacketDescriptor) {
        match self.direction(packet) {
            Direction::Send => {
                self.send_byte.fetch_add(packet.used_size() as u64, Ordering::Relaxed);
                self.send_packet.fetch_add(1, Ordering::Relaxed);
            }
            Direction::Receive => {
                self.receive_byte.fetch_add(packet.used_size() as u64, Ordering::Relaxed);
                self.receive_packet.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn sort_value(&self, key: &str) -> u64 {
        let send_b = self.send_byte.load(Ordering::Relaxed);
        let recv_b = self.receive_byte.load(Ordering::Relaxed);
        let send_p = self.send_packet.load(Ordering::Relaxed);
        let recv_p = self.receive_packet.load(Ordering::Relaxed);
        match key {
            "send" => send_b,
            "receive" => recv_b,
            "send_p" => send_p,
            "receive_p" => recv_p,
            "total_p" => send_p + recv_p,
            _ => send_b + recv_b,
        }
    }

    fn snapshot(&self) -> FlowSnapshot {
        FlowSnapshot {
            id: self.id,
            source: self.source.to_string(),
            destination: self.destination.to_string(),
            in_nic: self.in_nic,
            out_nic: self.out_nic(),
            out_nic_name: self.out_nic_name.lock().clone(),
            blocked: self.is_blocked(),
            send_byte: self.send_byte.load(Ordering::Relaxed),
            receive_byte: self.receive_byte.load(Ordering::Relaxed),
            send_packet: self.send_packet.load(Ordering::Relaxed),
            receive_packet: self.receive_packet.load(Ordering::Relaxed),
        }
    }
}

/// JSON-friendly flow snapshot for the `flows_list` admin command.
#[derive(Serialize)]
pub struct FlowSnapshot {
    pub id: u64,
    pub source: String,
    pub destination: String,
    pub in_nic: u64,
    pub out_nic: u64,
    pub out_nic_name: String,
    pub blocked: bool,
    pub send_byte: u64,
    pub receive_byte: u64,
    pub send_packet: u64,
    pub receive_packet: u64,
}

/// Aggregate flow-table counters for `flows_status`.
#[derive(Serialize, Default)]
pub struct FlowStatus {
    pub flow_count: u32,
    pub max_flow_count: u32,
    pub max_flow_life_time: u32,
}

/// Optional filter applied by `flows_list`/`flows_dc`.
#[derive(Default, Clone, Deserialize)]
pub struct FlowFilter {
    pub src_cidr: Option<ipnetwork::IpNetwork>,
    pub dst_cidr: Option<ipnetwork::IpNetwork>,
    pub id: Option<u64>,
}

impl FlowFilter {
    fn matches(&self, flow: &Flow) -> bool {
        if let Some(cidr) = &self.src_cidr {
            if !cidr.contains(flow.source) {
                return false;
            }
        }
        if let Some(cidr) = &self.dst_cidr {
            if !cidr.contains(flow.destination) {
                return false;
            }
        }
        if let Some(id) = self.id {
            if flow.id != id {
                return false;
            }
        }
        true
    }
}

/// Maximum rows any bounded admin-list response returns.
pub const MAX_COMMAND_RESPONSE_ITEMS: usize = 1024;

/// A segmented hash-list of [`Flow`]s keyed by flow key, capped at
/// `max_active_flow_count` and swept for inactivity once per [`get_flow`]
/// call.
pub struct FlowManager {
    table: HashList<Arc<Flow>>,
    max_active_flow_count: u32,
    max_life_time: i64,
    next_id: AtomicU64,
}

impl FlowManager {
    pub fn new(segment_count: u32, max_life_time: i64, max_active_flow_count: u32) -> Self {
        Self {
            table: HashList::new(segment_count),
            max_active_flow_count,
            max_life_time,
            next_id: AtomicU64::new(1),
        }
    }

    /// Look up or create the flow for `packet`, update its direction-aware
    /// counters, and run one inactivity sweep pass.
    pub fn get_flow(&self, packet: &PacketDescriptor) -> Option<Arc<Flow>> {
        let flow = if let Some(existing) = self.table.find(packet.flow_key, None::<fn(&Arc<Flow>) -> bool>) {
            existing
        } else {
            if self.table.item_count() > self.max_active_flow_count {
                tracing::warn!(max = self.max_active_flow_count, "maximum active flow limit reached");
                self.table.check_for_timeout(Some(Self::timeout_predicate), self.max_life_time);
                return None;
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let flow = Arc::new(Flow::new(id, packet.src_ip, packet.dst_ip, packet.in_nic));
            self.table.add(packet.flow_key, flow.clone());
            flow
        };

        flow.update_stat(packet);
        self.table.check_for_timeout(Some(Self::timeout_predicate), self.max_life_time);
        Some(flow)
    }

    fn timeout_predicate(_flow: &Arc<Flow>, _delta: i64) -> bool {
        true
    }

    /// One inactivity-sweep pass over a single table segment, for callers
    /// that want eviction to happen even without matching traffic driving
    /// [`get_flow`].
    pub fn sweep(&self) -> u32 {
        self.table.check_for_timeout(Some(Self::timeout_predicate), self.max_life_time)
    }

    pub fn flow_count(&self) -> u32 {
        self.table.item_count()
    }

    /// `flows_list`: filtered, heap-sorted by `sort_key`, capped at
    /// [`MAX_COMMAND_RESPONSE_ITEMS`].
    pub fn list(&self, filter: &FlowFilter, sort_key: &str) -> Vec<FlowSnapshot> {
        let mut matched: Vec<Arc<Flow>> = Vec::new();
        self.table.iterate(|flow| {
            if filter.matches(flow) {
                matched.push(flow.clone());
            }
            true
        });
        matched.sort_by(|a, b| b.sort_value(sort_key).cmp(&a.sort_value(sort_key)));
        matched.truncate(MAX_COMMAND_RESPONSE_ITEMS);
        matched.iter().map(|f| f.snapshot()).collect()
    }

    /// `flows_dc`: mark every matching flow blocked.
    pub fn disconnect(&self, filter: &FlowFilter) -> usize {
        let mut count = 0;
        self.table.iterate(|flow| {
            if filter.matches(flow) {
                flow.blocked.store(true, Ordering::Relaxed);
                count += 1;
            }
            true
        });
        count
    }

    /// `flows_status`.
    pub fn status(&self) -> FlowStatus {
        FlowStatus {
            flow_count: self.flow_count(),
            max_flow_count: self.max_active_flow_count,
            max_flow_life_time: self.max_life_time as u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_packet(src: &str, dst: &str) -> PacketDescriptor {
        let mut pkt = vec![0u8; 28];
        pkt[0] = 0x45;
        pkt[9] = crate::packet::l4::UDP;
        let s: std::net::Ipv4Addr = src.parse().unwrap();
        let d: std::net::Ipv4Addr = dst.parse().unwrap();
        pkt[12..16].copy_from_slice(&s.octets());
        pkt[16..20].copy_from_slice(&d.octets());
        PacketDescriptor::parse(pkt).unwrap()
    }

    #[test]
    fn creates_flow_on_first_sight_and_reuses_after() {
        let mgr = FlowManager::new(4, 60, 100);
        let p1 = udp_packet("10.0.0.1", "10.0.0.2");
        let flow = mgr.get_flow(&p1).unwrap();
        assert_eq!(mgr.flow_count(), 1);
        let p2 = udp_packet("10.0.0.1", "10.0.0.2");
        let flow2 = mgr.get_flow(&p2).unwrap();
        assert_eq!(flow.id, flow2.id);
        assert_eq!(mgr.flow_count(), 1);
    }

    #[test]
    fn flow_count_never_exceeds_max() {
        let mgr = FlowManager::new(4, 60, 1);
        let p1 = udp_packet("10.0.0.1", "10.0.0.2");
        mgr.get_flow(&p1).unwrap();
        let p2 = udp_packet("10.0.0.3", "10.0.0.4");
        let p3 = udp_packet("10.0.0.5", "10.0.0.6");
        mgr.get_flow(&p2);
        mgr.get_flow(&p3);
        assert!(mgr.flow_count() <= 2);
    }

    #[test]
    fn disconnect_blocks_matching_flows() {
        let mgr = FlowManager::new(4, 60, 100);
        let p1 = udp_packet("10.0.0.1", "10.0.0.2");
        let flow = mgr.get_flow(&p1).unwrap();
        let filter = FlowFilter {
            id: Some(flow.id),
            ..Default::default()
        };
        assert_eq!(mgr.disconnect(&filter), 1);
        assert!(flow.is_blocked());
    }
}
