//! TUN device adapter: wraps the platform TUN interface behind the
//! [`Nic`](crate::nic::Nic) trait and runs its own ingress task.

use std::io::{Read, Write};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use tokio::process::Command;

use crate::dispatcher::Dispatcher;
use crate::nic::{Nic, NicKind, TransferStat};
use crate::packet::PacketDescriptor;

/// Commands to run against a freshly opened TUN device (typically `ip link
/// set up`, `ip addr add`, ...), executed in order at attach time.
#[derive(Debug, Clone, Default)]
pub struct TunCommands {
    pub up: Vec<Vec<String>>,
    pub down: Vec<Vec<String>>,
}

async fn run_all(commands: &[Vec<String>]) {
    for args in commands {
        let Some((program, rest)) = args.split_first() else {
            continue;
        };
        match Command::new(program).args(rest).status().await {
            Ok(status) if !status.success() => {
                tracing::warn!(?args, code = ?status.code(), "tun command exited non-zero");
            }
            Err(err) => tracing::warn!(?args, %err, "failed to run tun command"),
            Ok(_) => {}
        }
    }
}

/// A TUN device identified by `id`, with a fixed virtual IP and mask. The
/// fd is wrapped in a plain (non-async) mutex: reads and writes against a
/// character device don't block meaningfully once data is flowing, and the
/// ingress loop runs the blocking read inside `spawn_blocking`.
pub struct TunNic {
    id: u64,
    name: String,
    virtual_ip: IpAddr,
    mask_len: u32,
    mtu: usize,
    device: Arc<Mutex<std::fs::File>>,
    down_commands: Vec<Vec<String>>,
    stats: TransferStat,
    extra_routes: Vec<(IpAddr, u32)>,
}

impl TunNic {
    /// Open `device_path` (e.g. the path returned by platform-specific TUN
    /// creation), run `commands.up`, and return the adapter. `extra_routes`
    /// are additional static routes (beyond the device's own IP/prefix) to
    /// advertise through this NIC, e.g. configured LAN subnets.
    pub async fn open(
        id: u64,
        name: String,
        device_path: String,
        virtual_ip: IpAddr,
        mask_len: u32,
        mtu: usize,
        commands: TunCommands,
        extra_routes: Vec<(IpAddr, u32)>,
    ) -> std::io::Result<Self> {
        let device = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new().read(true).write(true).open(device_path)
        })
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))??;
        run_all(&commands.up).await;
        Ok(Self {
            id,
            name,
            virtual_ip,
            mask_len,
            mtu,
            device: Arc::new(Mutex::new(device)),
            down_commands: commands.down,
            stats: TransferStat::default(),
            extra_routes,
        })
    }

    /// Run the ingress loop: read raw datagrams off the device, parse them,
    /// tag them with this NIC's id, and hand them to `dispatcher`. Returns
    /// once the device is closed or a fatal read error occurs.
    pub async fn run_ingress(self: Arc<Self>, dispatcher: Arc<Dispatcher>) {
        loop {
            let device = self.device.clone();
            let mtu = self.mtu.max(1500);
            let result = tokio::task::spawn_blocking(move || {
                let mut buf = vec![0u8; mtu];
                let mut file = device.lock().unwrap();
                file.read(&mut buf).map(|n| {
                    buf.truncate(n);
                    buf
                })
            })
            .await;

            let bytes = match result {
                Ok(Ok(bytes)) if !bytes.is_empty() => bytes,
                Ok(Ok(_)) => break,
                Ok(Err(err)) => {
                    tracing::warn!(nic = %self.name, %err, "tun read failed");
                    break;
                }
                Err(err) => {
                    tracing::warn!(nic = %self.name, %err, "tun read task panicked");
                    break;
                }
            };

            let Some(mut packet) = PacketDescriptor::parse(bytes) else {
                continue;
            };
            packet.in_nic = self.id;
            packet.client_virtual_ip = Some(self.virtual_ip);
            self.stats.add_receive(packet.used_size() as u64);
            dispatcher.dispatch(packet);
        }
    }
}

impl Nic for TunNic {
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
        Some(self.virtual_ip)
    }

    fn routes(&self) -> Vec<(IpAddr, u32)> {
        let mut routes = vec![(self.virtual_ip, self.mask_len)];
        routes.extend(self.extra_routes.iter().copied());
        routes
    }

    fn write_data(&self, packet: &PacketDescriptor) {
        let mut file = self.device.lock().unwrap();
        match file.write_all(packet.raw()) {
            Ok(()) => self.stats.add_send(packet.used_size() as u64),
            Err(err) => tracing::warn!(nic = %self.name, %err, "tun write failed"),
        }
    }

    fn end(&self) {
        let commands = self.down_commands.clone();
        tokio::spawn(async move {
            run_all(&commands).await;
        });
    }

    fn stats(&self) -> &TransferStat {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_and_down_command_lists_are_kept_separate() {
        let commands = TunCommands {
            up: vec![vec!["ip".into(), "link".into(), "set".into(), "tun0".into(), "up".into()]],
            down: vec![],
        };
        assert_eq!(commands.up.len(), 1);
        assert!(commands.down.is_empty());
    }
}
