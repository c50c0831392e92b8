//! goconnect-rs - user-space SSL-VPN concentrator
//!
//! AnyConnect/OpenConnect-compatible CSTP tunnel server plus a token-auth
//! management HTTP API, built from a handful of small, independently
//! testable subsystems wired together here.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         goconnect-rs CONCENTRATOR                 │
//! │                                                                   │
//! │   CSTP listener (TLS)         Management API (TLS, separate port) │
//! │   login / auth / CONNECT      login, help, flows_*, acc_*, ...    │
//! │        │                              │                          │
//! │        ▼                              ▼                          │
//! │   AuthenticationManager  ◄────  Commander (token auth)            │
//! │        │                                                          │
//! │        ▼                                                          │
//! │   IpPool → NicManager ──► Dispatcher ──► FlowManager ──► Router   │
//! │        │                      ▲                                  │
//! │        ▼                      │                                  │
//! │   per-connection CSTP NIC     TUN NIC (LAN/upstream egress)       │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod accounting;
pub mod auth;
pub mod buffer;
pub mod commander;
pub mod config;
pub mod crypto;
pub mod cstp;
pub mod dispatcher;
pub mod flow;
pub mod hashlist;
pub mod ippool;
pub mod iptrie;
pub mod nic;
pub mod packet;
pub mod router;
pub mod tun;

use std::sync::Arc;

use thiserror::Error;

pub use auth::AuthenticationManager;
pub use commander::Commander;
pub use config::ConcentratorConfig;
pub use cstp::CstpServer;
pub use dispatcher::Dispatcher;
pub use flow::FlowManager;
pub use ippool::IpPool;
pub use nic::NicManager;
pub use router::Router as PacketRouter;

/// Top-level error for anything that can fail during construction or the
/// main run loop. Subsystem errors are threaded through via `#[from]` so
/// `?` composes across module boundaries without manual mapping.
#[derive(Debug, Error)]
pub enum ConcentratorError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("ip pool error: {0}")]
    Pool(#[from] ippool::PoolError),
    #[error("cstp listener error: {0}")]
    Cstp(#[from] cstp::CstpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn parse_addr(s: &str, field: &str) -> Result<std::net::IpAddr, ConcentratorError> {
    s.parse()
        .map_err(|_| ConcentratorError::Config(format!("{field}: invalid IP address {s:?}")))
}

fn parse_argv(commands: &[String]) -> Vec<Vec<String>> {
    commands
        .iter()
        .map(|line| line.split_whitespace().map(String::from).collect())
        .collect()
}

/// Every live subsystem, wired together. Built once at startup from a
/// [`ConcentratorConfig`]; [`run`](Self::run) drives it until shutdown.
pub struct Concentrator {
    config: ConcentratorConfig,
    ip_pool: Arc<IpPool>,
    router_v4: Arc<PacketRouter>,
    router_v6: Arc<PacketRouter>,
    nics: Arc<NicManager>,
    flows: Arc<FlowManager>,
    dispatcher: Arc<Dispatcher>,
    auth: Arc<AuthenticationManager>,
    cstp: Arc<CstpServer>,
    commander: Arc<Commander>,
}

impl Concentrator {
    /// Build every subsystem and wire them together. Does not bind any
    /// socket or open the TUN device yet; that happens in [`run`](Self::run).
    pub fn new(config: ConcentratorConfig) -> Result<Self, ConcentratorError> {
        let start = parse_addr(&config.ip_pool.start, "ip_pool.start")?;
        let end = parse_addr(&config.ip_pool.end, "ip_pool.end")?;
        let ip_pool = Arc::new(IpPool::new(start, end)?);

        // 32 address bits covers IPv4; IPv6 routes reuse the same trie with
        // a wider key, both tables sized identically since neither the
        // route count nor the lookup cost depends on address family here.
        let router_v4 = Arc::new(PacketRouter::new(32));
        let router_v6 = Arc::new(PacketRouter::new(128));

        let nics = Arc::new(NicManager::new(router_v4.clone(), router_v6.clone()));

        let flows = Arc::new(FlowManager::new(
            config.flow_manager.hash_slots,
            config.flow_manager.inactive_life_time,
            config.flow_manager.maximum_flow_count,
        ));

        let dispatcher = Arc::new(Dispatcher::new(
            flows.clone(),
            router_v4.clone(),
            router_v6.clone(),
            nics.clone(),
        ));

        let auth = Arc::new(AuthenticationManager::new());
        if config.authentication.enable_dummy {
            auth.register(Arc::new(auth::DummyAuthenticator::new()))
                .map_err(|err| ConcentratorError::Config(err.to_string()))?;
        }

        let cstp_config = cstp::CstpConfig {
            address: config.sslvpn.server_address.clone(),
            cert_file: config.sslvpn.certificate.clone(),
            key_file: config.sslvpn.key.clone(),
            dpd_interval: config.sslvpn.dpd_interval,
            client_netmask: config.sslvpn.net_mask.clone(),
            client_mask_len: netmask_len(&config.sslvpn.net_mask),
            split_tunnels: config.sslvpn.split_tunnels.clone(),
            dns_servers: config.sslvpn.dns_servers.clone(),
            tunnel_all_dns: config.sslvpn.tunnel_dns,
            keepalive: config.sslvpn.keepalive_interval,
            idle_timeout: config.sslvpn.idle_timeout,
            rekey_interval: config.sslvpn.rekey_interval,
            mtu: config.sslvpn.mtu.clamp(1100, 1500),
            inactive_session_timeout: config.sslvpn.inactive_sessions_timeout,
            login_fail_track_time: config.sslvpn.login_fail_track_time,
            login_fail_count: config.sslvpn.login_fail_count,
        };
        let cstp = CstpServer::new(cstp_config, auth.clone(), ip_pool.clone(), nics.clone(), dispatcher.clone())?;

        let valid_clients = config
            .command
            .valid_clients
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        let commander_config = commander::CommanderConfig {
            bind_address: config.command.bind_address.clone(),
            valid_clients,
            maintenance_hook: config.command.maintenance_hook,
            token_max_life_time: config.command.token_life_time,
            login_fail_track_time: 60,
            login_fail_count: 3,
        };
        let commander = Commander::new(commander_config, auth.clone());
        commander.register_flow_commands(flows.clone());
        commander.register_accounting_commands(auth.accounting.clone());
        commander.register_route_commands("routes4_list", router_v4.clone());
        commander.register_route_commands("routes6_list", router_v6.clone());

        Ok(Self {
            config,
            ip_pool,
            router_v4,
            router_v6,
            nics,
            flows,
            dispatcher,
            auth,
            cstp,
            commander,
        })
    }

    /// Open the TUN device (if enabled), bind both listeners, and run until
    /// one of them fails or the process is asked to shut down.
    pub async fn run(self) -> Result<(), ConcentratorError> {
        let tun_nic = if self.config.tun.enable {
            Some(self.attach_tun().await?)
        } else {
            None
        };

        let cstp = self.cstp.clone();
        let cstp_handle = tokio::spawn(async move { cstp.run().await });

        let commander_handle = tokio::spawn(run_commander(self.commander.clone(), self.config.command.bind_address.clone()));

        self.spawn_sweepers();

        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .map_err(ConcentratorError::Io)?;

        tokio::select! {
            res = cstp_handle => {
                res.map_err(|err| ConcentratorError::Config(err.to_string()))??;
            }
            res = commander_handle => {
                res.map_err(|err| ConcentratorError::Config(err.to_string()))??;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested (SIGINT)");
            }
            _ = sigterm.recv() => {
                tracing::info!("shutdown requested (SIGTERM)");
            }
        }

        // flush() calls end() on every registered NIC, including the TUN
        // device, which runs its down_commands.
        let _ = tun_nic;
        self.nics.flush();
        Ok(())
    }

    async fn attach_tun(&self) -> Result<Arc<tun::TunNic>, ConcentratorError> {
        let ip = self
            .config
            .tun
            .ip_list
            .first()
            .ok_or_else(|| ConcentratorError::Config("tun.ip_list must have at least one entry".into()))?;
        let (addr, mask_len) = split_cidr(ip)?;
        let commands = tun::TunCommands {
            up: parse_argv(&self.config.tun.up_commands),
            down: parse_argv(&self.config.tun.down_commands),
        };
        let extra_routes = self
            .config
            .tun
            .routes
            .iter()
            .map(|r| split_cidr(r))
            .collect::<Result<Vec<_>, _>>()?;
        let nic = Arc::new(
            tun::TunNic::open(
                // Reserved: CSTP connection NICs are numbered from 1 and 0 is
                // the router's "no destination" sentinel, so the single TUN
                // device takes the top of the id space instead.
                u64::MAX,
                self.config.tun.name.clone(),
                "/dev/net/tun".into(),
                addr,
                mask_len,
                self.config.tun.mtu as usize,
                commands,
                extra_routes,
            )
            .await?,
        );
        self.nics.register_nic(nic.clone());
        let ingress_nic = nic.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move { ingress_nic.run_ingress(dispatcher).await });
        Ok(nic)
    }

    /// Spawn the background sweep tasks. Each `HashList::check_for_timeout`
    /// call covers one segment, so sweeping the whole table once per tick
    /// means looping the call `segment_count` times per tick.
    fn spawn_sweepers(&self) {
        let cstp = self.cstp.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                cstp.sweep_sessions();
            }
        });

        let commander = self.commander.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(10));
            loop {
                ticker.tick().await;
                commander.sweep_tokens();
            }
        });

        let flows = self.flows.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                flows.sweep();
            }
        });
    }
}

async fn run_commander(commander: Arc<Commander>, bind_address: String) -> Result<(), ConcentratorError> {
    let app = commander::router(commander);
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!(address = %bind_address, "management api listener started");
    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .await
        .map_err(ConcentratorError::Io)
}

fn netmask_len(mask: &str) -> u32 {
    mask.parse::<std::net::Ipv4Addr>()
        .map(|m| u32::from(m).count_ones())
        .unwrap_or(24)
}

fn split_cidr(cidr: &str) -> Result<(std::net::IpAddr, u32), ConcentratorError> {
    let (addr, len) = cidr
        .split_once('/')
        .ok_or_else(|| ConcentratorError::Config(format!("not a CIDR: {cidr:?}")))?;
    let addr = parse_addr(addr, "tun.ip_list")?;
    let len: u32 = len
        .parse()
        .map_err(|_| ConcentratorError::Config(format!("bad prefix length in {cidr:?}")))?;
    Ok((addr, len))
}
