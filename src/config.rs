//! Concentrator configuration: one JSON file, one struct per subsystem.

use serde::{Deserialize, Serialize};

/// Top-level configuration file shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcentratorConfig {
    pub sslvpn: SslVpnConfig,
    pub tun: TunConfig,
    pub ip_pool: IpPoolConfig,
    pub authentication: AuthenticationConfig,
    pub flow_manager: FlowManagerConfig,
    pub command: CommandConfig,
    pub log: LogConfig,
}

impl Default for ConcentratorConfig {
    fn default() -> Self {
        Self {
            sslvpn: SslVpnConfig::default(),
            tun: TunConfig::default(),
            ip_pool: IpPoolConfig::default(),
            authentication: AuthenticationConfig::default(),
            flow_manager: FlowManagerConfig::default(),
            command: CommandConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl ConcentratorConfig {
    /// Load from a JSON file. Missing file or bad schema is the caller's
    /// fatal startup error.
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to a JSON file.
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

/// CSTP tunnel listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslVpnConfig {
    pub enable: bool,
    pub certificate: String,
    pub key: String,
    pub server_address: String,
    pub dpd_interval: u16,
    pub net_mask: String,
    pub split_tunnels: Vec<String>,
    pub dns_servers: Vec<String>,
    pub use_local_dns_server: bool,
    pub tunnel_dns: bool,
    pub keepalive_interval: u32,
    pub idle_timeout: u32,
    pub rekey_interval: u32,
    /// Clamped to 1100..=1500 by callers; stored verbatim here.
    pub mtu: u32,
    pub inactive_sessions_timeout: i64,
    pub login_fail_track_time: i64,
    pub login_fail_count: u32,
}

impl Default for SslVpnConfig {
    fn default() -> Self {
        Self {
            enable: true,
            certificate: "/etc/goconnect-rs/server.pem".into(),
            key: "/etc/goconnect-rs/server.key".into(),
            server_address: "0.0.0.0:443".into(),
            dpd_interval: 30,
            net_mask: "255.255.255.0".into(),
            split_tunnels: Vec::new(),
            dns_servers: vec!["1.1.1.1".into()],
            use_local_dns_server: false,
            tunnel_dns: true,
            keepalive_interval: 20,
            idle_timeout: 1800,
            rekey_interval: 3600,
            mtu: 1400,
            inactive_sessions_timeout: 300,
            login_fail_track_time: 60,
            login_fail_count: 3,
        }
    }
}

/// TUN device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunConfig {
    pub name: String,
    pub ip_list: Vec<String>,
    pub routes: Vec<String>,
    pub mtu: u32,
    pub enable: bool,
    pub up_commands: Vec<String>,
    pub down_commands: Vec<String>,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: "tun0".into(),
            ip_list: vec!["192.168.100.1/24".into()],
            routes: Vec::new(),
            mtu: 1400,
            enable: true,
            up_commands: Vec::new(),
            down_commands: Vec::new(),
        }
    }
}

/// Virtual IP pool range handed out to established tunnels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpPoolConfig {
    pub start: String,
    pub end: String,
}

impl Default for IpPoolConfig {
    fn default() -> Self {
        Self {
            start: "192.168.200.1".into(),
            end: "192.168.200.254".into(),
        }
    }
}

/// Credential source selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    pub dummy_auth_config_path: Option<String>,
    pub enable_dummy: bool,
}

impl Default for AuthenticationConfig {
    fn default() -> Self {
        Self {
            dummy_auth_config_path: None,
            enable_dummy: true,
        }
    }
}

/// Flow table sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowManagerConfig {
    pub hash_slots: u32,
    pub inactive_life_time: i64,
    pub maximum_flow_count: u32,
}

impl Default for FlowManagerConfig {
    fn default() -> Self {
        Self {
            hash_slots: 32_000,
            inactive_life_time: 120,
            maximum_flow_count: 1_000_000,
        }
    }
}

/// Management HTTP API listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub enable: bool,
    pub certificate: String,
    pub key: String,
    pub static_data: Option<String>,
    pub serve_static_contents: bool,
    pub bind_address: String,
    pub valid_clients: Vec<String>,
    pub maintenance_hook: bool,
    pub token_life_time: i64,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            enable: true,
            certificate: "/etc/goconnect-rs/command.pem".into(),
            key: "/etc/goconnect-rs/command.key".into(),
            static_data: None,
            serve_static_contents: false,
            bind_address: "127.0.0.1:8443".into(),
            valid_clients: Vec::new(),
            maintenance_hook: true,
            token_life_time: 3600,
        }
    }
}

/// Logging sink. `syslog:<net>:<addr>` is recognised at startup; anything
/// else is treated as a file path (`-` for stdout).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub log_file: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_file: "-".into(),
        }
    }
}
