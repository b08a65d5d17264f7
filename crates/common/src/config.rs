use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::RadioKind;
use crate::DeviceId;

/// Proxy listener constants
pub mod proxy {
    /// HTTP proxy listens on base port + this offset
    pub const HTTP_PORT_OFFSET: u16 = 0;

    /// SOCKS5 proxy listens on base port + this offset
    pub const SOCKS5_PORT_OFFSET: u16 = 1;

    /// Default base port
    pub const DEFAULT_BASE_PORT: u16 = 8080;

    /// Relay buffer per direction
    pub const BUFFER_SIZE: usize = 32 * 1024;

    /// Upstream connect timeout
    pub const CONNECT_TIMEOUT_SECS: u64 = 10;

    /// Idle time after which a relay direction gives up
    pub const IDLE_TIMEOUT_SECS: u64 = 120;

    /// Largest request header block the HTTP proxy accepts
    pub const MAX_HEADER_BYTES: usize = 64 * 1024;
}

/// SOCKS5 UDP relay constants
pub mod socks {
    /// Largest datagram the relay handles
    pub const UDP_BUFFER_SIZE: usize = 65535;

    /// Inactivity before a UDP session is evicted
    pub const UDP_IDLE_TIMEOUT_SECS: u64 = 120;

    /// How often the relay sweeps idle sessions
    pub const UDP_SWEEP_INTERVAL_SECS: u64 = 5;
}

/// VPN tunnel constants
pub mod tunnel {
    /// MTU of the virtual interface
    pub const MTU: u16 = 1400;

    /// Prefix length of the tunnel address
    pub const PREFIX_LEN: u8 = 24;

    pub const KEEPALIVE_INTERVAL_MS: u64 = 25_000;

    /// No PONG for this long tears the connection down
    pub const PONG_TIMEOUT_MS: u64 = 45_000;

    pub const AUTH_TIMEOUT_MS: u64 = 10_000;

    pub const RECONNECT_BASE_MS: u64 = 3_000;

    pub const RECONNECT_MAX_MS: u64 = 30_000;

    /// Send/receive buffer of the tunnel UDP socket (2 MB)
    pub const SOCKET_BUFFER_BYTES: usize = 2 * 1024 * 1024;
}

/// IP rotation constants
pub mod rotation {
    /// Wait for a toggle confirmation
    pub const TOGGLE_TIMEOUT_MS: u64 = 7_000;

    /// Airplane mode stays on this long before disabling
    pub const SETTLE_DELAY_MS: u64 = 6_000;

    /// Wait for cellular to re-attach after a rotation
    pub const REATTACH_TIMEOUT_MS: u64 = 5_000;

    /// Pause before retrying a failed disable
    pub const DISABLE_RETRY_DELAY_MS: u64 = 2_000;

    /// Pause between cellular release and reacquire
    pub const DETACH_DELAY_MS: u64 = 500;

    /// Attempts kept for status queries
    pub const HISTORY_LEN: usize = 32;
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Log level used when RUST_LOG is not set
    pub log_level: String,

    pub device: DeviceConfig,

    pub proxy: ProxyConfig,

    pub network: NetworkConfig,

    pub tunnel: TunnelConfig,

    pub rotation: RotationConfig,

    pub api: ApiConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Identifier presented to the tunnel server. Written once by `init-config`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<DeviceId>,

    /// Opaque secret shared with the controller; not interpreted locally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shared_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen_addr: String,

    /// HTTP and SOCKS5 ports are fixed offsets from this
    pub base_port: u16,

    pub connect_timeout_secs: u64,

    pub idle_timeout_secs: u64,

    pub udp_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            base_port: proxy::DEFAULT_BASE_PORT,
            connect_timeout_secs: proxy::CONNECT_TIMEOUT_SECS,
            idle_timeout_secs: proxy::IDLE_TIMEOUT_SECS,
            udp_idle_timeout_secs: socks::UDP_IDLE_TIMEOUT_SECS,
        }
    }
}

impl ProxyConfig {
    pub fn http_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listener_addr(proxy::HTTP_PORT_OFFSET)
    }

    pub fn socks5_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listener_addr(proxy::SOCKS5_PORT_OFFSET)
    }

    fn listener_addr(&self, offset: u16) -> Result<SocketAddr, ConfigError> {
        let port = self.base_port.checked_add(offset).ok_or_else(|| {
            ConfigError::InvalidValue(format!("base_port {} too large", self.base_port))
        })?;
        format!("{}:{}", self.listen_addr, port)
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("listen_addr {}", self.listen_addr)))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }
}

/// Which network provider backs the NetworkManager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Watch named host interfaces
    Interface,
    /// Networks are announced programmatically
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub provider: ProviderKind,

    pub cellular_interface: String,

    pub wifi_interface: String,

    /// DNS servers reachable over cellular
    pub cellular_dns: Vec<String>,

    pub wifi_dns: Vec<String>,

    /// Interface poll interval for the interface provider
    pub poll_interval_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Interface,
            cellular_interface: "rmnet_data0".to_string(),
            wifi_interface: "wlan0".to_string(),
            cellular_dns: Vec::new(),
            wifi_dns: Vec::new(),
            poll_interval_ms: 2_000,
        }
    }
}

impl NetworkConfig {
    pub fn interface_for(&self, kind: RadioKind) -> &str {
        match kind {
            RadioKind::Cellular => &self.cellular_interface,
            RadioKind::Wifi => &self.wifi_interface,
        }
    }

    pub fn dns_for(&self, kind: RadioKind) -> &[String] {
        match kind {
            RadioKind::Cellular => &self.cellular_dns,
            RadioKind::Wifi => &self.wifi_dns,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Radio the tunnel socket is pinned to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelEgress {
    Wifi,
    Cellular,
}

impl From<TunnelEgress> for RadioKind {
    fn from(value: TunnelEgress) -> Self {
        match value {
            TunnelEgress::Wifi => RadioKind::Wifi,
            TunnelEgress::Cellular => RadioKind::Cellular,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub enabled: bool,

    /// Tunnel server as host:port
    pub server: String,

    pub egress: TunnelEgress,

    /// Name of the virtual interface
    pub interface_name: String,

    /// Extra routes (CIDR) pointed at the virtual interface
    pub routes: Vec<String>,

    pub mtu: u16,

    pub keepalive_interval_ms: u64,

    pub pong_timeout_ms: u64,

    pub auth_timeout_ms: u64,

    pub reconnect_base_ms: u64,

    pub reconnect_max_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server: String::new(),
            egress: TunnelEgress::Wifi,
            interface_name: "mproxy0".to_string(),
            routes: Vec::new(),
            mtu: tunnel::MTU,
            keepalive_interval_ms: tunnel::KEEPALIVE_INTERVAL_MS,
            pong_timeout_ms: tunnel::PONG_TIMEOUT_MS,
            auth_timeout_ms: tunnel::AUTH_TIMEOUT_MS,
            reconnect_base_ms: tunnel::RECONNECT_BASE_MS,
            reconnect_max_ms: tunnel::RECONNECT_MAX_MS,
        }
    }
}

impl TunnelConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

/// External commands behind one radio-toggle mechanism
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToggleCommandConfig {
    pub name: String,

    /// argv that turns airplane mode on
    pub enable: Vec<String>,

    /// argv that turns airplane mode off
    pub disable: Vec<String>,

    /// argv printing the current airplane mode state ("1"/"0")
    #[serde(default)]
    pub query: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Rotate automatically at this interval when set
    pub interval_secs: Option<u64>,

    pub toggle_timeout_ms: u64,

    pub settle_delay_ms: u64,

    pub reattach_timeout_ms: u64,

    pub disable_retry_delay_ms: u64,

    /// Toggle mechanisms, primary first
    pub toggles: Vec<ToggleCommandConfig>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval_secs: None,
            toggle_timeout_ms: rotation::TOGGLE_TIMEOUT_MS,
            settle_delay_ms: rotation::SETTLE_DELAY_MS,
            reattach_timeout_ms: rotation::REATTACH_TIMEOUT_MS,
            disable_retry_delay_ms: rotation::DISABLE_RETRY_DELAY_MS,
            toggles: Vec::new(),
        }
    }
}

impl RotationConfig {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn toggle_timeout(&self) -> Duration {
        Duration::from_millis(self.toggle_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn reattach_timeout(&self) -> Duration {
        Duration::from_millis(self.reattach_timeout_ms)
    }

    pub fn disable_retry_delay(&self) -> Duration {
        Duration::from_millis(self.disable_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,

    pub listen_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "127.0.0.1:8090".to_string(),
        }
    }
}

impl AppConfig {
    pub fn new() -> Self {
        Self {
            log_level: "info".to_string(),
            ..Self::default()
        }
    }

    pub fn with_base_port(mut self, port: u16) -> Self {
        self.proxy.base_port = port;
        self
    }

    pub fn with_device_id(mut self, id: DeviceId) -> Self {
        self.device.id = Some(id);
        self
    }

    pub fn with_tunnel_server(mut self, server: impl Into<String>) -> Self {
        self.tunnel.server = server.into();
        self.tunnel.enabled = true;
        self
    }

    pub fn with_toggle(mut self, toggle: ToggleCommandConfig) -> Self {
        self.rotation.toggles.push(toggle);
        self
    }

    /// The configured device id; never generated on load.
    pub fn device_id(&self) -> Result<DeviceId, ConfigError> {
        self.device
            .id
            .ok_or_else(|| ConfigError::InvalidValue("device.id is not set".to_string()))
    }

    pub fn log_level(&self) -> &str {
        if self.log_level.is_empty() {
            "info"
        } else {
            &self.log_level
        }
    }

    /// Rejects values the daemon cannot start with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.proxy.http_addr()?;
        self.proxy.socks5_addr()?;

        if self.tunnel.enabled && self.tunnel.server.is_empty() {
            return Err(ConfigError::InvalidValue(
                "tunnel.server is required when the tunnel is enabled".to_string(),
            ));
        }
        if self.tunnel.enabled && self.device.id.is_none() {
            return Err(ConfigError::InvalidValue(
                "device.id is required when the tunnel is enabled".to_string(),
            ));
        }
        for (name, value) in [
            ("tunnel.keepalive_interval_ms", self.tunnel.keepalive_interval_ms),
            ("tunnel.pong_timeout_ms", self.tunnel.pong_timeout_ms),
            ("tunnel.auth_timeout_ms", self.tunnel.auth_timeout_ms),
            ("network.poll_interval_ms", self.network.poll_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidValue(format!("{} must be positive", name)));
            }
        }
        if self.tunnel.reconnect_base_ms == 0
            || self.tunnel.reconnect_base_ms > self.tunnel.reconnect_max_ms
        {
            return Err(ConfigError::InvalidValue(
                "tunnel reconnect delays must satisfy 0 < base <= max".to_string(),
            ));
        }
        if self.tunnel.mtu < 576 {
            return Err(ConfigError::InvalidValue(format!(
                "tunnel.mtu {} below IPv4 minimum",
                self.tunnel.mtu
            )));
        }
        for toggle in &self.rotation.toggles {
            if toggle.enable.is_empty() || toggle.disable.is_empty() {
                return Err(ConfigError::InvalidValue(format!(
                    "toggle '{}' needs both enable and disable commands",
                    toggle.name
                )));
            }
        }
        if self.api.enabled {
            self.api
                .listen_addr
                .parse::<SocketAddr>()
                .map_err(|_| ConfigError::InvalidValue(format!("api.listen_addr {}", self.api.listen_addr)))?;
        }

        Ok(())
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),

    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::new();
        assert_eq!(config.proxy.base_port, proxy::DEFAULT_BASE_PORT);
        assert_eq!(config.tunnel.mtu, 1400);
        assert!(!config.tunnel.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_ports_follow_base() {
        let config = AppConfig::new().with_base_port(9000);
        assert_eq!(config.proxy.http_addr().unwrap().port(), 9000);
        assert_eq!(config.proxy.socks5_addr().unwrap().port(), 9001);

        let overflow = AppConfig::new().with_base_port(u16::MAX);
        assert!(overflow.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let id = DeviceId::parse("123e4567-e89b-12d3-a456-426614174000").unwrap();
        let config = AppConfig::new()
            .with_device_id(id)
            .with_tunnel_server("203.0.113.7:51820")
            .with_toggle(ToggleCommandConfig {
                name: "primary".to_string(),
                enable: vec!["true".to_string()],
                disable: vec!["true".to_string()],
                query: None,
            });

        assert_eq!(config.device_id().unwrap(), id);
        assert!(config.tunnel.enabled);
        assert_eq!(config.rotation.toggles.len(), 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = AppConfig::from_toml(
            r#"
            log_level = "debug"

            [device]
            id = "123e4567-e89b-12d3-a456-426614174000"

            [proxy]
            base_port = 7000

            [tunnel]
            enabled = true
            server = "vpn.example.net:4500"
            egress = "cellular"

            [[rotation.toggles]]
            name = "shell"
            enable = ["cmd", "connectivity", "airplane-mode", "enable"]
            disable = ["cmd", "connectivity", "airplane-mode", "disable"]
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level(), "debug");
        assert_eq!(config.proxy.base_port, 7000);
        assert_eq!(config.proxy.idle_timeout_secs, proxy::IDLE_TIMEOUT_SECS);
        assert_eq!(config.tunnel.egress, TunnelEgress::Cellular);
        assert_eq!(config.tunnel.keepalive_interval(), Duration::from_secs(25));
        assert_eq!(config.rotation.toggles[0].query, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tunnel_requires_server() {
        let mut config = AppConfig::new().with_device_id(DeviceId::generate());
        config.tunnel.enabled = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue(_))
        ));
    }

    #[test]
    fn test_toml_roundtrip_keeps_device_id() {
        let config = AppConfig::new().with_device_id(DeviceId::generate());
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.device.id, config.device.id);
    }

    #[test]
    fn test_missing_device_id_is_not_invented() {
        let text = r#"
            [tunnel]
            enabled = true
            server = "vpn.example.net:4500"
        "#;
        let first = AppConfig::from_toml(text).unwrap();
        let second = AppConfig::from_toml(text).unwrap();
        assert_eq!(first.device.id, None);
        assert_eq!(second.device.id, None);
        assert!(first.device_id().is_err());
        assert!(matches!(
            first.validate(),
            Err(ConfigError::InvalidValue(msg)) if msg.contains("device.id")
        ));

        // without the tunnel the id is optional
        let proxy_only = AppConfig::from_toml("[proxy]\nbase_port = 7000\n").unwrap();
        assert!(proxy_only.validate().is_ok());
    }

    #[test]
    fn test_zero_periods_are_rejected() {
        let zeroed: [fn(&mut AppConfig); 4] = [
            |c| c.tunnel.keepalive_interval_ms = 0,
            |c| c.tunnel.pong_timeout_ms = 0,
            |c| c.tunnel.auth_timeout_ms = 0,
            |c| c.network.poll_interval_ms = 0,
        ];
        for zero in zeroed {
            let mut config = AppConfig::new();
            zero(&mut config);
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidValue(msg)) if msg.contains("must be positive")
            ));
        }

        let from_file = AppConfig::from_toml(
            "[tunnel]\nkeepalive_interval_ms = 0\n[network]\npoll_interval_ms = 0\n",
        )
        .unwrap();
        assert!(from_file.validate().is_err());
    }
}
