use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::options::{DhcpOption, OptionCode};
use crate::packet::{DEFAULT_MIN_PACKET_SIZE, MIN_PACKET_SIZE_FLOOR};
use crate::pool::AddressPool;

/// Whether a configured option is always sent or only when the client
/// asks for it in the parameter request list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionMode {
    Force,
    Optional,
}

/// An operator-configured option applied to OFFER/ACK replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfiguredOption {
    pub option: DhcpOption,
    pub mode: OptionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Address and port the server socket binds to.
    pub endpoint: SocketAddr,
    /// `a.b.c.d-a.b.c.e` or CIDR notation.
    pub pool_range: String,
    /// Zero disables auto-expiry (infinite leases).
    pub default_lease_time_seconds: u32,
    /// Replies are padded to at least this many octets (floor 312).
    pub minimum_packet_size: usize,
    #[serde(default)]
    pub options: Vec<ConfiguredOption>,
    /// Leases handed back by an external persister, loaded at startup.
    #[serde(default)]
    pub initial_leases: Vec<Lease>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: SocketAddr::from(([0, 0, 0, 0], 67)),
            pool_range: "192.168.1.100-192.168.1.200".to_string(),
            default_lease_time_seconds: 86400,
            minimum_packet_size: DEFAULT_MIN_PACKET_SIZE,
            options: vec![
                ConfiguredOption {
                    option: DhcpOption::ServerIdentifier(Ipv4Addr::new(192, 168, 1, 1)),
                    mode: OptionMode::Force,
                },
                ConfiguredOption {
                    option: DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)),
                    mode: OptionMode::Force,
                },
            ],
            initial_leases: Vec::new(),
        }
    }
}

impl Config {
    pub async fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path).await?;
            Ok(config)
        }
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if !self.endpoint.is_ipv4() {
            return Err(Error::InvalidConfig(
                "endpoint must be an IPv4 address".to_string(),
            ));
        }

        AddressPool::new(&self.pool_range)?;

        if self.minimum_packet_size < MIN_PACKET_SIZE_FLOOR {
            return Err(Error::InvalidConfig(format!(
                "minimum_packet_size must be at least {}",
                MIN_PACKET_SIZE_FLOOR
            )));
        }

        let mut seen_codes: HashSet<u8> = HashSet::new();
        for configured in &self.options {
            let code = configured.option.code();
            if code == OptionCode::MessageType as u8 {
                return Err(Error::InvalidConfig(
                    "option 53 (message type) cannot be configured".to_string(),
                ));
            }
            if !seen_codes.insert(code) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate configured option: {}",
                    code
                )));
            }
        }

        let mut seen_hwaddrs: HashSet<&str> = HashSet::new();
        for lease in &self.initial_leases {
            if !seen_hwaddrs.insert(lease.hwaddr.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate hardware address in initial leases: {}",
                    lease.hwaddr
                )));
            }
        }

        Ok(())
    }

    /// Operator-configured server identifier (option 54), if any.
    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|configured| match configured.option {
            DhcpOption::ServerIdentifier(addr) => Some(addr),
            _ => None,
        })
    }

    /// Operator-configured broadcast address (option 28), if any.
    pub fn broadcast_address(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|configured| match configured.option {
            DhcpOption::BroadcastAddress(addr) => Some(addr),
            _ => None,
        })
    }
}

pub fn sanitize_hostname(hostname: &str) -> String {
    hostname
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '.')
        .take(255)
        .collect()
}
