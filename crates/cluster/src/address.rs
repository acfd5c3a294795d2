//! Node addresses and client descriptors

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tessera_core::CacheError;

/// A cluster node, as `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CacheError::invalid_argument(format!("missing port in '{}'", s)))?;
        if host.is_empty() {
            return Err(CacheError::invalid_argument(format!("missing host in '{}'", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| CacheError::invalid_argument(format!("invalid port in '{}'", s)))?;
        Ok(NodeAddress::new(host, port))
    }
}

/// Whether a client is currently reachable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityStatus {
    Connected,
    Disconnected,
}

/// What a client told us about itself when it connected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub app_name: Option<String>,
    pub machine_name: Option<String>,
    pub process_id: Option<u32>,
    pub connected_at: DateTime<Utc>,
    pub status: ConnectivityStatus,
}

impl ClientInfo {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            app_name: None,
            machine_name: None,
            process_id: None,
            connected_at: Utc::now(),
            status: ConnectivityStatus::Connected,
        }
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn with_machine(mut self, machine_name: impl Into<String>, process_id: u32) -> Self {
        self.machine_name = Some(machine_name.into());
        self.process_id = Some(process_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr: NodeAddress = "10.0.0.5:8250".parse().unwrap();
        assert_eq!(addr, NodeAddress::new("10.0.0.5", 8250));
        assert_eq!(addr.to_string(), "10.0.0.5:8250");
    }

    #[test]
    fn test_parse_address_rejects_garbage() {
        assert!("node-a".parse::<NodeAddress>().is_err());
        assert!(":9000".parse::<NodeAddress>().is_err());
        assert!("node-a:http".parse::<NodeAddress>().is_err());
        assert!("node-a:70000".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn test_client_info_serializes() {
        let info = ClientInfo::new("c1").with_app_name("billing");
        let json = serde_json::to_string(&info).unwrap();
        let back: ClientInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back, info);
    }
}
