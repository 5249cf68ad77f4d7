use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use serde::{Deserialize, Deserializer};

/// Well-known TCP control port of the bulbs.
pub const CONTROL_PORT: u16 = 55443;
/// Multicast group the search request is sent to.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
/// Multicast port the bulbs listen on for search requests.
pub const MULTICAST_PORT: u16 = 1982;
/// Search target announced in the `ST` header.
pub const SEARCH_TARGET: &str = "wifi_bulb";

/// Options for a single control session.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientOptions {
    pub port: u16,
    /// Timeout for establishing the TCP connection.
    #[serde(deserialize_with = "deserialize_duration_millis")]
    pub connect_timeout: Duration,
    /// Absolute deadline for one request to receive its matching response.
    #[serde(deserialize_with = "deserialize_duration_millis")]
    pub call_timeout: Duration,
    /// Upper bound for a single socket read while waiting for a response.
    #[serde(deserialize_with = "deserialize_duration_millis")]
    pub read_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            port: CONTROL_PORT,
            connect_timeout: Duration::from_secs(3),
            call_timeout: Duration::from_secs(4),
            read_timeout: Duration::from_millis(250),
        }
    }
}

/// Options for multicast discovery.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiscoveryOptions {
    /// Where the search request is sent. Normally the multicast group.
    pub target: SocketAddrV4,
    pub search_target: String,
    /// Length of the window in which replies are collected.
    #[serde(deserialize_with = "deserialize_duration_millis")]
    pub window: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        DiscoveryOptions {
            target: SocketAddrV4::new(MULTICAST_GROUP, MULTICAST_PORT),
            search_target: SEARCH_TARGET.to_string(),
            window: Duration::from_millis(1500),
        }
    }
}

/// Options for the subnet scan fallback.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScanOptions {
    pub port: u16,
    /// Timeout for the candidate TCP connect to each host.
    #[serde(deserialize_with = "deserialize_duration_millis")]
    pub connect_timeout: Duration,
    /// Deadline for the verification property query on a candidate.
    #[serde(deserialize_with = "deserialize_duration_millis")]
    pub verify_timeout: Duration,
    /// Maximum number of hosts probed at the same time.
    pub workers: usize,
    /// Deadline for the whole scan; probes still pending are abandoned.
    #[serde(deserialize_with = "deserialize_duration_millis")]
    pub deadline: Duration,
    /// Look up the local interface address automatically.
    pub detect_interfaces: bool,
    /// Additional local addresses whose /24 networks are scanned.
    pub interfaces: Vec<Ipv4Addr>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        ScanOptions {
            port: CONTROL_PORT,
            connect_timeout: Duration::from_millis(250),
            verify_timeout: Duration::from_secs(1),
            workers: 64,
            deadline: Duration::from_secs(15),
            detect_interfaces: true,
            interfaces: Vec::new(),
        }
    }
}

/// All library settings, as loaded from a configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub client: ClientOptions,
    pub discovery: DiscoveryOptions,
    pub scan: ScanOptions,
}

fn deserialize_duration_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let millis: u64 = Deserialize::deserialize(deserializer)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_keep_defaults() {
        let json = r#"{"client": {"call_timeout": 1500}, "scan": {"workers": 8}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();

        assert_eq!(settings.client.call_timeout, Duration::from_millis(1500));
        assert_eq!(settings.client.port, CONTROL_PORT);
        assert_eq!(settings.scan.workers, 8);
        assert_eq!(settings.scan.connect_timeout, Duration::from_millis(250));
        assert_eq!(settings.discovery, DiscoveryOptions::default());
    }

    #[test]
    fn test_discovery_target_parses_from_string() {
        let json = r#"{"target": "127.0.0.1:1982", "window": 200}"#;
        let options: DiscoveryOptions = serde_json::from_str(json).unwrap();
        assert_eq!(options.target, "127.0.0.1:1982".parse().unwrap());
        assert_eq!(options.window, Duration::from_millis(200));
        assert_eq!(options.search_target, SEARCH_TARGET);
    }
}
