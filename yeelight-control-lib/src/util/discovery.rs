use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use log::{debug, info, warn};
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use crate::config::{DiscoveryOptions, CONTROL_PORT};
use crate::error::Result;
use crate::util::registry::DeviceRegistry;
use crate::util::traits::WireObserver;

const RECEIVE_BUFFER_SIZE: usize = 65535;

/// How a device was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSource {
    Multicast,
    Scan,
    /// Address given by the caller, discovery was skipped.
    Direct,
}

/// Identity used to deduplicate devices across replies and discovery paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceKey {
    Id(String),
    Address(IpAddr),
}

/// A device found on the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Device {
    /// Protocol-assigned id. Only multicast replies declare one.
    pub id: Option<String>,
    pub address: IpAddr,
    pub port: u16,
    pub model: Option<String>,
    /// "on" or "off" as last reported.
    pub power: Option<String>,
    /// Brightness in percent as last reported.
    pub brightness: Option<u8>,
    pub name: Option<String>,
    pub firmware_version: Option<String>,
    /// Methods the device declares support for.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub support: Vec<String>,
    pub source: DeviceSource,
}

impl Device {
    /// A bare device record for an address, with nothing else known.
    pub fn new(address: IpAddr, port: u16, source: DeviceSource) -> Self {
        Device {
            id: None,
            address,
            port,
            model: None,
            power: None,
            brightness: None,
            name: None,
            firmware_version: None,
            support: Vec::new(),
            source,
        }
    }

    pub fn key(&self) -> DeviceKey {
        match self.id.as_deref() {
            Some(id) if !id.is_empty() => DeviceKey::Id(id.to_string()),
            _ => DeviceKey::Address(self.address),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl Display for Device {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ip={} model={} power={} bright={}",
            self.address,
            self.model.as_deref().unwrap_or("?"),
            self.power.as_deref().unwrap_or("?"),
            self.brightness
                .map(|b| b.to_string())
                .unwrap_or_else(|| "?".to_string()),
        )
    }
}

pub struct Discovery;

impl Discovery {
    /// Builds the search datagram.
    pub fn search_request(options: &DiscoveryOptions) -> String {
        format!(
            "M-SEARCH * HTTP/1.1\r\nHOST: {}\r\nMAN: \"ssdp:discover\"\r\nST: {}\r\n\r\n",
            options.target, options.search_target
        )
    }

    /// Parses a discovery reply into a device.
    ///
    /// The reply is a status line followed by `Key: Value` lines. Keys are
    /// case-insensitive. `id` and `Location` are required, everything else is
    /// taken when present.
    pub fn parse_reply(reply: &str) -> Option<Device> {
        let headers = Self::parse_headers(reply);

        let id = headers.get("id").filter(|id| !id.is_empty())?;
        let (address, port) = Self::parse_location(headers.get("location")?)?;

        let mut device = Device::new(address, port, DeviceSource::Multicast);
        device.id = Some(id.clone());
        device.model = headers.get("model").cloned();
        device.power = headers.get("power").cloned();
        device.brightness = headers.get("bright").and_then(|b| b.parse().ok());
        device.name = headers.get("name").filter(|n| !n.is_empty()).cloned();
        device.firmware_version = headers.get("fw_ver").cloned();
        device.support = headers
            .get("support")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        Some(device)
    }

    fn parse_headers(reply: &str) -> HashMap<String, String> {
        reply
            .lines()
            .skip(1)
            .filter_map(|line| line.split_once(':'))
            .map(|(key, value)| (key.trim().to_lowercase(), value.trim().to_string()))
            .collect()
    }

    /// Splits `scheme://host:port` into address and port. A missing or
    /// unparsable port falls back to the control port.
    fn parse_location(location: &str) -> Option<(IpAddr, u16)> {
        let (_scheme, rest) = location.split_once("://")?;
        let authority = rest.split('/').next().unwrap_or(rest);
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().unwrap_or(CONTROL_PORT)),
            None => (authority, CONTROL_PORT),
        };
        let address = host.parse().ok()?;
        Some((address, port))
    }

    fn bind_search_socket() -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
        socket.set_nonblocking(true)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    /// Sends one search request and collects replies until the window closes.
    ///
    /// Failing to bind or send is an error. Replies are deduplicated by id and
    /// the last reply for an id wins, so a device that changes state during the
    /// window is reported with its latest state.
    pub async fn find_devices(
        options: &DiscoveryOptions,
        observer: &dyn WireObserver,
    ) -> Result<Vec<Device>> {
        let socket = Self::bind_search_socket()?;
        socket
            .send_to(Self::search_request(options).as_bytes(), options.target)
            .await?;

        let mut registry = DeviceRegistry::new();
        let mut buffer = vec![0u8; RECEIVE_BUFFER_SIZE];
        let timeout_end = Instant::now() + options.window;

        loop {
            let now = Instant::now();
            if now >= timeout_end {
                break;
            }

            match timeout(timeout_end - now, socket.recv_from(&mut buffer)).await {
                Ok(Ok((number_of_bytes, src_addr))) => {
                    let reply = String::from_utf8_lossy(&buffer[..number_of_bytes]);
                    observer.on_discovery_reply(&src_addr, &reply);
                    match Self::parse_reply(&reply) {
                        Some(device) => {
                            debug!("Discovery reply from {}: {}", src_addr, device);
                            registry.insert(device);
                        }
                        None => debug!("Ignoring unrecognized reply from {}", src_addr),
                    }
                }
                Ok(Err(e)) => {
                    warn!("Failed to receive discovery reply: {}", e);
                    break;
                }
                Err(_) => break,
            }
        }

        info!("Multicast discovery found {} device(s)", registry.len());
        Ok(registry.into_devices())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::traits::NoopObserver;
    use std::net::SocketAddrV4;
    use std::time::Duration;

    fn reply(id: &str, power: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\n\
             Cache-Control: max-age=3600\r\n\
             Location: yeelight://127.0.0.1:55443\r\n\
             Server: POSIX UPnP/1.0 YGLC/1\r\n\
             id: {}\r\n\
             model: color\r\n\
             fw_ver: 18\r\n\
             support: get_prop set_default set_power toggle set_bright\r\n\
             power: {}\r\n\
             bright: 50\r\n\
             name: \r\n\r\n",
            id, power
        )
    }

    #[test]
    fn test_search_request() {
        let request = Discovery::search_request(&DiscoveryOptions::default());
        assert_eq!(
            request,
            "M-SEARCH * HTTP/1.1\r\nHOST: 239.255.255.250:1982\r\nMAN: \"ssdp:discover\"\r\nST: wifi_bulb\r\n\r\n"
        );
    }

    #[test]
    fn test_parse_reply() {
        let device = Discovery::parse_reply(&reply("0x000000000015243f", "on")).unwrap();
        assert_eq!(device.id.as_deref(), Some("0x000000000015243f"));
        assert_eq!(device.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(device.port, 55443);
        assert_eq!(device.model.as_deref(), Some("color"));
        assert_eq!(device.power.as_deref(), Some("on"));
        assert_eq!(device.brightness, Some(50));
        assert_eq!(device.name, None);
        assert_eq!(device.firmware_version.as_deref(), Some("18"));
        assert_eq!(device.support.len(), 5);
        assert_eq!(device.source, DeviceSource::Multicast);
    }

    #[test]
    fn test_parse_reply_headers_are_case_insensitive() {
        let text = "HTTP/1.1 200 OK\r\nLOCATION: yeelight://10.0.0.7:1234\r\nID: 0xabc\r\nPOWER: off\r\n";
        let device = Discovery::parse_reply(text).unwrap();
        assert_eq!(device.id.as_deref(), Some("0xabc"));
        assert_eq!(device.address, "10.0.0.7".parse::<IpAddr>().unwrap());
        assert_eq!(device.port, 1234);
        assert_eq!(device.power.as_deref(), Some("off"));
    }

    #[test]
    fn test_parse_reply_requires_id_and_location() {
        assert!(Discovery::parse_reply("HTTP/1.1 200 OK\r\nid: 0x1\r\n").is_none());
        assert!(
            Discovery::parse_reply("HTTP/1.1 200 OK\r\nLocation: yeelight://10.0.0.7:1\r\n")
                .is_none()
        );
        assert!(Discovery::parse_reply(
            "HTTP/1.1 200 OK\r\nid: 0x1\r\nLocation: not-a-uri\r\n"
        )
        .is_none());
    }

    #[test]
    fn test_parse_location_defaults_port() {
        assert_eq!(
            Discovery::parse_location("yeelight://192.168.1.20"),
            Some(("192.168.1.20".parse().unwrap(), CONTROL_PORT))
        );
        assert_eq!(
            Discovery::parse_location("yeelight://192.168.1.20:x"),
            Some(("192.168.1.20".parse().unwrap(), CONTROL_PORT))
        );
    }

    #[tokio::test]
    async fn test_find_devices_last_reply_wins() {
        let responder = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = match responder.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };

        let handle = tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            let (n, from) = responder.recv_from(&mut buffer).await.unwrap();
            responder
                .send_to(reply("0x1", "off").as_bytes(), from)
                .await
                .unwrap();
            responder
                .send_to(b"garbage without headers", from)
                .await
                .unwrap();
            responder
                .send_to(reply("0x1", "on").as_bytes(), from)
                .await
                .unwrap();
            String::from_utf8_lossy(&buffer[..n]).into_owned()
        });

        let options = DiscoveryOptions {
            target,
            window: Duration::from_millis(300),
            ..Default::default()
        };
        let devices = Discovery::find_devices(&options, &NoopObserver)
            .await
            .unwrap();

        let request = handle.await.unwrap();
        assert!(request.starts_with("M-SEARCH * HTTP/1.1\r\n"));
        assert!(request.contains("ST: wifi_bulb\r\n"));

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id.as_deref(), Some("0x1"));
        assert_eq!(devices[0].power.as_deref(), Some("on"));
    }

    #[tokio::test]
    async fn test_find_devices_without_replies_is_empty() {
        let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target: SocketAddrV4 = match silent.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!(),
        };
        let options = DiscoveryOptions {
            target,
            window: Duration::from_millis(100),
            ..Default::default()
        };

        let devices = Discovery::find_devices(&options, &NoopObserver)
            .await
            .unwrap();
        assert!(devices.is_empty());
    }
}
