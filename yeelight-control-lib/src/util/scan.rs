//! Subnet scan, the fallback when multicast discovery finds nothing.
//!
//! Every host of the local /24 networks is probed with a short TCP connect on
//! the control port. A host that accepts is only a candidate; it counts as a
//! device once it answers a property query with one value per property.
//! Probes run concurrently up to the configured worker count, and the result
//! is keyed by address so it does not depend on which probe finishes first.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use log::{debug, info, trace, warn};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};

use crate::config::{ClientOptions, ScanOptions};
use crate::control_interface::{ControlSession, VERIFY_PROPERTIES};
use crate::util::discovery::{Device, DeviceSource};
use crate::util::traits::WireObserver;

pub struct SubnetScanner {
    options: Arc<ScanOptions>,
    observer: Arc<dyn WireObserver>,
}

impl SubnetScanner {
    pub fn new(options: ScanOptions, observer: Arc<dyn WireObserver>) -> Self {
        SubnetScanner {
            options: Arc::new(options),
            observer,
        }
    }

    /// Local IPv4 addresses whose networks are scanned: the configured ones
    /// followed by the addresses of every active interface.
    pub fn local_addresses(&self) -> Vec<Ipv4Addr> {
        let detected = if self.options.detect_interfaces {
            interface_ipv4s().unwrap_or_else(|e| {
                debug!("Could not list network interfaces: {}", e);
                Vec::new()
            })
        } else {
            Vec::new()
        };
        scan_addresses(&self.options.interfaces, &detected)
    }

    /// Scans the /24 networks of all local addresses.
    pub async fn scan(&self) -> Vec<Device> {
        let addresses = self.local_addresses();
        if addresses.is_empty() {
            info!("No local IPv4 address to scan from");
            return Vec::new();
        }
        let hosts = candidate_hosts(&addresses);
        info!(
            "Scanning {} host(s) around {:?} on port {}",
            hosts.len(),
            addresses,
            self.options.port
        );
        self.scan_hosts(hosts).await
    }

    /// Probes the given hosts concurrently and returns the verified devices
    /// sorted by address.
    ///
    /// Once the scan deadline passes, probes still pending are aborted and the
    /// devices verified so far are returned.
    pub async fn scan_hosts(&self, hosts: Vec<Ipv4Addr>) -> Vec<Device> {
        let deadline = Instant::now() + self.options.deadline;
        let workers = Arc::new(Semaphore::new(
            self.options.workers.clamp(1, Semaphore::MAX_PERMITS),
        ));
        let mut probes = JoinSet::new();

        for host in hosts {
            let workers = workers.clone();
            let options = self.options.clone();
            let observer = self.observer.clone();
            probes.spawn(async move {
                let _permit = workers.acquire_owned().await.ok()?;
                probe(host, &options, observer).await
            });
        }

        let mut found = BTreeMap::new();
        loop {
            match timeout_at(deadline, probes.join_next()).await {
                Ok(Some(Ok(Some(device)))) => {
                    found.insert(device.address, device);
                }
                Ok(Some(Ok(None))) => {}
                Ok(Some(Err(e))) => warn!("Probe task failed: {}", e),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        "Scan deadline passed, abandoning {} pending probe(s)",
                        probes.len()
                    );
                    probes.abort_all();
                    break;
                }
            }
        }

        info!("Subnet scan found {} device(s)", found.len());
        found.into_values().collect()
    }
}

/// Connects to one host and verifies it with a property query.
async fn probe(
    host: Ipv4Addr,
    options: &ScanOptions,
    observer: Arc<dyn WireObserver>,
) -> Option<Device> {
    let address = SocketAddr::new(IpAddr::V4(host), options.port);
    let stream = match timeout(options.connect_timeout, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => stream,
        _ => return None,
    };
    trace!("Candidate host {}", address);

    let client_options = ClientOptions {
        port: options.port,
        connect_timeout: options.connect_timeout,
        call_timeout: options.verify_timeout,
        read_timeout: options.verify_timeout.min(ClientOptions::default().read_timeout),
    };
    let mut session = ControlSession::from_stream(stream, client_options, observer.clone()).ok()?;
    let verified = session.query_properties(&VERIFY_PROPERTIES).await;
    session.close().await;

    match verified {
        Ok(values) => {
            observer.on_host_verified(&address);
            let mut device = Device::new(address.ip(), options.port, DeviceSource::Scan);
            device.power = values.first().filter(|v| !v.is_empty()).cloned();
            device.brightness = values.get(1).and_then(|v| v.parse().ok());
            device.name = values.get(3).filter(|v| !v.is_empty()).cloned();
            Some(device)
        }
        Err(e) => {
            debug!("{} accepted a connection but is not a device: {}", address, e);
            None
        }
    }
}

/// Every host address (.1 to .254) of the /24 networks of `addresses`.
pub fn candidate_hosts(addresses: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let networks: BTreeSet<[u8; 3]> = addresses
        .iter()
        .map(|address| {
            let [a, b, c, _] = address.octets();
            [a, b, c]
        })
        .collect();
    networks
        .into_iter()
        .flat_map(|[a, b, c]| (1..=254).map(move |d| Ipv4Addr::new(a, b, c, d)))
        .collect()
}

/// Merges configured and detected addresses, keeping the first occurrence.
///
/// Link-local and unspecified addresses are never scanned. Loopback addresses
/// are only scanned when configured explicitly.
fn scan_addresses(configured: &[Ipv4Addr], detected: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let mut seen = BTreeSet::new();
    configured
        .iter()
        .copied()
        .filter(|address| is_scannable(*address))
        .chain(
            detected
                .iter()
                .copied()
                .filter(|address| is_scannable(*address) && !address.is_loopback()),
        )
        .filter(|address| seen.insert(*address))
        .collect()
}

fn is_scannable(address: Ipv4Addr) -> bool {
    !address.is_link_local() && !address.is_unspecified()
}

/// IPv4 addresses of all non-loopback interfaces.
fn interface_ipv4s() -> io::Result<Vec<Ipv4Addr>> {
    Ok(if_addrs::get_if_addrs()?
        .into_iter()
        .filter(|interface| !interface.is_loopback())
        .filter_map(|interface| match interface.ip() {
            IpAddr::V4(address) => Some(address),
            IpAddr::V6(_) => None,
        })
        .collect())
}
