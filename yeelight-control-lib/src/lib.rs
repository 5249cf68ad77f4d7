//! # Yeelight Control Library
//!
//! `yeelight-control-lib` finds Yeelight smart lights on the local network and
//! controls them over their LAN protocol: line-delimited JSON requests on a
//! TCP connection, and an SSDP-like search over UDP multicast.
//!
//! This library is designed to be used by command-line tools or other client
//! applications that need to switch, dim or color lights.
//!
//! ## Features
//!
//! - Multicast discovery with per-device deduplication
//! - Subnet scan fallback with concurrent, verified probes
//! - A control session with id-correlated requests and per-call deadlines
//! - Typed wrappers for power, brightness, color temperature and RGB color
//!
//! The LAN control option has to be enabled for each light in the Yeelight app.
//!
//! ## Example
//!
//! Find the single light on the network and turn it orange:
//!
//! ```no_run
//! use std::sync::Arc;
//! use yeelight_control_lib::config::Settings;
//! use yeelight_control_lib::control_interface::{Transition, RGB};
//! use yeelight_control_lib::util::traits::LogObserver;
//! use yeelight_control_lib::{open_session, resolve_target};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::default();
//!     let observer = Arc::new(LogObserver);
//!
//!     let device = resolve_target(None, &settings, observer.clone()).await?;
//!     let mut session = open_session(&device, &settings.client, observer).await?;
//!     let orange: RGB = "FF9900".parse()?;
//!     session.set_rgb(orange, Transition::default()).await?;
//!     session.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Disclaimer
//!
//! This project is not affiliated with, authorized by, endorsed by, or in any way officially connected
//! with Yeelight or its affiliates.
//!
//! ## License
//!
//! This project is dual-licensed under the MIT License and the Apache License, Version 2.0.
//! You may choose to use either license, depending on your project needs.

use std::net::IpAddr;
use std::sync::Arc;

use log::{info, warn};

use crate::config::{ClientOptions, Settings};
use crate::control_interface::ControlSession;
use crate::error::Result;
use crate::util::discovery::{Device, DeviceSource, Discovery};
use crate::util::registry::DeviceRegistry;
use crate::util::scan::SubnetScanner;
use crate::util::traits::WireObserver;

// Timeouts, ports and worker counts, loadable from a configuration file.
pub mod config;

// The `control_interface` module holds the control session: one TCP
// connection to one light, with typed wrappers for the common commands.
//
// Example usage:
//
// ```
// let mut session = ControlSession::new(addr, ClientOptions::default(), Arc::new(LogObserver));
// session.connect().await?;
// session.set_brightness(70, Transition::default()).await?;
// ```
pub mod control_interface;

pub mod error;

// The `util` module contains the wire codec, multicast discovery, the subnet
// scan fallback, the device registry and the wire observer trait.
pub mod util;

/// Finds devices on the network.
///
/// Multicast discovery runs first. Only when it finds nothing, or fails, the
/// subnet scan runs. Failures of either path are logged and degrade to an
/// empty result.
pub async fn discover_devices(settings: &Settings, observer: Arc<dyn WireObserver>) -> Vec<Device> {
    let mut registry = DeviceRegistry::new();

    match Discovery::find_devices(&settings.discovery, observer.as_ref()).await {
        Ok(devices) => registry.merge(devices),
        Err(e) => warn!("Multicast discovery failed: {}", e),
    }

    if registry.is_empty() {
        info!("No multicast replies, falling back to subnet scan");
        let scanner = SubnetScanner::new(settings.scan.clone(), observer);
        registry.merge(scanner.scan().await);
    }

    registry.into_devices()
}

/// Resolves the device to control.
///
/// An explicit address skips discovery. Otherwise exactly one discovered
/// device is selected; none is [`error::ControlError::NoDevicesFound`] and
/// several are returned to the caller as
/// [`error::ControlError::AmbiguousSelection`].
pub async fn resolve_target(
    explicit: Option<IpAddr>,
    settings: &Settings,
    observer: Arc<dyn WireObserver>,
) -> Result<Device> {
    if let Some(address) = explicit {
        return Ok(Device::new(address, settings.client.port, DeviceSource::Direct));
    }

    discover_devices(settings, observer)
        .await
        .into_iter()
        .collect::<DeviceRegistry>()
        .select()
}

/// Opens a connected control session to `device`.
pub async fn open_session(
    device: &Device,
    options: &ClientOptions,
    observer: Arc<dyn WireObserver>,
) -> Result<ControlSession> {
    let mut session = ControlSession::for_device(device, options.clone(), observer);
    session.connect().await?;
    Ok(session)
}
