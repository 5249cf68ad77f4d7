use std::net::SocketAddr;

use log::{debug, trace};

/// Observes traffic on the wire.
///
/// Sessions, discovery and the scanner take an observer explicitly instead of
/// consulting a process-wide verbosity flag. All methods default to doing
/// nothing, so an implementation only overrides what it cares about.
pub trait WireObserver: Send + Sync {
    /// A framed request is about to be written. `frame` has no terminator.
    fn on_send(&self, _peer: &SocketAddr, _frame: &str) {}

    /// A complete frame was received, before it is parsed.
    fn on_receive(&self, _peer: &SocketAddr, _frame: &str) {}

    /// A discovery reply datagram was received.
    fn on_discovery_reply(&self, _from: &SocketAddr, _reply: &str) {}

    /// A scanned host was verified as a device.
    fn on_host_verified(&self, _address: &SocketAddr) {}
}

/// Forwards everything to the `log` facade at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl WireObserver for LogObserver {
    fn on_send(&self, peer: &SocketAddr, frame: &str) {
        debug!("[send {}] {}", peer, frame);
    }

    fn on_receive(&self, peer: &SocketAddr, frame: &str) {
        debug!("[recv {}] {}", peer, frame);
    }

    fn on_discovery_reply(&self, from: &SocketAddr, reply: &str) {
        debug!("Discovery reply from {}:\n{}", from, reply.trim_end());
    }

    fn on_host_verified(&self, address: &SocketAddr) {
        trace!("Verified device at {}", address);
    }
}

/// Ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl WireObserver for NoopObserver {}
