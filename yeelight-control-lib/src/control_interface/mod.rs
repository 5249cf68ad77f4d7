use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::ValueEnum;
use derivative::Derivative;
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Instant};

use crate::config::ClientOptions;
use crate::error::{ControlError, Result};
use crate::util::codec::{FrameDecoder, Message, Param, Request, Response, FRAME_TERMINATOR};
use crate::util::discovery::Device;
use crate::util::traits::WireObserver;

#[cfg(test)]
pub(crate) mod mock;

const READ_CHUNK_SIZE: usize = 4096;

/// Properties queried when verifying a scanned host.
pub const VERIFY_PROPERTIES: [&str; 4] = ["power", "bright", "ct", "name"];

/// Lifecycle of a [`ControlSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Transition effect of a state change.
#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effect {
    Smooth,
    Sudden,
}

impl fmt::Display for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let effect_str = match self {
            Effect::Smooth => "smooth",
            Effect::Sudden => "sudden",
        };
        write!(f, "{}", effect_str)
    }
}

/// How a change is applied: effect plus duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub effect: Effect,
    pub duration: Duration,
}

impl Default for Transition {
    fn default() -> Self {
        Transition {
            effect: Effect::Smooth,
            duration: Duration::from_millis(300),
        }
    }
}

impl Transition {
    pub fn sudden() -> Self {
        Transition {
            effect: Effect::Sudden,
            duration: Duration::ZERO,
        }
    }

    fn params(&self) -> [Param; 2] {
        [
            Param::from(self.effect.to_string()),
            Param::Int(self.duration.as_millis().min(i64::MAX as u128) as i64),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Power {
    On,
    Off,
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Power::On => write!(f, "on"),
            Power::Off => write!(f, "off"),
        }
    }
}

/// Mode the light switches into when powered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Normal = 0,
    ColorTemperature = 1,
    Rgb = 2,
    Hsv = 3,
    ColorFlow = 4,
    NightLight = 5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RGB {
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl RGB {
    /// The color as the 24-bit integer the protocol expects.
    pub fn to_u32(self) -> u32 {
        (u32::from(self.red) << 16) | (u32::from(self.green) << 8) | u32::from(self.blue)
    }
}

impl From<u32> for RGB {
    fn from(value: u32) -> Self {
        RGB {
            red: (value >> 16) as u8,
            green: (value >> 8) as u8,
            blue: value as u8,
        }
    }
}

impl FromStr for RGB {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self> {
        parse_rgb(s).map(RGB::from)
    }
}

/// Parses a hex color such as `FF9900` or `#FF9900` into a 24-bit integer.
pub fn parse_rgb(input: &str) -> Result<u32> {
    let trimmed = input.trim();
    let hex = trimmed.strip_prefix('#').unwrap_or(trimmed);
    if hex.is_empty() || hex.len() > 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ControlError::Format(format!(
            "invalid hex color {:?}, expected up to six hex digits like FF9900",
            input
        )));
    }
    u32::from_str_radix(hex, 16)
        .map_err(|e| ControlError::Format(format!("invalid hex color {:?}: {}", input, e)))
}

/// Clamps a brightness percentage into the range the device accepts.
pub fn clamp_brightness(percent: i64) -> u8 {
    percent.clamp(1, 100) as u8
}

/// A control connection to one device.
///
/// The session starts `Disconnected`; [`ControlSession::connect`] opens the
/// TCP connection. Requests are issued one at a time with [`ControlSession::call`]
/// and correlated to their response by id. The socket is released on
/// [`ControlSession::close`], on a fatal I/O error, or when the session is
/// dropped.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct ControlSession {
    peer: SocketAddr,
    options: ClientOptions,
    state: ConnectionState,
    stream: Option<TcpStream>,
    decoder: FrameDecoder,
    next_id: u64,
    #[derivative(Debug = "ignore")]
    observer: Arc<dyn WireObserver>,
}

impl ControlSession {
    pub fn new(peer: SocketAddr, options: ClientOptions, observer: Arc<dyn WireObserver>) -> Self {
        ControlSession {
            peer,
            options,
            state: ConnectionState::Disconnected,
            stream: None,
            decoder: FrameDecoder::new(),
            next_id: 1,
            observer,
        }
    }

    /// Creates a session for a discovered device. The device's own port wins
    /// over the port in `options`.
    pub fn for_device(
        device: &Device,
        options: ClientOptions,
        observer: Arc<dyn WireObserver>,
    ) -> Self {
        Self::new(device.socket_addr(), options, observer)
    }

    /// Wraps an already established connection.
    pub fn from_stream(
        stream: TcpStream,
        options: ClientOptions,
        observer: Arc<dyn WireObserver>,
    ) -> Result<Self> {
        let peer = stream.peer_addr()?;
        let mut session = Self::new(peer, options, observer);
        session.stream = Some(stream);
        session.state = ConnectionState::Connected;
        Ok(session)
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Opens the connection. Does nothing if already connected.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        match timeout(self.options.connect_timeout, TcpStream::connect(self.peer)).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                debug!("Connected to {}", self.peer);
                self.stream = Some(stream);
                self.decoder.clear();
                self.state = ConnectionState::Connected;
                Ok(())
            }
            Ok(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                Err(ControlError::Connection(format!(
                    "failed to connect to {}: {}",
                    self.peer, e
                )))
            }
            Err(_) => {
                self.state = ConnectionState::Disconnected;
                Err(ControlError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    self.peer, self.options.connect_timeout
                )))
            }
        }
    }

    /// Closes the connection. Safe to call in any state.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
            debug!("Closed connection to {}", self.peer);
        }
        self.decoder.clear();
        self.state = ConnectionState::Disconnected;
    }

    fn disconnect(&mut self) {
        self.stream = None;
        self.decoder.clear();
        self.state = ConnectionState::Disconnected;
    }

    /// Sends one request and waits for the response with the same id.
    ///
    /// Notifications and responses to other ids that arrive while waiting are
    /// dropped. Fails with a timeout once the call deadline has passed, and with
    /// a connection error if the peer closes or the socket fails, which also
    /// moves the session to `Disconnected`.
    pub async fn call(&mut self, method: &str, params: Vec<Param>) -> Result<Response> {
        if !self.is_connected() {
            return Err(ControlError::NotConnected);
        }

        let id = self.next_id;
        self.next_id += 1;
        let frame = Request::new(id, method, params).encode()?;

        let result = self.exchange(id, &frame).await;
        if let Err(ControlError::Connection(_)) = &result {
            self.disconnect();
        }
        result
    }

    async fn exchange(&mut self, id: u64, frame: &[u8]) -> Result<Response> {
        let deadline = Instant::now() + self.options.call_timeout;
        let peer = self.peer;
        let stream = self.stream.as_mut().ok_or(ControlError::NotConnected)?;

        let line = String::from_utf8_lossy(&frame[..frame.len() - FRAME_TERMINATOR.len()]);
        self.observer.on_send(&peer, &line);
        stream
            .write_all(frame)
            .await
            .map_err(|e| ControlError::Connection(format!("failed to send to {}: {}", peer, e)))?;

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(ControlError::Timeout(format!(
                    "no reply to request {} from {} within {:?}",
                    id, peer, self.options.call_timeout
                )));
            }

            let wait = (deadline - now).min(self.options.read_timeout);
            let number_of_bytes = match timeout(wait, stream.read(&mut chunk)).await {
                Err(_) => continue,
                Ok(Ok(0)) => {
                    return Err(ControlError::Connection(format!(
                        "{} closed the connection",
                        peer
                    )))
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    return Err(ControlError::Connection(format!(
                        "failed to read from {}: {}",
                        peer, e
                    )))
                }
            };

            for raw in self.decoder.feed(&chunk[..number_of_bytes]) {
                self.observer.on_receive(&peer, &raw);
                match Message::decode(&raw) {
                    Some(Message::Response(response)) if response.id == id => return Ok(response),
                    Some(Message::Response(response)) => {
                        debug!("Dropping response to foreign id {} from {}", response.id, peer)
                    }
                    Some(Message::Notification(notification)) => {
                        trace!("Dropping notification from {}: {:?}", peer, notification)
                    }
                    Some(Message::Unrecognized(value)) => {
                        debug!("Skipping unrecognized frame from {}: {}", peer, value)
                    }
                    None => {}
                }
            }
        }
    }

    /// Like [`ControlSession::call`], but an error response becomes an error.
    async fn call_ok(&mut self, method: &str, params: Vec<Param>) -> Result<Vec<Value>> {
        let response = self.call(method, params).await?;
        response
            .outcome
            .map_err(|error| ControlError::Device {
                code: error.code,
                message: error.message,
            })
    }

    /// Reads the named properties. Values come back in request order.
    pub async fn query_properties(&mut self, names: &[&str]) -> Result<Vec<String>> {
        let params = names.iter().map(|name| Param::from(*name)).collect();
        let values = self.call_ok("get_prop", params).await?;
        if values.len() != names.len() {
            return Err(ControlError::Protocol(format!(
                "asked for {} properties, got {} values",
                names.len(),
                values.len()
            )));
        }
        Ok(values
            .into_iter()
            .map(|value| match value {
                Value::String(s) => s,
                other => other.to_string(),
            })
            .collect())
    }

    pub async fn set_power(
        &mut self,
        power: Power,
        transition: Transition,
        mode: Option<PowerMode>,
    ) -> Result<Vec<Value>> {
        let mut params = vec![Param::from(power.to_string())];
        params.extend(transition.params());
        if let Some(mode) = mode {
            params.push(Param::Int(mode as i64));
        }
        self.call_ok("set_power", params).await
    }

    /// Sets the brightness. Values outside 1..=100 are clamped.
    pub async fn set_brightness(&mut self, percent: i64, transition: Transition) -> Result<Vec<Value>> {
        let mut params = vec![Param::from(clamp_brightness(percent))];
        params.extend(transition.params());
        self.call_ok("set_bright", params).await
    }

    pub async fn set_color_temperature(
        &mut self,
        kelvin: u32,
        transition: Transition,
    ) -> Result<Vec<Value>> {
        let mut params = vec![Param::from(kelvin)];
        params.extend(transition.params());
        self.call_ok("set_ct_abx", params).await
    }

    pub async fn set_rgb(&mut self, rgb: RGB, transition: Transition) -> Result<Vec<Value>> {
        let mut params = vec![Param::from(rgb.to_u32())];
        params.extend(transition.params());
        self.call_ok("set_rgb", params).await
    }

    pub async fn toggle(&mut self) -> Result<Vec<Value>> {
        self.call_ok("toggle", Vec::new()).await
    }
}
