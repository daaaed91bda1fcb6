pub mod noop;

use lazy_static::lazy_static;
use log::{debug, info, warn};
use prometheus::{register_int_counter_vec, IntCounterVec};
use serde::Serialize;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::str::FromStr;
use std::time::{Duration, Instant};

pub const WOL_PORT: u16 = 9;
pub const MAGIC_PACKET_LEN: usize = 6 + 6 * MAC_REPETITIONS;

const SYNCHRONIZATION_SCHEME: [u8; 6] = [0xff; 6];
const MAC_REPETITIONS: usize = 16;
// "xx:xx:xx:xx:xx:xx"
const MAC_TEXT_LEN: usize = 17;
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(500);

lazy_static! {
    static ref SEND_ATTEMPTS: IntCounterVec = register_int_counter_vec!(
        "wol_send_attempts_total",
        "Magic packet send attempts by delivery path and result.",
        &["path", "result"]
    )
    .unwrap();
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid MAC address format: {0:?} (expected e.g. 00:11:22:33:44:55)")]
    InvalidFormat(String),
    #[error("failed to send magic packet (primary: {primary}; fallback: {fallback})")]
    Send {
        primary: io::Error,
        #[source]
        fallback: io::Error,
    },
}

/// A hardware address that has passed validation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        MacAddress(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

fn hex_value(c: u8) -> Option<u8> {
    (c as char).to_digit(16).map(|d| d as u8)
}

impl FromStr for MacAddress {
    type Err = Error;

    /// Parses six two-digit hex groups separated uniformly by ':' or '-'.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidFormat(s.to_string());
        let raw = s.as_bytes();
        if raw.len() != MAC_TEXT_LEN {
            return Err(invalid());
        }
        let separator = raw[2];
        if separator != b':' && separator != b'-' {
            return Err(invalid());
        }
        let mut octets = [0u8; 6];
        for (i, group) in raw.chunks(3).enumerate() {
            match (hex_value(group[0]), hex_value(group[1])) {
                (Some(hi), Some(lo)) => octets[i] = hi << 4 | lo,
                _ => return Err(invalid()),
            }
            if let Some(&sep) = group.get(2) {
                if sep != separator {
                    return Err(invalid());
                }
            }
        }
        Ok(MacAddress(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

pub fn validate_and_parse(raw: &str) -> Result<MacAddress, Error> {
    raw.parse()
}

/// The Wake-on-LAN payload: the synchronization scheme followed by the
/// target MAC repeated sixteen times.
#[derive(Clone, PartialEq, Eq)]
pub struct MagicPacket([u8; MAGIC_PACKET_LEN]);

impl MagicPacket {
    pub fn new(mac_address: MacAddress) -> Self {
        let mut data = [0u8; MAGIC_PACKET_LEN];
        data[..SYNCHRONIZATION_SCHEME.len()].copy_from_slice(&SYNCHRONIZATION_SCHEME);
        for chunk in data[SYNCHRONIZATION_SCHEME.len()..].chunks_exact_mut(6) {
            chunk.copy_from_slice(&mac_address.0);
        }
        MagicPacket(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for MagicPacket {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MagicPacket")
            .field(&MacAddress(
                self.0[6..12].try_into().map_err(|_| fmt::Error)?,
            ))
            .finish()
    }
}

pub fn build_magic_packet(mac: MacAddress) -> MagicPacket {
    MagicPacket::new(mac)
}

/// Socket operations used by the [`Sender`]. Each call owns its socket for
/// the duration of the call and returns the number of bytes written.
pub trait Transport: Sync + Send {
    fn send_connected(
        &self,
        dest: SocketAddrV4,
        payload: &[u8],
        timeout: Duration,
    ) -> io::Result<usize>;
    fn send_unconnected(
        &self,
        dest: SocketAddrV4,
        payload: &[u8],
        timeout: Duration,
    ) -> io::Result<usize>;
}

pub struct UdpTransport;

impl UdpTransport {
    fn broadcast_socket(timeout: Duration) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.set_broadcast(true)?;
        socket.set_write_timeout(Some(timeout))?;
        Ok(socket)
    }
}

impl Transport for UdpTransport {
    fn send_connected(
        &self,
        dest: SocketAddrV4,
        payload: &[u8],
        timeout: Duration,
    ) -> io::Result<usize> {
        let socket = Self::broadcast_socket(timeout)?;
        socket.connect(dest)?;
        socket.send(payload)
    }

    fn send_unconnected(
        &self,
        dest: SocketAddrV4,
        payload: &[u8],
        timeout: Duration,
    ) -> io::Result<usize> {
        let socket = Self::broadcast_socket(timeout)?;
        socket.send_to(payload, dest)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    Primary,
    Fallback,
}

impl Delivery {
    fn as_str(&self) -> &'static str {
        match self {
            Delivery::Primary => "primary",
            Delivery::Fallback => "fallback",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SendConfig {
    pub primary_addr: SocketAddrV4,
    // Where the unconnected retry goes. A subnet broadcast such as
    // 192.168.1.255 can be configured for hosts without a default route.
    pub fallback_addr: SocketAddrV4,
    // Budget for one whole send, primary and fallback together.
    pub timeout: Duration,
}

impl Default for SendConfig {
    fn default() -> Self {
        SendConfig {
            primary_addr: SocketAddrV4::new(Ipv4Addr::BROADCAST, WOL_PORT),
            fallback_addr: SocketAddrV4::new(Ipv4Addr::BROADCAST, WOL_PORT),
            timeout: DEFAULT_SEND_TIMEOUT,
        }
    }
}

pub struct Sender {
    transport: Box<dyn Transport>,
    config: SendConfig,
}

impl Sender {
    pub fn new(transport: Box<dyn Transport>, config: SendConfig) -> Self {
        Sender { transport, config }
    }

    fn attempt(
        &self,
        path: Delivery,
        packet: &MagicPacket,
        deadline: Instant,
    ) -> io::Result<()> {
        let timeout = match deadline.checked_duration_since(Instant::now()) {
            Some(t) if !t.is_zero() => t,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "send deadline exceeded",
                ))
            }
        };
        let payload = packet.as_bytes();
        let written = match path {
            Delivery::Primary => {
                self.transport
                    .send_connected(self.config.primary_addr, payload, timeout)?
            }
            Delivery::Fallback => {
                self.transport
                    .send_unconnected(self.config.fallback_addr, payload, timeout)?
            }
        };
        if written != payload.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", written, payload.len()),
            ));
        }
        Ok(())
    }

    fn record(&self, path: Delivery, result: &io::Result<()>) {
        let outcome = if result.is_ok() { "ok" } else { "error" };
        SEND_ATTEMPTS
            .with_label_values(&[path.as_str(), outcome])
            .inc();
    }

    /// Broadcasts `packet`, falling back to an unconnected socket when the
    /// connected send fails. Both attempts share the time left until
    /// `deadline`.
    pub fn send(&self, packet: &MagicPacket, deadline: Instant) -> Result<Delivery, Error> {
        let primary = self.attempt(Delivery::Primary, packet, deadline);
        self.record(Delivery::Primary, &primary);
        let primary = match primary {
            Ok(()) => {
                debug!("sent {:?} to {}", packet, self.config.primary_addr);
                return Ok(Delivery::Primary);
            }
            Err(err) => err,
        };
        warn!(
            "broadcast to {} failed: {}, retrying unconnected to {}",
            self.config.primary_addr, primary, self.config.fallback_addr
        );

        let fallback = self.attempt(Delivery::Fallback, packet, deadline);
        self.record(Delivery::Fallback, &fallback);
        match fallback {
            Ok(()) => {
                debug!("sent {:?} to {}", packet, self.config.fallback_addr);
                Ok(Delivery::Fallback)
            }
            Err(fallback) => Err(Error::Send { primary, fallback }),
        }
    }

    /// Validates `raw_mac`, builds its magic packet and sends it within the
    /// configured timeout.
    pub fn wake(&self, raw_mac: &str) -> Result<(MacAddress, Delivery), Error> {
        let mac = validate_and_parse(raw_mac)?;
        let packet = build_magic_packet(mac);
        let delivery = self.send(&packet, Instant::now() + self.config.timeout)?;
        info!("sent magic packet to {} via {} path", mac, delivery.as_str());
        Ok((mac, delivery))
    }
}
