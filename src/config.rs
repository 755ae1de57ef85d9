//! Session configuration and feature negotiation.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::error::ChannelError;

/// Default local UDP port used for discovery.
pub const DEFAULT_UDP_PORT: u16 = 8000;

/// Default TCP port the server side listens on.
pub const DEFAULT_TCP_PORT: u16 = 9000;

/// Default wait for a single discovery datagram and for every setup stage.
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 5000;

/// Pause after a forced disconnect before the first reconnect attempt.
pub const DEFAULT_SETTLE_DELAY_MS: u64 = 500;

/// Pause between failed reconnect attempts.
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Security features a peer asks for.
///
/// Each flag is requested independently; the session runs with the
/// flag-wise AND of both peers' requests.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FeatureSet {
    pub encryption: bool,
    pub certificate: bool,
    pub checksum: bool,
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FeatureSet {
    pub const fn new(encryption: bool, certificate: bool, checksum: bool) -> Self {
        Self {
            encryption,
            certificate,
            checksum,
        }
    }

    pub const fn all() -> Self {
        Self::new(true, true, true)
    }

    pub const fn none() -> Self {
        Self::new(false, false, false)
    }

    /// Negotiate with the peer's request. Never escalates a flag.
    pub fn negotiate(&self, other: &Self) -> Self {
        Self {
            encryption: self.encryption && other.encryption,
            certificate: self.certificate && other.certificate,
            checksum: self.checksum && other.checksum,
        }
    }

    /// Three ASCII flags (`'0'`/`'1'`) in wire order.
    pub fn to_flags(&self) -> String {
        [self.encryption, self.certificate, self.checksum]
            .iter()
            .map(|&flag| if flag { '1' } else { '0' })
            .collect()
    }

    /// Parse the three wire flags. Anything other than `'1'` reads as off.
    pub fn from_flags(flags: &[u8]) -> Option<Self> {
        match flags {
            [e, c, s, ..] => Some(Self::new(*e == b'1', *c == b'1', *s == b'1')),
            _ => None,
        }
    }
}

/// Configuration for one communicator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionConfig {
    /// Local UDP port the discovery socket binds to.
    pub udp_port: u16,

    /// UDP port the discovery request is sent to.
    pub rendezvous_port: u16,

    /// TCP port the server listens on and the client dials.
    pub tcp_port: u16,

    /// Destination address of the discovery request.
    /// Limited broadcast by default; loopback works for single-host setups.
    pub discovery_addr: IpAddr,

    /// Features this peer asks for.
    pub features: FeatureSet,

    /// Wait for each discovery datagram, in milliseconds.
    pub handshake_timeout_ms: u64,

    /// Bound for listen/accept or connect, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Bound for the key exchange, in milliseconds.
    pub key_exchange_timeout_ms: u64,

    /// Bound for the certificate exchange, in milliseconds.
    pub certificate_timeout_ms: u64,

    /// Pause after the initial disconnect of a reconnect, in milliseconds.
    pub settle_delay_ms: u64,

    /// Pause between reconnect attempts, in milliseconds.
    pub retry_delay_ms: u64,

    /// Treat a self-signed peer certificate as an authentication failure
    /// instead of a warning.
    pub reject_self_signed: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            udp_port: DEFAULT_UDP_PORT,
            rendezvous_port: DEFAULT_UDP_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            discovery_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            features: FeatureSet::default(),
            handshake_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            key_exchange_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            certificate_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            reject_self_signed: false,
        }
    }
}

impl SessionConfig {
    /// Config with explicit ports and defaults for everything else.
    pub fn new(udp_port: u16, rendezvous_port: u16, tcp_port: u16) -> Self {
        Self {
            udp_port,
            rendezvous_port,
            tcp_port,
            ..Default::default()
        }
    }

    pub fn with_features(mut self, features: FeatureSet) -> Self {
        self.features = features;
        self
    }

    pub fn with_discovery_addr(mut self, addr: IpAddr) -> Self {
        self.discovery_addr = addr;
        self
    }

    pub fn with_reject_self_signed(mut self, reject: bool) -> Self {
        self.reject_self_signed = reject;
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn key_exchange_timeout(&self) -> Duration {
        Duration::from_millis(self.key_exchange_timeout_ms)
    }

    pub fn certificate_timeout(&self) -> Duration {
        Duration::from_millis(self.certificate_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Reject configurations that cannot run a session.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.udp_port == 0 || self.rendezvous_port == 0 || self.tcp_port == 0 {
            return Err(ChannelError::Config("ports must be non-zero".into()));
        }
        let timeouts = [
            self.handshake_timeout_ms,
            self.connect_timeout_ms,
            self.key_exchange_timeout_ms,
            self.certificate_timeout_ms,
        ];
        if timeouts.contains(&0) {
            return Err(ChannelError::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
