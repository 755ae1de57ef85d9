//! Error types for the peer link
use std::fmt;

use crate::credentials::CredentialError;
use crate::p2p::crypto_utils::{CryptoError, SignatureError};
use crate::ports::PortError;

/// Setup stage that was cut short by its timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Handshake,
    Connect,
    KeyExchange,
    CertificateExchange,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Handshake => write!(f, "handshake"),
            Stage::Connect => write!(f, "connection setup"),
            Stage::KeyExchange => write!(f, "key exchange"),
            Stage::CertificateExchange => write!(f, "certificate exchange"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ChannelError {
    /// Invalid or incomplete configuration
    #[error("configuration error: {0}")]
    Config(String),
    /// A configured port is already bound on this host
    #[error("{protocol} port {port} is already in use")]
    PortInUse { protocol: &'static str, port: u16 },
    /// A setup stage did not finish within its bound
    #[error("{0} timed out")]
    Timeout(Stage),
    /// Discovery finished without a usable peer
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    /// TCP listen/accept/connect failure
    #[error("connection error: {0}")]
    Connection(String),
    /// Malformed or invalid peer key during key exchange
    #[error("key exchange failed: {0}")]
    KeyExchange(String),
    /// Remote certificate rejected
    #[error("authentication failed: {0}")]
    Authentication(String),
    /// No open stream to send on
    #[error("not connected")]
    NotConnected,
    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),
    #[error("port registry error: {0}")]
    Port(#[from] PortError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChannelError {
    /// Whether the error came from a stage timer.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout(_))
    }
}
