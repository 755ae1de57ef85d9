//! Point-to-point session between two peers
//!
//! # Setup sequence
//!
//! ```text
//!   peer A                                   peer B
//!     │── UDP  HSK:Client<efg> ─────────────────▶│
//!     │◀──────────────── HSK:Server<e'f'g'> ─────│   roles + features
//!     │◀═══════════════ TCP connect ═════════════│
//!     │◀──────────── P-256 public keys ─────────▶│   if encryption
//!     │◀────────── DER certificates ────────────▶│   if certificate
//!     │◀════════════ chat frames ═══════════════▶│
//! ```
//!
//! Every setup stage is bounded by its own timeout. Once the channel is up
//! a single receive loop delivers checked messages as events.

pub mod auth;
pub mod channel;
pub mod crypto_utils;
pub mod discovery;
pub mod key_exchange;
pub mod session;
pub mod transport;

use std::fmt;

pub use auth::{RemoteCertificate, TrustLevel};
pub use channel::{FrameCodec, FrameError, LoopExit};
pub use discovery::{local_ip_address, Discovered, HandshakeMessage};
pub use session::Communicator;

/// Role of a peer in the current session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Role {
    /// Discovery has not completed yet
    #[default]
    Unknown,
    /// Accepted the connection
    Server,
    /// Opened the connection
    Client,
    /// Torn down by a disconnect
    Disconnected,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Unknown => "Unknown",
            Role::Server => "Server",
            Role::Client => "Client",
            Role::Disconnected => "Disconnected",
        };
        f.write_str(name)
    }
}
