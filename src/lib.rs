//! Peer Link
//!
//! Authenticated point-to-point message channel between two peers on a
//! local network.
//!
//! ## Overview
//!
//! Two peers find each other with a UDP broadcast handshake that also decides
//! which of them listens and which connects, and which security features the
//! session uses. Each feature is requested independently and enabled only if
//! both peers ask for it:
//!
//! - **Encryption**: P-256 Diffie-Hellman key agreement, AES-256-CBC per message
//! - **Certificates**: X.509 exchange, RSA-2048 signature on every message
//! - **Checksum**: SHA-256 digest appended to every message
//!
//! ## Example
//!
//! ```rust,no_run
//! use peer_link::{Communicator, FeatureSet, SessionConfig, SessionEvent, TrustStore};
//!
//! # async fn run() -> Result<(), peer_link::ChannelError> {
//! let config = SessionConfig::new(8000, 8000, 9000)
//!     .with_features(FeatureSet::new(true, false, true));
//! let (mut peer, mut events) = Communicator::new(config, None, TrustStore::default());
//!
//! peer.init().await?;
//! peer.send_message("Hello from Client!").await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         SessionEvent::MessageReceived(text) => println!("{text}"),
//!         SessionEvent::ConnectionLost => break,
//!         SessionEvent::Status(status) => println!("{status}"),
//!     }
//! }
//! peer.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod message;
pub mod p2p;
pub mod ports;

pub use config::{FeatureSet, SessionConfig};
pub use credentials::{CertificateAuthority, Identity, TrustStore};
pub use error::{ChannelError, Stage};
pub use events::{SessionEvent, StatusEvent, StatusKind};
pub use message::ChatMessage;
pub use p2p::{Communicator, Role};
pub use ports::PortRegistry;
