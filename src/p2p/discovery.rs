//! UDP discovery handshake that decides which peer listens and which connects
//!
//! Every peer broadcasts `HSK:Client<flags>` to the rendezvous port and then
//! waits. The first peer to *receive* a client request becomes the server and
//! answers `HSK:Server<negotiated flags>` directly to the sender; a peer that
//! receives that answer becomes the client and adopts the flags it carries.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::config::FeatureSet;
use crate::error::ChannelError;
use crate::events::EventSink;
use crate::p2p::Role;

/// Prefix of a discovery request
pub const CLIENT_PREFIX: &str = "HSK:Client";

/// Prefix of a discovery reply
pub const SERVER_PREFIX: &str = "HSK:Server";

/// Prefix plus three flag characters
const MESSAGE_LEN: usize = 13;

/// Largest datagram we bother to read
const MAX_DATAGRAM: usize = 512;

/// Parsed discovery datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeMessage {
    /// Request from a peer still looking for a partner
    Client(FeatureSet),
    /// Reply carrying the already negotiated features
    Server(FeatureSet),
}

impl HandshakeMessage {
    pub fn encode(&self) -> String {
        match self {
            HandshakeMessage::Client(features) => format!("{CLIENT_PREFIX}{}", features.to_flags()),
            HandshakeMessage::Server(features) => format!("{SERVER_PREFIX}{}", features.to_flags()),
        }
    }

    /// Parse a datagram. Unknown prefixes and short datagrams yield `None`.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < MESSAGE_LEN {
            return None;
        }
        let features = FeatureSet::from_flags(&data[CLIENT_PREFIX.len()..MESSAGE_LEN])?;
        if data.starts_with(CLIENT_PREFIX.as_bytes()) {
            Some(HandshakeMessage::Client(features))
        } else if data.starts_with(SERVER_PREFIX.as_bytes()) {
            Some(HandshakeMessage::Server(features))
        } else {
            None
        }
    }
}

/// Result of a successful discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Discovered {
    pub role: Role,
    pub peer_ip: IpAddr,
    pub features: FeatureSet,
}

/// Parameters of one discovery run
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryParams {
    /// Local UDP port to bind
    pub local_port: u16,
    /// Destination of the request (broadcast or unicast)
    pub target: SocketAddr,
    /// Features this peer asks for
    pub requested: FeatureSet,
    /// Wait for each datagram
    pub receive_timeout: Duration,
}

/// Run the handshake.
///
/// The socket is closed before returning.
///
/// # Arguments
/// * `params` - Local port, request destination, requested features and datagram wait
/// * `events` - Sink for progress reports
///
/// # Returns
/// The assigned role, the peer address and the negotiated features, or
/// `Ok(None)` if no qualifying datagram arrives within the receive timeout
pub async fn discover(
    params: DiscoveryParams,
    events: &EventSink,
) -> Result<Option<Discovered>, ChannelError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, params.local_port)).await?;
    socket.set_broadcast(true)?;
    let local_ip = local_ip_address();

    let result = run(&socket, local_ip, params, events).await;
    drop(socket);
    events.progress("Handshake finished");

    match result {
        Ok(found) => Ok(found),
        Err(e) => {
            events.error(format!("Handshake send/receive failed: {e}"));
            Err(e)
        }
    }
}

async fn run(
    socket: &UdpSocket,
    local_ip: IpAddr,
    params: DiscoveryParams,
    events: &EventSink,
) -> Result<Option<Discovered>, ChannelError> {
    let request = HandshakeMessage::Client(params.requested).encode();
    events.progress(format!(
        "Sending handshake to {}: {request}",
        params.target
    ));
    socket.send_to(request.as_bytes(), params.target).await?;

    let mut buf = [0u8; MAX_DATAGRAM];
    loop {
        events.progress(format!("Waiting for reply on port {}", params.local_port));
        let (len, from) =
            match tokio::time::timeout(params.receive_timeout, socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => {
                    events.warning("Timed out waiting for a handshake reply");
                    return Ok(None);
                }
            };

        if is_self(from, local_ip, params.local_port) {
            debug!("Ignoring own datagram from {from}");
            continue;
        }

        let Some(message) = HandshakeMessage::decode(&buf[..len]) else {
            debug!("Ignoring unrelated datagram from {from}");
            continue;
        };
        events.progress(format!(
            "Reply received from {from}: {}",
            String::from_utf8_lossy(&buf[..len])
        ));

        let discovered = match message {
            HandshakeMessage::Client(remote) => {
                let features = params.requested.negotiate(&remote);
                let reply = HandshakeMessage::Server(features).encode();
                events.progress(format!("Sending reply to {from}"));
                socket.send_to(reply.as_bytes(), from).await?;
                Discovered {
                    role: Role::Server,
                    peer_ip: from.ip(),
                    features,
                }
            }
            HandshakeMessage::Server(features) => Discovered {
                role: Role::Client,
                peer_ip: from.ip(),
                features,
            },
        };

        events.info(format!("Assigned role: {}", discovered.role));
        events.info(format!(
            "Negotiated features: encryption {}, certificates {}, checksum {}",
            discovered.features.encryption,
            discovered.features.certificate,
            discovered.features.checksum
        ));
        return Ok(Some(discovered));
    }
}

/// A datagram we sent ourselves and got back through broadcast
fn is_self(from: SocketAddr, local_ip: IpAddr, local_port: u16) -> bool {
    from.port() == local_port && (from.ip() == local_ip || from.ip().is_loopback())
}

/// Primary IPv4 address of this host, or loopback when there is no route.
///
/// Connecting a UDP socket sends nothing; it only selects the outgoing
/// interface.
pub fn local_ip_address() -> IpAddr {
    StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
