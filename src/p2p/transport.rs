//! TCP connection establishment
//!
//! The server accepts exactly one inbound connection; the client opens
//! exactly one outbound connection. Both sides are bounded by the same timeout.

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ChannelError, Stage};
use crate::events::EventSink;
use crate::p2p::Role;

/// Pause between connection attempts while the server is not listening yet
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Open stream plus the listener that produced it (server role only)
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub listener: Option<TcpListener>,
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
}

impl Connection {
    /// `[local, remote]` endpoints as display strings
    pub fn endpoints(&self) -> [String; 2] {
        [self.local_addr.to_string(), self.peer_addr.to_string()]
    }
}

/// Listen or connect according to the role negotiated during discovery.
///
/// # Arguments
/// * `role` - `Server` accepts one connection, `Client` opens one
/// * `port` - TCP port to listen on or to dial
/// * `peer_ip` - Address of the server (ignored by the server)
/// * `timeout` - Bound for accept or connect
///
/// # Returns
/// The open stream with both endpoints, or `Timeout(Connect)` / `Connection`
pub async fn establish(
    role: Role,
    port: u16,
    peer_ip: IpAddr,
    timeout: Duration,
    events: &EventSink,
) -> Result<Connection, ChannelError> {
    match role {
        Role::Server => accept_one(port, timeout, events).await,
        Role::Client => connect(SocketAddr::new(peer_ip, port), timeout, events).await,
        other => Err(ChannelError::Connection(format!(
            "cannot open a connection in role {other}"
        ))),
    }
}

async fn accept_one(
    port: u16,
    timeout: Duration,
    events: &EventSink,
) -> Result<Connection, ChannelError> {
    let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .map_err(|e| ChannelError::Connection(format!("failed to bind to port {port}: {e}")))?;
    events.progress(format!("Server: waiting for connection on port {port}"));

    let (stream, peer_addr) = tokio::time::timeout(timeout, listener.accept())
        .await
        .map_err(|_| ChannelError::Timeout(Stage::Connect))?
        .map_err(|e| ChannelError::Connection(format!("failed to accept connection: {e}")))?;
    let local_addr = stream.local_addr()?;
    events.progress(format!("Connection established with {peer_addr}"));

    Ok(Connection {
        stream,
        listener: Some(listener),
        local_addr,
        peer_addr,
    })
}

async fn connect(
    addr: SocketAddr,
    timeout: Duration,
    events: &EventSink,
) -> Result<Connection, ChannelError> {
    events.progress(format!("Client: connecting to {addr}"));
    let deadline = Instant::now() + timeout;

    let stream = loop {
        match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
            Err(_) => return Err(ChannelError::Timeout(Stage::Connect)),
            Ok(Ok(stream)) => break stream,
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => {
                debug!("Connection to {addr} refused, server not listening yet");
                if Instant::now() + CONNECT_RETRY_INTERVAL >= deadline {
                    return Err(ChannelError::Timeout(Stage::Connect));
                }
                tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
            }
            Ok(Err(e)) => {
                return Err(ChannelError::Connection(format!(
                    "failed to connect to {addr}: {e}"
                )))
            }
        }
    };

    let local_addr = stream.local_addr()?;
    let peer_addr = stream.peer_addr()?;
    events.progress("Connected");

    Ok(Connection {
        stream,
        listener: None,
        local_addr,
        peer_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortRegistry;

    #[tokio::test]
    async fn test_server_and_client_connect() {
        let port = PortRegistry::global().acquire().unwrap();
        let (events, _rx) = EventSink::channel();
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let timeout = Duration::from_secs(5);

        // The client starts first and keeps retrying until the server listens.
        let (client, server) = tokio::join!(
            establish(Role::Client, port, localhost, timeout, &events),
            async {
                tokio::time::sleep(Duration::from_millis(150)).await;
                establish(Role::Server, port, localhost, timeout, &events).await
            }
        );
        let client = client.unwrap();
        let server = server.unwrap();

        assert!(server.listener.is_some());
        assert!(client.listener.is_none());
        assert_eq!(client.peer_addr.port(), port);
        assert_eq!(server.local_addr.port(), port);
        assert_eq!(client.endpoints()[1], format!("127.0.0.1:{port}"));
        assert_eq!(server.endpoints()[1], client.endpoints()[0]);

        drop(client);
        drop(server);
        PortRegistry::global().release(port).unwrap();
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let port = PortRegistry::global().acquire().unwrap();
        let (events, _rx) = EventSink::channel();

        let result = establish(
            Role::Server,
            port,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_millis(100),
            &events,
        )
        .await;
        assert!(matches!(result, Err(ChannelError::Timeout(Stage::Connect))));

        PortRegistry::global().release(port).unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_server_times_out() {
        let port = PortRegistry::global().acquire().unwrap();
        let (events, _rx) = EventSink::channel();

        let result = establish(
            Role::Client,
            port,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_millis(200),
            &events,
        )
        .await;
        assert!(matches!(result, Err(ChannelError::Timeout(Stage::Connect))));

        PortRegistry::global().release(port).unwrap();
    }

    #[tokio::test]
    async fn test_unknown_role_cannot_connect() {
        let (events, _rx) = EventSink::channel();
        let result = establish(
            Role::Unknown,
            9000,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_millis(100),
            &events,
        )
        .await;
        assert!(matches!(result, Err(ChannelError::Connection(_))));
    }
}
