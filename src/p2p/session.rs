//! Session lifecycle: setup, sending, disconnect and reconnect

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{FeatureSet, SessionConfig};
use crate::credentials::{Identity, TrustStore};
use crate::error::{ChannelError, Stage};
use crate::events::{EventSink, SessionEvent};
use crate::p2p::auth::{authenticate, RemoteCertificate};
use crate::p2p::channel::{FrameCodec, LoopExit, ReceiveLoop, SharedReader, SharedWriter};
use crate::p2p::discovery::{discover, DiscoveryParams};
use crate::p2p::key_exchange::perform_key_exchange;
use crate::p2p::transport::establish;
use crate::p2p::Role;
use crate::ports::is_port_available;

/// State of one established connection
struct PeerSession {
    features: FeatureSet,
    codec: Arc<FrameCodec>,
    reader: SharedReader,
    writer: SharedWriter,
    listener: Option<TcpListener>,
    endpoints: [String; 2],
    receiver: Option<ReceiveLoop>,
}

/// Role and session, shared with the receive loop so it can tear the
/// session down when the peer goes away
#[derive(Default)]
struct Link {
    role: Role,
    /// Bumped for every new or removed session; a loop only tears down the
    /// session it was started for
    generation: u64,
    session: Option<PeerSession>,
}

fn lock(link: &Mutex<Link>) -> MutexGuard<'_, Link> {
    link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Teardown run by the receive loop once the stream has ended
fn close_handler(
    link: Weak<Mutex<Link>>,
    generation: u64,
    events: EventSink,
) -> impl FnOnce() + Send + 'static {
    move || {
        let Some(shared) = link.upgrade() else {
            return;
        };
        let session = {
            let mut link = lock(&shared);
            if link.generation != generation {
                return;
            }
            link.generation += 1;
            link.role = Role::Disconnected;
            link.session.take()
        };
        // Closes the listener and zeroizes the session key once the loop is done
        drop(session);
        events.progress("Connection closed and resources released");
    }
}

/// One end of a peer link.
///
/// `init` runs discovery, connection setup, the optional key exchange and
/// the optional certificate exchange in that order, each under its own
/// timeout, then starts the receive loop. Received messages, status reports
/// and connection loss are delivered on the event receiver returned by
/// [`Communicator::new`].
pub struct Communicator {
    config: SessionConfig,
    identity: Option<Arc<Identity>>,
    trust: TrustStore,
    events: EventSink,
    link: Arc<Mutex<Link>>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("role", &self.role())
            .field("connected", &self.is_connected())
            .field("features", &self.features())
            .finish()
    }
}

impl Communicator {
    /// Create a communicator and the receiver for its events.
    ///
    /// `identity` is required only when certificate authentication is requested.
    pub fn new(
        config: SessionConfig,
        identity: Option<Identity>,
        trust: TrustStore,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = EventSink::channel();
        let communicator = Self {
            config,
            identity: identity.map(Arc::new),
            trust,
            events,
            link: Arc::new(Mutex::new(Link::default())),
        };
        (communicator, rx)
    }

    fn link(&self) -> MutexGuard<'_, Link> {
        lock(&self.link)
    }

    /// Run the full setup sequence and start listening.
    ///
    /// An existing session is torn down first.
    pub async fn init(&mut self) -> Result<(), ChannelError> {
        if self.link().session.is_some() {
            self.disconnect().await;
        }
        self.check_config()?;
        self.link().role = Role::Unknown;

        match self.setup().await {
            Ok(session) => {
                let features = session.features;
                {
                    let mut link = self.link();
                    link.generation += 1;
                    link.session = Some(session);
                }
                self.start_listening().await?;
                if features.encryption {
                    self.events.info("Encrypted connection established");
                } else {
                    self.events.info("Connection established (unencrypted)");
                }
                Ok(())
            }
            Err(e) => {
                self.link().role = Role::Disconnected;
                self.events.error(format!("Connection setup failed: {e}"));
                Err(e)
            }
        }
    }

    fn check_config(&self) -> Result<(), ChannelError> {
        self.config.validate()?;
        if self.config.features.certificate && self.identity.is_none() {
            return Err(ChannelError::Config(
                "certificate authentication requested without an identity".into(),
            ));
        }
        if !is_port_available(self.config.udp_port) {
            return Err(ChannelError::PortInUse {
                protocol: "UDP",
                port: self.config.udp_port,
            });
        }
        if !is_port_available(self.config.tcp_port) {
            return Err(ChannelError::PortInUse {
                protocol: "TCP",
                port: self.config.tcp_port,
            });
        }
        Ok(())
    }

    async fn setup(&self) -> Result<PeerSession, ChannelError> {
        let params = DiscoveryParams {
            local_port: self.config.udp_port,
            target: SocketAddr::new(self.config.discovery_addr, self.config.rendezvous_port),
            requested: self.config.features,
            receive_timeout: self.config.handshake_timeout(),
        };
        let discovered =
            tokio::time::timeout(self.config.handshake_timeout(), discover(params, &self.events))
                .await
                .map_err(|_| ChannelError::Timeout(Stage::Handshake))?
                .map_err(|e| ChannelError::HandshakeFailed(e.to_string()))?
                .ok_or(ChannelError::Timeout(Stage::Handshake))?;
        self.link().role = discovered.role;
        let features = discovered.features;

        let mut connection = establish(
            discovered.role,
            self.config.tcp_port,
            discovered.peer_ip,
            self.config.connect_timeout(),
            &self.events,
        )
        .await?;

        let key = if features.encryption {
            self.events.progress("Switching to an encrypted connection");
            Some(
                perform_key_exchange(
                    &mut connection.stream,
                    discovered.role,
                    self.config.key_exchange_timeout(),
                    &self.events,
                )
                .await?,
            )
        } else {
            None
        };

        let (identity, remote) = match &self.identity {
            Some(identity) if features.certificate => {
                let remote = authenticate(
                    &mut connection.stream,
                    identity,
                    &self.trust,
                    self.config.reject_self_signed,
                    self.config.certificate_timeout(),
                    &self.events,
                )
                .await
                .inspect_err(|e| {
                    self.events
                        .error(format!("Failed to authenticate the remote certificate: {e}"))
                })?;
                (Some(identity.clone()), Some(remote))
            }
            _ => (None, None),
        };

        let codec = FrameCodec::new(features, key, identity, remote)?;
        let endpoints = connection.endpoints();
        let (reader, writer) = connection.stream.into_split();
        info!(role = %discovered.role, local = %endpoints[0], remote = %endpoints[1], "Session established");

        Ok(PeerSession {
            features,
            codec: Arc::new(codec),
            reader: Arc::new(tokio::sync::Mutex::new(reader)),
            writer: Arc::new(tokio::sync::Mutex::new(Some(writer))),
            listener: connection.listener,
            endpoints,
            receiver: None,
        })
    }

    /// Start the receive loop, replacing a running one.
    pub async fn start_listening(&mut self) -> Result<(), ChannelError> {
        let previous = {
            let mut link = self.link();
            let session = link.session.as_mut().ok_or(ChannelError::NotConnected)?;
            session.receiver.take()
        };

        if let Some(previous) = previous {
            let exit = previous.stop().await;
            self.events.progress("Stopped the previous receive loop");
            debug!("Previous receive loop ended: {exit:?}");
        }

        let mut guard = self.link();
        let link = &mut *guard;
        let session = link.session.as_mut().ok_or(ChannelError::NotConnected)?;
        let on_close = close_handler(
            Arc::downgrade(&self.link),
            link.generation,
            self.events.clone(),
        );
        session.receiver = Some(ReceiveLoop::spawn(
            session.reader.clone(),
            session.writer.clone(),
            session.codec.clone(),
            self.events.clone(),
            on_close,
        ));
        Ok(())
    }

    /// Stop the receive loop and report how it ended.
    ///
    /// Returns `None` when no loop was running.
    pub async fn stop_listening(&mut self) -> Option<LoopExit> {
        let receiver = self.link().session.as_mut()?.receiver.take()?;
        Some(receiver.stop().await)
    }

    /// Frame and send one message
    pub async fn send_message(&self, message: &str) -> Result<(), ChannelError> {
        let (codec, writer) = {
            let link = self.link();
            let session = link.session.as_ref().ok_or(ChannelError::NotConnected)?;
            (session.codec.clone(), session.writer.clone())
        };

        let frame = codec.encode(message)?;
        let mut writer = writer.lock().await;
        let stream = writer.as_mut().ok_or(ChannelError::NotConnected)?;
        stream.write_all(&frame).await?;
        stream.flush().await?;

        if codec.features().encryption {
            self.events.progress("Encrypted message sent");
        } else {
            self.events.progress("Unencrypted message sent");
        }
        Ok(())
    }

    /// Tear the session down. Safe to call at any time and more than once.
    pub async fn disconnect(&mut self) {
        let session = {
            let mut link = self.link();
            if link.session.is_some() {
                link.generation += 1;
            }
            link.role = Role::Disconnected;
            link.session.take()
        };
        let Some(mut session) = session else {
            debug!("Disconnect without an open session");
            return;
        };

        if let Some(receiver) = session.receiver.take() {
            let exit = receiver.stop().await;
            debug!("Receive loop ended: {exit:?}");
        }

        if let Some(mut writer) = session.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                warn!("Error while closing the connection: {e}");
            }
        }
        // Closes the listener and the read half, and zeroizes the session key
        drop(session);

        self.events.progress("Connection closed and resources released");
    }

    /// Disconnect and run the setup again, up to `max_attempts` times.
    ///
    /// Failures are reported as events; the result only tells whether a new
    /// session is up.
    pub async fn reconnect(&mut self, max_attempts: u32) -> bool {
        self.disconnect().await;
        tokio::time::sleep(self.config.settle_delay()).await;

        let mut remaining = max_attempts;
        while remaining > 0 {
            match self.init().await {
                Ok(()) => return true,
                Err(e) => {
                    remaining -= 1;
                    self.events.error(format!(
                        "Connection attempt failed: {e} ({remaining} attempts left)"
                    ));
                }
            }
            self.disconnect().await;
            tokio::time::sleep(self.config.retry_delay()).await;
        }
        false
    }

    /// Whether a session is up and the peer has not gone away
    pub fn is_connected(&self) -> bool {
        self.link().session.is_some()
    }

    pub fn role(&self) -> Role {
        self.link().role
    }

    /// Negotiated features of the current session
    pub fn features(&self) -> Option<FeatureSet> {
        self.link().session.as_ref().map(|session| session.features)
    }

    /// `[local, remote]` endpoints of the current session
    pub fn endpoints(&self) -> Option<[String; 2]> {
        self.link()
            .session
            .as_ref()
            .map(|session| session.endpoints.clone())
    }

    /// Authenticated peer certificate, if certificate authentication ran
    pub fn remote_certificate(&self) -> Option<RemoteCertificate> {
        self.link()
            .session
            .as_ref()
            .and_then(|session| session.codec.remote_certificate().cloned())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}
