//! Secure message framing and the receive loop
//!
//! # Frame layout
//!
//! ```text
//! [signature: 256 B]? [IV: 16 B + ciphertext | plaintext] [checksum: 32 B]?
//! ```
//!
//! The signature covers the plaintext message, the checksum covers the
//! payload exactly as sent. There is no length field: one stream read is
//! taken as one frame.

use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::FeatureSet;
use crate::credentials::Identity;
use crate::error::ChannelError;
use crate::events::EventSink;
use crate::p2p::auth::RemoteCertificate;
use crate::p2p::crypto_utils::{
    compute_checksum, decrypt_message, encrypt_message, sign_message, verify_checksum,
    verify_signature, CryptoError, SignatureError, CHECKSUM_LEN, SIGNATURE_LEN,
};
use crate::p2p::key_exchange::SharedSecret;

/// Read buffer of the receive loop, and thus the largest frame
pub const READ_BUFFER_LEN: usize = 4096;

/// Write half shared between the send path and the receive loop
pub type SharedWriter = Arc<Mutex<Option<OwnedWriteHalf>>>;

/// Read half, held by whichever receive loop is running
pub type SharedReader = Arc<Mutex<OwnedReadHalf>>;

/// Reasons a received frame is dropped
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("decryption failed: {0}")]
    Decrypt(#[from] CryptoError),

    #[error("payload is not valid UTF-8")]
    InvalidUtf8,

    #[error("signature mismatch: {0}")]
    Signature(#[from] SignatureError),
}

/// Applies the negotiated features to outgoing and incoming messages
pub struct FrameCodec {
    features: FeatureSet,
    key: Option<SharedSecret>,
    identity: Option<Arc<Identity>>,
    remote: Option<RemoteCertificate>,
}

impl std::fmt::Debug for FrameCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCodec")
            .field("features", &self.features)
            .field("has_key", &self.key.is_some())
            .field("has_remote", &self.remote.is_some())
            .finish()
    }
}

impl FrameCodec {
    /// Build a codec, checking that every negotiated feature has its material.
    pub fn new(
        features: FeatureSet,
        key: Option<SharedSecret>,
        identity: Option<Arc<Identity>>,
        remote: Option<RemoteCertificate>,
    ) -> Result<Self, ChannelError> {
        if features.encryption && key.is_none() {
            return Err(ChannelError::Config(
                "encryption negotiated without a shared secret".into(),
            ));
        }
        if features.certificate && (identity.is_none() || remote.is_none()) {
            return Err(ChannelError::Config(
                "certificate authentication negotiated without both certificates".into(),
            ));
        }
        Ok(Self {
            features,
            key,
            identity,
            remote,
        })
    }

    /// Codec without any protection
    pub fn plain() -> Self {
        Self {
            features: FeatureSet::none(),
            key: None,
            identity: None,
            remote: None,
        }
    }

    pub fn features(&self) -> FeatureSet {
        self.features
    }

    pub fn remote_certificate(&self) -> Option<&RemoteCertificate> {
        self.remote.as_ref()
    }

    /// Turn a message into a frame
    ///
    /// # Arguments
    /// * `message` - Plaintext to send
    ///
    /// # Returns
    /// Bytes to write in a single call: signature, payload, checksum as negotiated
    pub fn encode(&self, message: &str) -> Result<Vec<u8>, ChannelError> {
        let mut payload = match &self.key {
            Some(key) if self.features.encryption => encrypt_message(key.as_slice(), message.as_bytes())?,
            _ => message.as_bytes().to_vec(),
        };

        if self.features.checksum {
            let checksum = compute_checksum(&payload);
            payload.extend_from_slice(&checksum);
        }

        match &self.identity {
            Some(identity) if self.features.certificate => {
                let mut frame = sign_message(identity.private_key(), message.as_bytes())?;
                frame.extend_from_slice(&payload);
                Ok(frame)
            }
            _ => Ok(payload),
        }
    }

    /// Turn a frame back into a message, checking every negotiated feature
    ///
    /// # Arguments
    /// * `frame` - Bytes from one stream read
    ///
    /// # Returns
    /// The message, or the first check that failed
    pub fn decode(&self, frame: &[u8]) -> Result<String, FrameError> {
        let mut rest = frame;

        let signature = if self.features.certificate {
            if rest.len() < SIGNATURE_LEN {
                return Err(FrameError::TooShort(frame.len()));
            }
            let (signature, tail) = rest.split_at(SIGNATURE_LEN);
            rest = tail;
            Some(signature)
        } else {
            None
        };

        if self.features.checksum {
            if rest.len() < CHECKSUM_LEN {
                return Err(FrameError::TooShort(frame.len()));
            }
            let (payload, checksum) = rest.split_at(rest.len() - CHECKSUM_LEN);
            if !verify_checksum(payload, checksum) {
                return Err(FrameError::ChecksumMismatch);
            }
            rest = payload;
        }

        let plaintext = match &self.key {
            Some(key) if self.features.encryption => decrypt_message(key.as_slice(), rest)?,
            _ => rest.to_vec(),
        };
        let message = String::from_utf8(plaintext).map_err(|_| FrameError::InvalidUtf8)?;

        if let (Some(signature), Some(remote)) = (signature, &self.remote) {
            verify_signature(remote.public_key(), message.as_bytes(), signature)?;
        }

        Ok(message)
    }
}

/// How a receive loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopExit {
    /// Stopped through its cancellation token
    Cancelled,
    /// The peer closed the stream
    PeerClosed,
    /// Reading failed
    ReadError(String),
}

/// Handle to a running receive loop
#[derive(Debug)]
pub struct ReceiveLoop {
    cancel: CancellationToken,
    handle: JoinHandle<LoopExit>,
}

impl ReceiveLoop {
    /// Spawn the loop on the current runtime.
    ///
    /// When the stream ends or fails, the loop closes the write half and runs
    /// `on_close` before reporting the connection as lost. A cancelled loop
    /// does neither.
    pub fn spawn<F>(
        reader: SharedReader,
        writer: SharedWriter,
        codec: Arc<FrameCodec>,
        events: EventSink,
        on_close: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(receive_messages(
            reader,
            writer,
            codec,
            cancel.clone(),
            events,
            on_close,
        ));
        Self { cancel, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel and wait for the loop to end
    pub async fn stop(mut self) -> LoopExit {
        self.cancel.cancel();
        self.wait().await
    }

    /// Wait for the loop to end on its own
    pub async fn join(mut self) -> LoopExit {
        self.wait().await
    }

    async fn wait(&mut self) -> LoopExit {
        match (&mut self.handle).await {
            Ok(exit) => exit,
            Err(e) => LoopExit::ReadError(format!("receive task failed: {e}")),
        }
    }
}

impl Drop for ReceiveLoop {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn receive_messages<F>(
    reader: SharedReader,
    writer: SharedWriter,
    codec: Arc<FrameCodec>,
    cancel: CancellationToken,
    events: EventSink,
    on_close: F,
) -> LoopExit
where
    F: FnOnce(),
{
    let mut reader = reader.lock().await;
    let mut buf = vec![0u8; READ_BUFFER_LEN];
    let encrypted = if codec.features().encryption {
        "encrypted"
    } else {
        "unencrypted"
    };
    events.progress(format!("Receiving {encrypted} messages"));

    let exit = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break LoopExit::Cancelled,
            read = reader.read(&mut buf) => read,
        };

        match read {
            Ok(0) => {
                events.warning("The peer closed the connection");
                break LoopExit::PeerClosed;
            }
            Ok(n) => match codec.decode(&buf[..n]) {
                Ok(message) => {
                    debug!("Received message of {} bytes", message.len());
                    events.message_received(message);
                }
                Err(FrameError::ChecksumMismatch) => {
                    events.warning("Checksum verification failed, message dropped");
                }
                Err(FrameError::Signature(e)) => {
                    events.warning(format!("Signature verification failed, message dropped: {e}"));
                }
                Err(e) => {
                    events.warning(format!("Malformed message dropped: {e}"));
                }
            },
            Err(e) => {
                events.error(format!("Error reading message, connection may be broken: {e}"));
                break LoopExit::ReadError(e.to_string());
            }
        }
    };

    events.progress(format!("Stopped receiving {encrypted} messages"));
    if exit != LoopExit::Cancelled {
        if let Some(mut writer) = writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                warn!("Failed to shut down stream: {e}");
            }
        }
        drop(codec);
        on_close();
        if exit == LoopExit::PeerClosed {
            events.connection_lost();
        }
    }
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::TrustStore;
    use crate::events::SessionEvent;
    use crate::p2p::auth::inspect;
    use crate::p2p::crypto_utils::IV_LEN;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use zeroize::Zeroizing;

    fn secret() -> SharedSecret {
        Zeroizing::new([42u8; 32])
    }

    /// Codec pair where `sender` signs with alice and `receiver` verifies alice
    fn codec_pair(features: FeatureSet) -> (FrameCodec, FrameCodec) {
        let alice = Arc::new(Identity::generate_self_signed("alice").unwrap());
        let bob = Arc::new(Identity::generate_self_signed("bob").unwrap());
        let trust = TrustStore::default();
        let alice_seen = inspect(alice.certificate_der(), &trust, false).unwrap();
        let bob_seen = inspect(bob.certificate_der(), &trust, false).unwrap();

        let sender = FrameCodec::new(features, Some(secret()), Some(alice), Some(bob_seen)).unwrap();
        let receiver =
            FrameCodec::new(features, Some(secret()), Some(bob), Some(alice_seen)).unwrap();
        (sender, receiver)
    }

    #[test]
    fn test_plain_frame_is_raw_utf8() {
        let codec = FrameCodec::plain();
        let frame = codec.encode("Hello from Client!").unwrap();
        assert_eq!(frame, b"Hello from Client!");
        assert_eq!(codec.decode(&frame).unwrap(), "Hello from Client!");
    }

    #[test]
    fn test_all_features_layout() {
        let (sender, receiver) = codec_pair(FeatureSet::all());
        let frame = sender.encode("Hallo Welt").unwrap();

        // signature + IV + one AES block + checksum
        assert_eq!(frame.len(), SIGNATURE_LEN + IV_LEN + 16 + CHECKSUM_LEN);
        let payload = &frame[SIGNATURE_LEN..frame.len() - CHECKSUM_LEN];
        assert!(verify_checksum(payload, &frame[frame.len() - CHECKSUM_LEN..]));

        assert_eq!(receiver.decode(&frame).unwrap(), "Hallo Welt");
    }

    #[test]
    fn test_each_feature_alone() {
        for features in [
            FeatureSet::new(true, false, false),
            FeatureSet::new(false, true, false),
            FeatureSet::new(false, false, true),
        ] {
            let (sender, receiver) = codec_pair(features);
            let frame = sender.encode("ünïcödé ✓").unwrap();
            assert_eq!(receiver.decode(&frame).unwrap(), "ünïcödé ✓", "{features:?}");
        }
    }

    #[test]
    fn test_tampered_checksum_is_detected() {
        let (sender, receiver) = codec_pair(FeatureSet::new(false, false, true));
        let mut frame = sender.encode("integrity").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        assert!(matches!(
            receiver.decode(&frame),
            Err(FrameError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_signature_from_wrong_key_is_detected() {
        let features = FeatureSet::new(false, true, false);
        let (sender, _) = codec_pair(features);
        let (_, other_receiver) = codec_pair(features);
        let frame = sender.encode("who am I").unwrap();

        assert!(matches!(
            other_receiver.decode(&frame),
            Err(FrameError::Signature(_))
        ));
    }

    #[test]
    fn test_short_frames_are_rejected() {
        let (_, receiver) = codec_pair(FeatureSet::all());
        assert!(matches!(receiver.decode(&[0u8; 10]), Err(FrameError::TooShort(10))));

        let (_, receiver) = codec_pair(FeatureSet::new(false, false, true));
        assert!(matches!(receiver.decode(&[0u8; 31]), Err(FrameError::TooShort(31))));
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        let codec = FrameCodec::plain();
        assert!(matches!(codec.decode(&[0xff, 0xfe]), Err(FrameError::InvalidUtf8)));
    }

    #[test]
    fn test_codec_requires_material() {
        let result = FrameCodec::new(FeatureSet::new(true, false, false), None, None, None);
        assert!(matches!(result, Err(ChannelError::Config(_))));

        let result = FrameCodec::new(FeatureSet::new(false, true, false), None, None, None);
        assert!(matches!(result, Err(ChannelError::Config(_))));
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, server) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), server.unwrap().0)
    }

    #[tokio::test]
    async fn test_loop_delivers_and_reports_peer_close() {
        let (local, mut remote) = tcp_pair().await;
        let (reader, writer) = local.into_split();
        let (events, mut rx) = EventSink::channel();
        let closed = CancellationToken::new();
        let writer: SharedWriter = Arc::new(Mutex::new(Some(writer)));

        let receiver = ReceiveLoop::spawn(
            Arc::new(Mutex::new(reader)),
            writer.clone(),
            Arc::new(FrameCodec::plain()),
            events,
            {
                let closed = closed.clone();
                move || closed.cancel()
            },
        );

        remote.write_all(b"first").await.unwrap();
        let mut delivered = None;
        while let Some(event) = rx.recv().await {
            if let SessionEvent::MessageReceived(text) = event {
                delivered = Some(text);
                break;
            }
        }
        assert_eq!(delivered.as_deref(), Some("first"));

        drop(remote);
        assert_eq!(receiver.join().await, LoopExit::PeerClosed);
        assert!(closed.is_cancelled());
        assert!(writer.lock().await.is_none());

        let mut lost = false;
        while let Ok(event) = rx.try_recv() {
            lost |= event == SessionEvent::ConnectionLost;
        }
        assert!(lost);
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let (local, _remote) = tcp_pair().await;
        let (reader, writer) = local.into_split();
        let (events, _rx) = EventSink::channel();
        let closed = CancellationToken::new();

        let receiver = ReceiveLoop::spawn(
            Arc::new(Mutex::new(reader)),
            Arc::new(Mutex::new(Some(writer))),
            Arc::new(FrameCodec::plain()),
            events,
            {
                let closed = closed.clone();
                move || closed.cancel()
            },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!receiver.is_finished());

        assert_eq!(receiver.stop().await, LoopExit::Cancelled);
        assert!(!closed.is_cancelled());
    }
}
