//! Elliptic-curve Diffie-Hellman over the open stream
//!
//! Each side generates an ephemeral P-256 key and sends the uncompressed SEC1
//! point (65 bytes, no length prefix). The server reads first, the client
//! writes first. The session key is SHA-256 over the raw shared x-coordinate.

use p256::ecdh::EphemeralSecret;
use p256::{EncodedPoint, PublicKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use crate::error::{ChannelError, Stage};
use crate::events::EventSink;
use crate::p2p::crypto_utils::KEY_LEN;
use crate::p2p::Role;

/// Size of an uncompressed SEC1 P-256 point
pub const PUBLIC_KEY_LEN: usize = 65;

/// Symmetric session key derived from the exchange
pub type SharedSecret = Zeroizing<[u8; KEY_LEN]>;

/// Run the exchange for the given role, bounded by `timeout`.
///
/// # Arguments
/// * `stream` - Connected stream with no unread data
/// * `role` - `Server` reads the peer key first, `Client` writes first
/// * `timeout` - Bound for the whole exchange
///
/// # Returns
/// The 32-byte session key, identical on both peers
pub async fn perform_key_exchange<S>(
    stream: &mut S,
    role: Role,
    timeout: Duration,
    events: &EventSink,
) -> Result<SharedSecret, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    events.progress("Starting Diffie-Hellman key exchange");
    let secret = tokio::time::timeout(timeout, exchange(stream, role, events))
        .await
        .map_err(|_| ChannelError::Timeout(Stage::KeyExchange))??;
    events.progress("Diffie-Hellman key exchange finished");
    Ok(secret)
}

async fn exchange<S>(
    stream: &mut S,
    role: Role,
    events: &EventSink,
) -> Result<SharedSecret, ChannelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let secret = EphemeralSecret::random(&mut OsRng);
    let local_public = EncodedPoint::from(secret.public_key());

    match role {
        Role::Server => {
            events.progress("Waiting for the client's public key");
            let peer_public = read_public_key(stream).await?;
            let shared = derive(&secret, &peer_public);
            events.progress("Sending public key to the client");
            stream.write_all(local_public.as_bytes()).await?;
            stream.flush().await?;
            Ok(shared)
        }
        Role::Client => {
            events.progress("Sending public key to the server");
            stream.write_all(local_public.as_bytes()).await?;
            stream.flush().await?;
            events.progress("Waiting for the server's public key");
            let peer_public = read_public_key(stream).await?;
            Ok(derive(&secret, &peer_public))
        }
        other => Err(ChannelError::KeyExchange(format!(
            "no key exchange for role {other}"
        ))),
    }
}

async fn read_public_key<S>(stream: &mut S) -> Result<PublicKey, ChannelError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; PUBLIC_KEY_LEN];
    stream.read_exact(&mut buf).await?;
    PublicKey::from_sec1_bytes(&buf)
        .map_err(|_| ChannelError::KeyExchange("peer sent an invalid public key".into()))
}

fn derive(secret: &EphemeralSecret, peer_public: &PublicKey) -> SharedSecret {
    let shared = secret.diffie_hellman(peer_public);
    Zeroizing::new(Sha256::digest(shared.raw_secret_bytes()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_both_sides_derive_same_key() {
        let (mut server_io, mut client_io) = duplex(1024);
        let (events, _rx) = EventSink::channel();
        let timeout = Duration::from_secs(5);

        let (server, client) = tokio::join!(
            perform_key_exchange(&mut server_io, Role::Server, timeout, &events),
            perform_key_exchange(&mut client_io, Role::Client, timeout, &events),
        );
        let server = server.unwrap();
        let client = client.unwrap();

        assert_eq!(*server, *client);
        assert_ne!(*server, [0u8; KEY_LEN]);
    }

    #[tokio::test]
    async fn test_missing_peer_key_times_out() {
        let (mut server_io, _client_io) = duplex(1024);
        let (events, _rx) = EventSink::channel();

        let result = perform_key_exchange(
            &mut server_io,
            Role::Server,
            Duration::from_millis(100),
            &events,
        )
        .await;
        assert!(matches!(result, Err(ChannelError::Timeout(Stage::KeyExchange))));
    }

    #[tokio::test]
    async fn test_invalid_point_is_rejected() {
        let (mut server_io, mut client_io) = duplex(1024);
        let (events, _rx) = EventSink::channel();

        client_io.write_all(&[0x04; PUBLIC_KEY_LEN]).await.unwrap();
        let result =
            perform_key_exchange(&mut server_io, Role::Server, Duration::from_secs(1), &events)
                .await;
        assert!(matches!(result, Err(ChannelError::KeyExchange(_))));
    }

    #[tokio::test]
    async fn test_unassigned_role_is_rejected() {
        let (mut io, _other) = duplex(1024);
        let (events, _rx) = EventSink::channel();

        let result =
            perform_key_exchange(&mut io, Role::Unknown, Duration::from_secs(1), &events).await;
        assert!(matches!(result, Err(ChannelError::KeyExchange(_))));
    }
}
