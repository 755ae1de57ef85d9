//! Certificate exchange and verification
//!
//! Both peers send their raw DER certificate and read the other's at the same
//! time. A certificate that chains to a configured trust root is trusted; a
//! self-signed one only raises a warning (unless configured otherwise); any
//! other verification failure aborts the session.

use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::credentials::{Identity, TrustStore};
use crate::error::{ChannelError, Stage};
use crate::events::EventSink;
use crate::p2p::crypto_utils::SIGNATURE_LEN;

/// Upper bound for a peer certificate
pub const MAX_CERTIFICATE_LEN: usize = 8 * 1024;

/// How far the peer certificate is trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustLevel {
    /// Chains to a configured trust root
    Trusted,
    /// Not trusted, but issued by itself
    SelfSigned,
}

/// Outcome of checking a certificate against the trust store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Trusted,
    SelfSigned { reason: String },
    Rejected { reason: String },
}

/// Authenticated peer certificate
#[derive(Debug, Clone)]
pub struct RemoteCertificate {
    der: Vec<u8>,
    public_key: RsaPublicKey,
    fingerprint: String,
    subject: String,
    common_name: Option<String>,
    organization: Option<String>,
    issuer: String,
    trust: TrustLevel,
}

impl RemoteCertificate {
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Key used to verify message signatures
    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// Uppercase hex SHA-256 over the DER bytes
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn organization(&self) -> Option<&str> {
        self.organization.as_deref()
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn trust(&self) -> TrustLevel {
        self.trust
    }
}

/// Exchange certificates over the stream and authenticate the peer.
///
/// # Arguments
/// * `stream` - The connected stream, before any chat frame was sent
/// * `identity` - Local certificate and signing key
/// * `trust` - Roots the peer certificate may chain to
/// * `reject_self_signed` - Fail instead of warning on a self-signed peer
/// * `timeout` - Bound for sending and receiving both certificates
///
/// # Returns
/// The parsed peer certificate, or `Timeout(CertificateExchange)` /
/// `Authentication` on failure
pub async fn authenticate(
    stream: &mut TcpStream,
    identity: &Identity,
    trust: &TrustStore,
    reject_self_signed: bool,
    timeout: Duration,
    events: &EventSink,
) -> Result<RemoteCertificate, ChannelError> {
    let remote_der = tokio::time::timeout(timeout, exchange(stream, identity, events))
        .await
        .map_err(|_| ChannelError::Timeout(Stage::CertificateExchange))??;

    let remote = inspect(&remote_der, trust, reject_self_signed)?;
    if remote.trust == TrustLevel::SelfSigned {
        events.warning("Remote certificate is self-signed");
    }
    events.info(format!("Certificate fingerprint (SHA-256): {}", remote.fingerprint));
    events.info(format!(
        "Certificate holder: {} ({})",
        remote.common_name().unwrap_or("-"),
        remote.organization().unwrap_or("-")
    ));
    Ok(remote)
}

async fn exchange(
    stream: &mut TcpStream,
    identity: &Identity,
    events: &EventSink,
) -> Result<Vec<u8>, ChannelError> {
    let (mut reader, mut writer) = stream.split();

    let send = async {
        writer.write_all(identity.certificate_der()).await?;
        writer.flush().await?;
        events.progress("Certificate sent");
        Ok::<_, ChannelError>(())
    };
    let receive = async {
        let der = read_der_blob(&mut reader, MAX_CERTIFICATE_LEN).await?;
        events.progress("Certificate received");
        Ok::<_, ChannelError>(der)
    };

    let (sent, received) = tokio::join!(send, receive);
    sent?;
    received
}

/// Parse, verify and apply the self-signed policy
pub fn inspect(
    der: &[u8],
    trust: &TrustStore,
    reject_self_signed: bool,
) -> Result<RemoteCertificate, ChannelError> {
    let trust_level = match verify_certificate(der, trust) {
        Verification::Trusted => TrustLevel::Trusted,
        Verification::SelfSigned { reason } if !reject_self_signed => {
            debug!("Accepting self-signed certificate: {reason}");
            TrustLevel::SelfSigned
        }
        Verification::SelfSigned { reason } => {
            return Err(ChannelError::Authentication(format!(
                "self-signed certificate rejected: {reason}"
            )))
        }
        Verification::Rejected { reason } => return Err(ChannelError::Authentication(reason)),
    };

    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| ChannelError::Authentication(format!("unparsable certificate: {e}")))?;
    let public_key = RsaPublicKey::from_public_key_der(cert.public_key().raw).map_err(|_| {
        ChannelError::Authentication("certificate does not carry an RSA key".into())
    })?;
    if public_key.size() != SIGNATURE_LEN {
        return Err(ChannelError::Authentication(format!(
            "RSA key of {} bits, 2048 required",
            public_key.size() * 8
        )));
    }

    let subject = cert.subject();
    let remote = RemoteCertificate {
        der: der.to_vec(),
        public_key,
        fingerprint: hex::encode_upper(Sha256::digest(der)),
        subject: subject.to_string(),
        common_name: subject
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string),
        organization: subject
            .iter_organization()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_string),
        issuer: cert.issuer().to_string(),
        trust: trust_level,
    };
    Ok(remote)
}

/// Check a DER certificate against the trust roots
pub fn verify_certificate(der: &[u8], trust: &TrustStore) -> Verification {
    let cert = match X509Certificate::from_der(der) {
        Ok((_, cert)) => cert,
        Err(e) => {
            return Verification::Rejected {
                reason: format!("unparsable certificate: {e}"),
            }
        }
    };

    let reason = match chain_to_root(&cert, trust) {
        Ok(()) => return Verification::Trusted,
        Err(reason) => reason,
    };

    if is_self_signed(&cert) {
        Verification::SelfSigned { reason }
    } else {
        Verification::Rejected { reason }
    }
}

fn chain_to_root(cert: &X509Certificate<'_>, trust: &TrustStore) -> Result<(), String> {
    if !cert.validity().is_valid() {
        return Err("certificate is outside its validity period".into());
    }
    for root in trust.roots() {
        let Ok((_, root)) = X509Certificate::from_der(root) else {
            continue;
        };
        if root.subject() != cert.issuer() {
            continue;
        }
        if cert.verify_signature(Some(root.public_key())).is_ok() {
            return Ok(());
        }
    }
    Err(format!("issuer '{}' is not trusted", cert.issuer()))
}

/// Issuer and subject are the same name
pub fn is_self_signed(cert: &X509Certificate<'_>) -> bool {
    cert.subject() == cert.issuer()
}

/// Read exactly one DER TLV from the stream, using its length header.
pub async fn read_der_blob<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut header = vec![0u8; 2];
    reader.read_exact(&mut header).await?;
    if header[0] != 0x30 {
        return Err(ChannelError::Authentication(
            "peer did not send a DER certificate".into(),
        ));
    }

    let first = header[1];
    let content_len = if first & 0x80 == 0 {
        first as usize
    } else {
        let num_bytes = (first & 0x7f) as usize;
        if num_bytes == 0 || num_bytes > 4 {
            return Err(ChannelError::Authentication("invalid DER length".into()));
        }
        let mut len_bytes = vec![0u8; num_bytes];
        reader.read_exact(&mut len_bytes).await?;
        header.extend_from_slice(&len_bytes);
        len_bytes
            .iter()
            .fold(0usize, |len, &b| (len << 8) | b as usize)
    };

    let total = header.len() + content_len;
    if total > max_len {
        return Err(ChannelError::Authentication(format!(
            "certificate too large: {total} bytes"
        )));
    }

    let mut der = header;
    der.resize(total, 0);
    let start = total - content_len;
    reader.read_exact(&mut der[start..]).await?;
    Ok(der)
}
