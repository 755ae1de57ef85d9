//! Identity certificates, private keys and trust roots
//!
//! Identities carry an RSA-2048 key so that every message signature is
//! exactly 256 bytes on the wire. Certificates are generated with `rcgen`
//! and parsed with `x509-parser`; PEM files are read with `rustls-pemfile`.

use pkcs8::der::pem::LineEnding;
use pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rand_core::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::io::BufReader;
use std::path::Path;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::p2p::crypto_utils::SIGNATURE_LEN;

/// RSA modulus size of generated identities
pub const RSA_KEY_BITS: usize = 2048;

/// Error types for credential handling
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no certificate found in {0}")]
    MissingCertificate(String),

    #[error("no private key found in {0}")]
    MissingKey(String),

    #[error("unsupported private key format (RSA PKCS#1 or PKCS#8 required)")]
    UnsupportedKey,

    #[error("invalid private key: {0}")]
    InvalidKey(String),

    #[error("RSA key must be {expected} bytes, got {got}")]
    WrongKeySize { expected: usize, got: usize },

    #[error("certificate does not match the private key")]
    KeyMismatch,

    #[error("certificate parse error: {0}")]
    Parse(String),

    #[error("certificate generation failed: {0}")]
    Generation(String),
}

impl From<rcgen::Error> for CredentialError {
    fn from(err: rcgen::Error) -> Self {
        CredentialError::Generation(err.to_string())
    }
}

/// Local certificate plus the private key used to sign outgoing messages
#[derive(Clone)]
pub struct Identity {
    certificate: CertificateDer<'static>,
    private_key: RsaPrivateKey,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("certificate_len", &self.certificate.len())
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// Pair a DER certificate with its private key.
    ///
    /// Fails if the key is not RSA-2048 or does not belong to the certificate.
    pub fn new(
        certificate: CertificateDer<'static>,
        private_key: RsaPrivateKey,
    ) -> Result<Self, CredentialError> {
        if private_key.size() != SIGNATURE_LEN {
            return Err(CredentialError::WrongKeySize {
                expected: SIGNATURE_LEN,
                got: private_key.size(),
            });
        }
        if certificate_public_key(&certificate)? != private_key.to_public_key() {
            return Err(CredentialError::KeyMismatch);
        }
        Ok(Self {
            certificate,
            private_key,
        })
    }

    /// Generate a fresh self-signed identity for the given common name
    pub fn generate_self_signed(common_name: &str) -> Result<Self, CredentialError> {
        let (private_key, key_pair) = generate_rsa_key_pair()?;
        let params = identity_params(common_name)?;
        let cert = params.self_signed(&key_pair)?;
        Self::new(cert.der().clone(), private_key)
    }

    /// Load a PEM certificate and private key.
    ///
    /// With a passphrase the key file must hold an encrypted PKCS#8 key;
    /// without one, a plain PKCS#8 or PKCS#1 RSA key.
    pub fn load_pem(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        passphrase: Option<&str>,
    ) -> Result<Self, CredentialError> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();

        let certificate = load_certs(cert_path)?
            .into_iter()
            .next()
            .ok_or_else(|| CredentialError::MissingCertificate(cert_path.display().to_string()))?;

        let private_key = match passphrase {
            Some(passphrase) => {
                let pem = std::fs::read_to_string(key_path)?;
                RsaPrivateKey::from_pkcs8_encrypted_pem(&pem, passphrase)
                    .map_err(|e| CredentialError::InvalidKey(e.to_string()))?
            }
            None => {
                let mut reader = BufReader::new(std::fs::File::open(key_path)?);
                let key = rustls_pemfile::private_key(&mut reader)?
                    .ok_or_else(|| CredentialError::MissingKey(key_path.display().to_string()))?;
                decode_private_key(&key)?
            }
        };

        Self::new(certificate, private_key)
    }

    /// Write the certificate and key as PEM.
    ///
    /// With a passphrase the key is stored as encrypted PKCS#8.
    pub fn save_pem(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        passphrase: Option<&str>,
    ) -> Result<(), CredentialError> {
        let cert_pem =
            pkcs8::der::pem::encode_string("CERTIFICATE", LineEnding::LF, &self.certificate)
                .map_err(|e| CredentialError::Parse(e.to_string()))?;
        let key_pem = match passphrase {
            Some(passphrase) => self
                .private_key
                .to_pkcs8_encrypted_pem(OsRng, passphrase, LineEnding::LF),
            None => self.private_key.to_pkcs8_pem(LineEnding::LF),
        }
        .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;

        std::fs::write(cert_path, cert_pem)?;
        std::fs::write(key_path, key_pem.as_bytes())?;
        Ok(())
    }

    /// Raw DER bytes sent to the peer during authentication
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }
}

/// Local certificate authority for issuing non-self-signed identities
pub struct CertificateAuthority {
    certificate: rcgen::Certificate,
    key_pair: rcgen::KeyPair,
}

impl CertificateAuthority {
    pub fn generate(common_name: &str) -> Result<Self, CredentialError> {
        let key_pair = rcgen::KeyPair::generate()?;
        let mut params = rcgen::CertificateParams::new(Vec::<String>::new())?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, common_name);
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let certificate = params.self_signed(&key_pair)?;
        Ok(Self {
            certificate,
            key_pair,
        })
    }

    /// Issue an RSA-2048 identity signed by this authority
    pub fn issue(&self, common_name: &str) -> Result<Identity, CredentialError> {
        let (private_key, key_pair) = generate_rsa_key_pair()?;
        let params = identity_params(common_name)?;
        let cert = params.signed_by(&key_pair, &self.certificate, &self.key_pair)?;
        Identity::new(cert.der().clone(), private_key)
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        self.certificate.der()
    }
}

/// Certificates accepted as issuers of peer certificates
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    roots: Vec<CertificateDer<'static>>,
}

impl TrustStore {
    pub fn new(roots: Vec<CertificateDer<'static>>) -> Self {
        Self { roots }
    }

    /// Load every certificate in a PEM file as a trust root
    pub fn load_pem(path: impl AsRef<Path>) -> Result<Self, CredentialError> {
        Ok(Self::new(load_certs(path.as_ref())?))
    }

    pub fn add(&mut self, root: CertificateDer<'static>) {
        self.roots.push(root);
    }

    pub fn roots(&self) -> &[CertificateDer<'static>] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Load certificate(s) from a PEM file
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, CredentialError> {
    let mut reader = BufReader::new(std::fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    Ok(certs)
}

fn decode_private_key(key: &PrivateKeyDer<'_>) -> Result<RsaPrivateKey, CredentialError> {
    match key {
        PrivateKeyDer::Pkcs8(der) => RsaPrivateKey::from_pkcs8_der(der.secret_pkcs8_der())
            .map_err(|e| CredentialError::InvalidKey(e.to_string())),
        PrivateKeyDer::Pkcs1(der) => RsaPrivateKey::from_pkcs1_der(der.secret_pkcs1_der())
            .map_err(|e| CredentialError::InvalidKey(e.to_string())),
        _ => Err(CredentialError::UnsupportedKey),
    }
}

/// Extract the RSA public key of a DER certificate
pub(crate) fn certificate_public_key(der: &[u8]) -> Result<RsaPublicKey, CredentialError> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| CredentialError::Parse(e.to_string()))?;
    RsaPublicKey::from_public_key_der(cert.public_key().raw)
        .map_err(|_| CredentialError::UnsupportedKey)
}

fn generate_rsa_key_pair() -> Result<(RsaPrivateKey, rcgen::KeyPair), CredentialError> {
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| CredentialError::Generation(e.to_string()))?;
    let pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
    let key_pair = rcgen::KeyPair::from_pem_and_sign_algo(&pem, &rcgen::PKCS_RSA_SHA256)?;
    Ok((private_key, key_pair))
}

fn identity_params(common_name: &str) -> Result<rcgen::CertificateParams, CredentialError> {
    let mut params = rcgen::CertificateParams::new(vec![common_name.to_string()])?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, common_name);
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, "peer-link");
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_self_signed() {
        let identity = Identity::generate_self_signed("alice").unwrap();
        let public_key = certificate_public_key(identity.certificate_der()).unwrap();

        assert_eq!(public_key.size(), SIGNATURE_LEN);
        assert_eq!(public_key, identity.private_key().to_public_key());
    }

    #[test]
    fn test_key_mismatch_is_rejected() {
        let alice = Identity::generate_self_signed("alice").unwrap();
        let bob = Identity::generate_self_signed("bob").unwrap();

        let result = Identity::new(alice.certificate().clone(), bob.private_key().clone());
        assert!(matches!(result, Err(CredentialError::KeyMismatch)));
    }

    #[test]
    fn test_small_key_is_rejected() {
        let alice = Identity::generate_self_signed("alice").unwrap();
        let small = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();

        let result = Identity::new(alice.certificate().clone(), small);
        assert!(matches!(
            result,
            Err(CredentialError::WrongKeySize { got: 128, .. })
        ));
    }

    #[test]
    fn test_pem_round_trip_plain() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        let identity = Identity::generate_self_signed("alice").unwrap();
        identity.save_pem(&cert_path, &key_path, None).unwrap();

        let loaded = Identity::load_pem(&cert_path, &key_path, None).unwrap();
        assert_eq!(loaded.certificate_der(), identity.certificate_der());
    }

    #[test]
    fn test_pem_round_trip_with_passphrase() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");

        let identity = Identity::generate_self_signed("alice").unwrap();
        identity
            .save_pem(&cert_path, &key_path, Some("correct horse"))
            .unwrap();

        let loaded = Identity::load_pem(&cert_path, &key_path, Some("correct horse")).unwrap();
        assert_eq!(loaded.certificate_der(), identity.certificate_der());

        let wrong = Identity::load_pem(&cert_path, &key_path, Some("battery staple"));
        assert!(matches!(wrong, Err(CredentialError::InvalidKey(_))));
    }

    #[test]
    fn test_missing_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("empty.pem");
        std::fs::write(&cert_path, "").unwrap();

        let result = Identity::load_pem(&cert_path, dir.path().join("key.pem"), None);
        assert!(matches!(result, Err(CredentialError::MissingCertificate(_))));
    }

    #[test]
    fn test_trust_store_from_pem() {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::generate("test root").unwrap();
        let path = dir.path().join("roots.pem");
        let pem =
            pkcs8::der::pem::encode_string("CERTIFICATE", LineEnding::LF, ca.certificate())
                .unwrap();
        std::fs::write(&path, pem).unwrap();

        let store = TrustStore::load_pem(&path).unwrap();
        assert_eq!(store.roots(), &[ca.certificate().clone()]);
    }

    #[test]
    fn test_issued_identity() {
        let ca = CertificateAuthority::generate("test root").unwrap();
        let identity = ca.issue("bob").unwrap();
        assert_ne!(identity.certificate_der(), ca.certificate().as_ref());
    }
}
