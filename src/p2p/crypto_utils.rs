//! Cryptographic primitives for the secure channel
//!
//! Message encryption uses AES-256-CBC with PKCS#7 padding and a fresh random
//! IV per message, prepended to the ciphertext. Integrity uses a plain SHA-256
//! digest. Authenticity uses RSA PKCS#1 v1.5 signatures over SHA-256, which
//! are exactly [`SIGNATURE_LEN`] bytes for the 2048-bit keys identities carry.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Length of the shared secret / AES-256 key
pub const KEY_LEN: usize = 32;

/// Length of the IV prepended to every ciphertext
pub const IV_LEN: usize = 16;

/// Length of a SHA-256 checksum
pub const CHECKSUM_LEN: usize = 32;

/// Length of an RSA-2048 signature
pub const SIGNATURE_LEN: usize = 256;

/// Error types for symmetric operations
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("decryption failed: bad padding or wrong key")]
    DecryptionFailed,
}

/// Error types for signature operations
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("signing failed: {0}")]
    SigningFailed(String),

    #[error("signature verification failed")]
    VerificationFailed,

    #[error("invalid signature length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
}

/// Encrypt a message, returning `IV || ciphertext`
pub fn encrypt_message(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let iv: [u8; IV_LEN] = rand::random();
    let cipher = Aes256CbcEnc::new_from_slices(key, &iv).map_err(|_| {
        CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: key.len(),
        }
    })?;
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt `IV || ciphertext` produced by [`encrypt_message`]
pub fn decrypt_message(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < IV_LEN {
        return Err(CryptoError::CiphertextTooShort(data.len()));
    }
    let (iv, ciphertext) = data.split_at(IV_LEN);
    let cipher =
        Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: key.len(),
        })?;
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// SHA-256 digest used as frame checksum
pub fn compute_checksum(data: &[u8]) -> [u8; CHECKSUM_LEN] {
    Sha256::digest(data).into()
}

/// Recompute the checksum of `data` and compare
pub fn verify_checksum(data: &[u8], checksum: &[u8]) -> bool {
    compute_checksum(data).as_slice() == checksum
}

/// Sign a message with RSA PKCS#1 v1.5 over SHA-256
pub fn sign_message(key: &RsaPrivateKey, message: &[u8]) -> Result<Vec<u8>, SignatureError> {
    let digest = Sha256::digest(message);
    key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| SignatureError::SigningFailed(e.to_string()))
}

/// Verify a signature produced by [`sign_message`]
pub fn verify_signature(
    public_key: &RsaPublicKey,
    message: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.len() != SIGNATURE_LEN {
        return Err(SignatureError::InvalidLength {
            expected: SIGNATURE_LEN,
            got: signature.len(),
        });
    }
    let digest = Sha256::digest(message);
    public_key
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
        .map_err(|_| SignatureError::VerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut OsRng, 2048).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = [7u8; KEY_LEN];
        let message = "Grüße über den Kanal";

        let encrypted = encrypt_message(&key, message.as_bytes()).unwrap();
        assert_eq!(encrypted.len() % 16, 0);
        assert!(encrypted.len() > IV_LEN);

        let decrypted = decrypt_message(&key, &encrypted).unwrap();
        assert_eq!(decrypted, message.as_bytes());
    }

    #[test]
    fn test_fresh_iv_per_message() {
        let key = [1u8; KEY_LEN];
        let a = encrypt_message(&key, b"same").unwrap();
        let b = encrypt_message(&key, b"same").unwrap();
        assert_ne!(a[..IV_LEN], b[..IV_LEN]);
    }

    #[test]
    fn test_decrypt_wrong_key_fails_or_differs() {
        let encrypted = encrypt_message(&[1u8; KEY_LEN], b"attack at dawn").unwrap();
        match decrypt_message(&[2u8; KEY_LEN], &encrypted) {
            Ok(plain) => assert_ne!(plain, b"attack at dawn"),
            Err(e) => assert_eq!(e, CryptoError::DecryptionFailed),
        }
    }

    #[test]
    fn test_invalid_key_and_short_input() {
        assert_eq!(
            encrypt_message(&[0u8; 5], b"x"),
            Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                got: 5
            })
        );
        assert_eq!(
            decrypt_message(&[0u8; KEY_LEN], &[0u8; 3]),
            Err(CryptoError::CiphertextTooShort(3))
        );
    }

    #[test]
    fn test_checksum() {
        let data = b"payload";
        let checksum = compute_checksum(data);
        assert!(verify_checksum(data, &checksum));
        assert!(!verify_checksum(b"payloae", &checksum));
        assert!(!verify_checksum(data, &checksum[..31]));
    }

    #[test]
    fn test_sign_and_verify() {
        let key = test_key();
        let message = b"test message";

        let signature = sign_message(&key, message).unwrap();
        assert_eq!(signature.len(), SIGNATURE_LEN);
        assert!(verify_signature(&key.to_public_key(), message, &signature).is_ok());
    }

    #[test]
    fn test_verify_wrong_message_fails() {
        let key = test_key();
        let signature = sign_message(&key, b"test message").unwrap();

        assert!(matches!(
            verify_signature(&key.to_public_key(), b"different message", &signature),
            Err(SignatureError::VerificationFailed)
        ));
    }

    #[test]
    fn test_verify_wrong_key_fails() {
        let key1 = test_key();
        let key2 = test_key();
        let signature = sign_message(&key1, b"test message").unwrap();

        assert!(verify_signature(&key2.to_public_key(), b"test message", &signature).is_err());
    }

    #[test]
    fn test_verify_truncated_signature() {
        let key = test_key();
        let signature = sign_message(&key, b"m").unwrap();

        assert!(matches!(
            verify_signature(&key.to_public_key(), b"m", &signature[..100]),
            Err(SignatureError::InvalidLength { got: 100, .. })
        ));
    }
}
