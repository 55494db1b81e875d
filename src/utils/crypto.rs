//! Sealed-box transform for encrypted messages.
//!
//! The link layer treats encryption as an opaque transform keyed by a
//! public/private key pair. This module is the reference transform used by
//! [`DeviceDirectory`](crate::link::DeviceDirectory)'s default `encrypt` and
//! `decrypt`: the sender generates an ephemeral X25519 key, derives a
//! symmetric key with SHA-256 over the shared secret and both public keys,
//! and seals the serialized message with XChaCha20-Poly1305.
//!
//! The sealed result is itself a message of type `encrypted` whose body holds
//! the hex encoded ephemeral key, nonce and ciphertext.

use crate::core::message::{Message, MessageType};
use crate::error::{constants, LinkError, Result};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as DalekPublic, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

const FIELD_EPHEMERAL: &str = "ephemeralKey";
const FIELD_NONCE: &str = "nonce";
const FIELD_DATA: &str = "data";

/// Public half of a device key pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Private half of a device key pair. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey([u8; 32]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Derive the matching public key
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(self.0);
        PublicKey(DalekPublic::from(&secret).to_bytes())
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// A device key pair
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public: PublicKey,
    pub private: PrivateKey,
}

impl KeyPair {
    /// Generate a fresh key pair from the OS RNG
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(DalekPublic::from(&secret).to_bytes());
        Self {
            public,
            private: PrivateKey(secret.to_bytes()),
        }
    }
}

fn derive_key(shared: &[u8; 32], ephemeral: &[u8; 32], recipient: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shared);
    hasher.update(ephemeral);
    hasher.update(recipient);
    hasher.finalize().into()
}

fn generate_nonce() -> Result<[u8; 24]> {
    let mut nonce = [0u8; 24];
    getrandom::fill(&mut nonce)
        .map_err(|e| LinkError::Encryption(format!("Failed to generate nonce: {e}")))?;
    Ok(nonce)
}

/// Seal `message` for the holder of `recipient`'s private key.
///
/// Any payload attached to `message` is not part of the envelope; callers
/// carry it alongside.
pub fn seal(message: &Message, recipient: &PublicKey) -> Result<Message> {
    let plaintext = message.to_json()?;

    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = DalekPublic::from(&ephemeral).to_bytes();
    let shared = ephemeral.diffie_hellman(&DalekPublic::from(recipient.0));

    let mut key = derive_key(shared.as_bytes(), &ephemeral_public, &recipient.0);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();

    let nonce = generate_nonce()?;
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext.as_ref())
        .map_err(|_| LinkError::Encryption(constants::ERR_ENCRYPTION_FAILED.into()))?;

    Ok(Message::with_id(message.id, MessageType::Encrypted)
        .with_field(FIELD_EPHEMERAL, hex::encode(ephemeral_public))
        .with_field(FIELD_NONCE, hex::encode(nonce))
        .with_field(FIELD_DATA, hex::encode(ciphertext)))
}

fn envelope_bytes<const N: usize>(message: &Message, field: &str) -> Result<[u8; N]> {
    let raw = envelope_vec(message, field)?;
    raw.try_into()
        .map_err(|_| LinkError::Decryption(format!("Envelope field '{field}' has the wrong length")))
}

fn envelope_vec(message: &Message, field: &str) -> Result<Vec<u8>> {
    let encoded = message
        .field(field)
        .ok_or_else(|| LinkError::Decryption(constants::ERR_MISSING_ENVELOPE_FIELD.into()))?;
    hex::decode(encoded)
        .map_err(|e| LinkError::Decryption(format!("Envelope field '{field}' is not hex: {e}")))
}

/// Open an `encrypted` message with the recipient's private key
pub fn open(message: &Message, private: &PrivateKey) -> Result<Message> {
    if message.kind() != &MessageType::Encrypted {
        return Err(LinkError::Decryption(format!(
            "Message of type '{}' is not encrypted",
            message.kind()
        )));
    }

    let ephemeral_public: [u8; 32] = envelope_bytes(message, FIELD_EPHEMERAL)?;
    let nonce: [u8; 24] = envelope_bytes(message, FIELD_NONCE)?;
    let ciphertext = envelope_vec(message, FIELD_DATA)?;

    let secret = StaticSecret::from(private.0);
    let recipient = DalekPublic::from(&secret).to_bytes();
    let shared = secret.diffie_hellman(&DalekPublic::from(ephemeral_public));

    let mut key = derive_key(shared.as_bytes(), &ephemeral_public, &recipient);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    key.zeroize();

    let plaintext = cipher
        .decrypt(XNonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| LinkError::Decryption(constants::ERR_DECRYPTION_FAILED.into()))?;

    Message::from_json(&plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::expect_used)]
    fn test_seal_then_open() {
        let keys = KeyPair::generate();
        let message = Message::new(MessageType::application("ping")).with_field("note", "hi");

        let sealed = seal(&message, &keys.public).expect("seal");
        assert_eq!(sealed.kind(), &MessageType::Encrypted);
        assert!(sealed.field("note").is_none());

        let opened = open(&sealed, &keys.private).expect("open");
        assert_eq!(opened, message);
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_wrong_key_fails() {
        let keys = KeyPair::generate();
        let other = KeyPair::generate();
        let sealed = seal(&Message::new(MessageType::application("ping")), &keys.public)
            .expect("seal");

        assert!(matches!(
            open(&sealed, &other.private),
            Err(LinkError::Decryption(_))
        ));
    }

    #[test]
    fn test_missing_field_fails() {
        let keys = KeyPair::generate();
        let bogus = Message::new(MessageType::Encrypted).with_field(FIELD_NONCE, "00");
        assert!(matches!(
            open(&bogus, &keys.private),
            Err(LinkError::Decryption(_))
        ));
    }

    #[test]
    fn test_public_key_derivation_is_stable() {
        let keys = KeyPair::generate();
        assert_eq!(keys.private.public_key(), keys.public);
    }
}
