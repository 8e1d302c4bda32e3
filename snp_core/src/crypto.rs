//! Curve25519 key agreement, Ed25519 signatures, AES-GCM record AEAD, and
//! HMAC-SHA256 transcript-based key derivation for the handshake.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key as AesKey, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};
use zeroize::Zeroize;

use crate::error::{NetError, Result};

type HmacSha256 = Hmac<Sha256>;

/// An ephemeral Curve25519 keypair used once per handshake.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    pub public: X25519PublicKey,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Consumes this keypair to derive a shared secret with the peer's
    /// ephemeral public key (Diffie-Hellman).
    pub fn diffie_hellman(self, peer_public: &X25519PublicKey) -> [u8; 32] {
        self.secret.diffie_hellman(peer_public).to_bytes()
    }
}

/// A long-lived Ed25519 identity keypair used to sign the handshake
/// transcript and certificates.
pub struct SigningIdentity {
    signing_key: SigningKey,
}

impl SigningIdentity {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let signing_key = SigningKey::from_bytes(&bytes);
        bytes.zeroize();
        Self { signing_key }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { signing_key: SigningKey::from_bytes(&bytes) }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn sign(&self, transcript: &[u8]) -> Signature {
        self.signing_key.sign(transcript)
    }
}

pub fn verify_signature(key: &VerifyingKey, transcript: &[u8], sig: &Signature) -> Result<()> {
    key.verify(transcript, sig)
        .map_err(|e| NetError::AuthenticationFailure(format!("signature: {e}")))
}

/// The four session keys produced by handshake key derivation: one data
/// key and one ack key per direction.
#[derive(Clone)]
pub struct SessionKeys {
    pub client_to_server_data: [u8; 32],
    pub client_to_server_ack: [u8; 32],
    pub server_to_client_data: [u8; 32],
    pub server_to_client_ack: [u8; 32],
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.client_to_server_data.zeroize();
        self.client_to_server_ack.zeroize();
        self.server_to_client_data.zeroize();
        self.server_to_client_ack.zeroize();
    }
}

/// Derives the four session keys from the Diffie-Hellman shared secret and
/// the full handshake transcript via HMAC-SHA256, one label per key.
pub fn derive_session_keys(shared_secret: &[u8; 32], transcript: &[u8]) -> SessionKeys {
    let derive = |label: &[u8]| -> [u8; 32] {
        let mut mac = HmacSha256::new_from_slice(shared_secret).expect("HMAC accepts any key length");
        mac.update(transcript);
        mac.update(label);
        let out = mac.finalize().into_bytes();
        let mut key = [0u8; 32];
        key.copy_from_slice(&out);
        key
    };
    SessionKeys {
        client_to_server_data: derive(b"c2s-data"),
        client_to_server_ack: derive(b"c2s-ack"),
        server_to_client_data: derive(b"s2c-data"),
        server_to_client_ack: derive(b"s2c-ack"),
    }
}

/// Encrypts `plaintext` with AES-256-GCM, binding `packet_number` (the
/// per-direction packet number) into the nonce so that replaying an
/// encrypted record under a different packet number fails authentication.
pub fn seal(key: &[u8; 32], packet_number: u64, plaintext: &[u8]) -> Vec<u8> {
    let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key));
    let nonce = nonce_from_packet_number(packet_number);
    cipher
        .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: &packet_number.to_be_bytes() })
        .expect("AES-GCM encryption with a fixed-size nonce cannot fail")
}

pub fn open(key: &[u8; 32], packet_number: u64, ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(key));
    let nonce = nonce_from_packet_number(packet_number);
    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: &packet_number.to_be_bytes() })
        .map_err(|_| NetError::AuthenticationFailure("AEAD tag verification failed".to_string()))
}

fn nonce_from_packet_number(packet_number: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&packet_number.to_be_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crypto_001_dh_agreement_matches() {
        let a = EphemeralKeyPair::generate();
        let b = EphemeralKeyPair::generate();
        let a_pub = a.public;
        let b_pub = b.public;
        let shared_a = a.diffie_hellman(&b_pub);
        let shared_b = b.diffie_hellman(&a_pub);
        assert_eq!(shared_a, shared_b);
    }

    #[test]
    fn crypto_002_sign_and_verify() {
        let id = SigningIdentity::generate();
        let transcript = b"hello transcript";
        let sig = id.sign(transcript);
        assert!(verify_signature(&id.verifying_key(), transcript, &sig).is_ok());
    }

    #[test]
    fn crypto_003_verify_rejects_tampered_transcript() {
        let id = SigningIdentity::generate();
        let sig = id.sign(b"original");
        assert!(verify_signature(&id.verifying_key(), b"tampered", &sig).is_err());
    }

    #[test]
    fn crypto_004_session_keys_distinct() {
        let secret = [7u8; 32];
        let keys = derive_session_keys(&secret, b"transcript");
        assert_ne!(keys.client_to_server_data, keys.client_to_server_ack);
        assert_ne!(keys.client_to_server_data, keys.server_to_client_data);
    }

    #[test]
    fn crypto_005_seal_open_roundtrip() {
        let key = [3u8; 32];
        let ct = seal(&key, 42, b"payload bytes");
        let pt = open(&key, 42, &ct).unwrap();
        assert_eq!(pt, b"payload bytes");
    }

    #[test]
    fn crypto_006_open_rejects_wrong_packet_number() {
        let key = [3u8; 32];
        let ct = seal(&key, 42, b"payload bytes");
        assert!(open(&key, 43, &ct).is_err());
    }
}
