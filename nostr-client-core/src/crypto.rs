//! The `Crypto` capability (§9 "Polymorphism"): signing, hashing and the
//! two NIP encryption schemes, kept behind a trait so callers can swap in
//! a hardware-backed or platform keychain implementation without the rest
//! of the crate knowing. The default implementation is grounded in the
//! teacher's `schnorr.rs`, generalized from signing an arbitrary message
//! digest to signing the event id specifically, and extended with ECDH
//! and the NIP-04/NIP-44 payload schemes it didn't need.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bitcoin_hashes::{sha256, Hash};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use secp256k1::{KeyPair, Message, PublicKey, Secp256k1, SecretKey, XOnlyPublicKey};

use crate::error::{Error, OverlayError, ProtocolError};

pub type SecretKeyBytes = [u8; 32];
pub type XOnlyPubKeyBytes = [u8; 32];

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Signing, hashing, and NIP-04/NIP-44 payload encryption, as a narrow
/// capability rather than a concrete dependency on one curve library.
pub trait Crypto: Send + Sync {
  fn generate_secret_key(&self) -> SecretKeyBytes;
  fn x_only_public_key(&self, secret: &SecretKeyBytes) -> crate::Result<XOnlyPubKeyBytes>;
  fn sha256(&self, data: &[u8]) -> [u8; 32];
  fn sign_schnorr(&self, digest: &[u8; 32], secret: &SecretKeyBytes) -> crate::Result<[u8; 64]>;
  fn verify_schnorr(&self, digest: &[u8; 32], sig: &[u8; 64], pubkey: &XOnlyPubKeyBytes) -> crate::Result<bool>;
  fn ecdh(&self, secret: &SecretKeyBytes, peer_pubkey: &XOnlyPubKeyBytes) -> crate::Result<[u8; 32]>;

  fn encrypt_nip04(&self, shared_secret: &[u8; 32], plaintext: &str) -> crate::Result<String>;
  fn decrypt_nip04(&self, shared_secret: &[u8; 32], payload: &str) -> crate::Result<String>;

  fn encrypt_nip44(&self, shared_secret: &[u8; 32], plaintext: &str) -> crate::Result<String>;
  fn decrypt_nip44(&self, shared_secret: &[u8; 32], payload: &str) -> crate::Result<String>;
}

/// Default `Crypto` built on `secp256k1` + `bitcoin_hashes`, the same
/// stack the teacher uses for its own key generation and signing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Secp256k1Crypto;

impl Secp256k1Crypto {
  pub fn new() -> Self {
    Self
  }
}

impl Crypto for Secp256k1Crypto {
  fn generate_secret_key(&self) -> SecretKeyBytes {
    let secp = Secp256k1::new();
    let mut rng = rand::thread_rng();
    let (seckey, _pubkey) = secp.generate_keypair(&mut rng);
    seckey.secret_bytes()
  }

  fn x_only_public_key(&self, secret: &SecretKeyBytes) -> crate::Result<XOnlyPubKeyBytes> {
    let secp = Secp256k1::new();
    let seckey = SecretKey::from_slice(secret)
      .map_err(|_| Error::Protocol(ProtocolError::InvalidSignature))?;
    let keypair = KeyPair::from_secret_key(&secp, &seckey);
    Ok(XOnlyPublicKey::from_keypair(&keypair).0.serialize())
  }

  fn sha256(&self, data: &[u8]) -> [u8; 32] {
    sha256::Hash::hash(data).into_inner()
  }

  fn sign_schnorr(&self, digest: &[u8; 32], secret: &SecretKeyBytes) -> crate::Result<[u8; 64]> {
    let secp = Secp256k1::new();
    let seckey = SecretKey::from_slice(secret)
      .map_err(|_| Error::Protocol(ProtocolError::InvalidSignature))?;
    let keypair = KeyPair::from_secret_key(&secp, &seckey);
    let msg = Message::from_slice(digest).map_err(|_| Error::Protocol(ProtocolError::InvalidSignature))?;
    let sig = secp.sign_schnorr_no_aux_rand(&msg, &keypair);
    Ok(sig.as_ref().try_into().expect("schnorr signatures are 64 bytes"))
  }

  fn verify_schnorr(&self, digest: &[u8; 32], sig: &[u8; 64], pubkey: &XOnlyPubKeyBytes) -> crate::Result<bool> {
    let secp = Secp256k1::new();
    let msg = Message::from_slice(digest).map_err(|_| Error::Protocol(ProtocolError::InvalidSignature))?;
    let signature = secp256k1::schnorr::Signature::from_slice(sig)
      .map_err(|_| Error::Protocol(ProtocolError::InvalidSignature))?;
    let xonly =
      XOnlyPublicKey::from_slice(pubkey).map_err(|_| Error::Protocol(ProtocolError::InvalidSignature))?;
    Ok(secp.verify_schnorr(&signature, &msg, &xonly).is_ok())
  }

  fn ecdh(&self, secret: &SecretKeyBytes, peer_pubkey: &XOnlyPubKeyBytes) -> crate::Result<[u8; 32]> {
    let seckey = SecretKey::from_slice(secret)
      .map_err(|_| Error::Protocol(ProtocolError::InvalidSignature))?;
    // Nostr's shared secrets are computed against the even-parity lift of
    // the peer's x-only key, matching NIP-04/NIP-44's convention.
    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(peer_pubkey);
    let pubkey =
      PublicKey::from_slice(&compressed).map_err(|_| Error::Protocol(ProtocolError::InvalidSignature))?;
    let shared = secp256k1::ecdh::SharedSecret::new(&pubkey, &seckey);
    Ok(*shared.as_ref())
  }

  fn encrypt_nip04(&self, shared_secret: &[u8; 32], plaintext: &str) -> crate::Result<String> {
    let mut iv = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut iv);
    let ciphertext = Aes256CbcEnc::new(shared_secret.into(), &iv.into())
      .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());
    Ok(format!("{}?iv={}", BASE64.encode(ciphertext), BASE64.encode(iv)))
  }

  fn decrypt_nip04(&self, shared_secret: &[u8; 32], payload: &str) -> crate::Result<String> {
    let (ciphertext_b64, iv_b64) = payload
      .split_once("?iv=")
      .ok_or(Error::Overlay(OverlayError::DecryptionFailure))?;
    let ciphertext = BASE64
      .decode(ciphertext_b64)
      .map_err(|_| Error::Overlay(OverlayError::DecryptionFailure))?;
    let iv = BASE64
      .decode(iv_b64)
      .map_err(|_| Error::Overlay(OverlayError::DecryptionFailure))?;
    if iv.len() != 16 {
      return Err(Error::Overlay(OverlayError::DecryptionFailure));
    }
    let plaintext = Aes256CbcDec::new(shared_secret.into(), iv.as_slice().into())
      .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
      .map_err(|_| Error::Overlay(OverlayError::DecryptionFailure))?;
    String::from_utf8(plaintext).map_err(|_| Error::Overlay(OverlayError::DecryptionFailure))
  }

  fn encrypt_nip44(&self, shared_secret: &[u8; 32], plaintext: &str) -> crate::Result<String> {
    let conversation_key = self.sha256(shared_secret);
    let cipher = ChaCha20Poly1305::new((&conversation_key).into());
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
      .encrypt(nonce, plaintext.as_bytes())
      .map_err(|_| Error::Overlay(OverlayError::DecryptionFailure))?;
    let mut payload = Vec::with_capacity(1 + nonce_bytes.len() + ciphertext.len());
    payload.push(2u8); // version byte, mirrors NIP-44's versioned envelope
    payload.extend_from_slice(&nonce_bytes);
    payload.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(payload))
  }

  fn decrypt_nip44(&self, shared_secret: &[u8; 32], payload: &str) -> crate::Result<String> {
    let raw = BASE64
      .decode(payload)
      .map_err(|_| Error::Overlay(OverlayError::DecryptionFailure))?;
    if raw.len() < 1 + 12 || raw[0] != 2 {
      return Err(Error::Overlay(OverlayError::DecryptionFailure));
    }
    let nonce = Nonce::from_slice(&raw[1..13]);
    let conversation_key = self.sha256(shared_secret);
    let cipher = ChaCha20Poly1305::new((&conversation_key).into());
    let plaintext = cipher
      .decrypt(nonce, &raw[13..])
      .map_err(|_| Error::Overlay(OverlayError::DecryptionFailure))?;
    String::from_utf8(plaintext).map_err(|_| Error::Overlay(OverlayError::DecryptionFailure))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn schnorr_sign_and_verify_round_trips() {
    let crypto = Secp256k1Crypto::new();
    let secret = crypto.generate_secret_key();
    let pubkey = crypto.x_only_public_key(&secret).unwrap();
    let digest = crypto.sha256(b"event preimage bytes");

    let sig = crypto.sign_schnorr(&digest, &secret).unwrap();
    assert!(crypto.verify_schnorr(&digest, &sig, &pubkey).unwrap());
  }

  #[test]
  fn schnorr_verify_fails_for_wrong_digest() {
    let crypto = Secp256k1Crypto::new();
    let secret = crypto.generate_secret_key();
    let pubkey = crypto.x_only_public_key(&secret).unwrap();
    let digest = crypto.sha256(b"first message");
    let other_digest = crypto.sha256(b"second message");

    let sig = crypto.sign_schnorr(&digest, &secret).unwrap();
    assert!(!crypto.verify_schnorr(&other_digest, &sig, &pubkey).unwrap());
  }

  #[test]
  fn ecdh_is_symmetric_between_both_parties() {
    let crypto = Secp256k1Crypto::new();
    let alice_secret = crypto.generate_secret_key();
    let bob_secret = crypto.generate_secret_key();
    let alice_pub = crypto.x_only_public_key(&alice_secret).unwrap();
    let bob_pub = crypto.x_only_public_key(&bob_secret).unwrap();

    let alice_shared = crypto.ecdh(&alice_secret, &bob_pub).unwrap();
    let bob_shared = crypto.ecdh(&bob_secret, &alice_pub).unwrap();
    assert_eq!(alice_shared, bob_shared);
  }

  #[test]
  fn nip04_round_trips_through_base64_iv_payload() {
    let crypto = Secp256k1Crypto::new();
    let shared_secret = crypto.sha256(b"shared");
    let payload = crypto.encrypt_nip04(&shared_secret, "hello bob").unwrap();
    assert!(payload.contains("?iv="));
    assert_eq!(crypto.decrypt_nip04(&shared_secret, &payload).unwrap(), "hello bob");
  }

  #[test]
  fn nip44_round_trips_and_rejects_tampered_ciphertext() {
    let crypto = Secp256k1Crypto::new();
    let shared_secret = crypto.sha256(b"shared-44");
    let payload = crypto.encrypt_nip44(&shared_secret, "pay me sats").unwrap();
    assert_eq!(crypto.decrypt_nip44(&shared_secret, &payload).unwrap(), "pay me sats");

    let mut tampered = BASE64.decode(&payload).unwrap();
    let last = tampered.len() - 1;
    tampered[last] ^= 0xff;
    let tampered_payload = BASE64.encode(tampered);
    assert!(crypto.decrypt_nip44(&shared_secret, &tampered_payload).is_err());
  }
}
