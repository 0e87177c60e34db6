//! Backup envelope (§4.H "Backup"): per identity, a random salt,
//! PBKDF2-HMAC-SHA256 (100k iterations) to a 32-byte key, AES-256-CBC
//! with a random IV encrypting the private key, base64 of `iv‖ciphertext`.
//! A SHA-256 checksum over the whole envelope (with the checksum field
//! zeroed) guards against corruption.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, KeyStoreError};

const PBKDF2_ROUNDS: u32 = 100_000;
const BACKUP_VERSION: u32 = 1;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedIdentity {
  pub id: String,
  pub salt: String,
  pub payload: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupEnvelope {
  pub version: u32,
  pub identities: Vec<EncryptedIdentity>,
  pub checksum: String,
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
  let mut key = [0u8; 32];
  pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ROUNDS, &mut key);
  key
}

pub fn encrypt_identity(id: &str, password: &str, secret: &[u8; 32]) -> EncryptedIdentity {
  let mut salt = [0u8; 32];
  rand::thread_rng().fill_bytes(&mut salt);
  let key = derive_key(password, &salt);

  let mut iv = [0u8; 16];
  rand::thread_rng().fill_bytes(&mut iv);
  let ciphertext = Aes256CbcEnc::new((&key).into(), (&iv).into()).encrypt_padded_vec_mut::<Pkcs7>(secret);

  let mut payload_bytes = Vec::with_capacity(iv.len() + ciphertext.len());
  payload_bytes.extend_from_slice(&iv);
  payload_bytes.extend_from_slice(&ciphertext);

  EncryptedIdentity {
    id: id.to_string(),
    salt: hex::encode(salt),
    payload: BASE64.encode(payload_bytes),
  }
}

pub fn decrypt_identity(password: &str, encrypted: &EncryptedIdentity) -> crate::Result<[u8; 32]> {
  let salt = hex::decode(&encrypted.salt)
    .map_err(|_| Error::KeyStore(KeyStoreError::BackupCorrupt("malformed salt".to_string())))?;
  let key = derive_key(password, &salt);

  let raw = BASE64
    .decode(&encrypted.payload)
    .map_err(|_| Error::KeyStore(KeyStoreError::BackupCorrupt("malformed payload".to_string())))?;
  if raw.len() < 16 {
    return Err(Error::KeyStore(KeyStoreError::BackupCorrupt("payload too short".to_string())));
  }
  let (iv, ciphertext) = raw.split_at(16);

  let plaintext = Aes256CbcDec::new((&key).into(), iv.into())
    .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
    .map_err(|_| Error::KeyStore(KeyStoreError::BackupCorrupt("decryption failed, wrong password?".to_string())))?;

  plaintext
    .try_into()
    .map_err(|_| Error::KeyStore(KeyStoreError::BackupCorrupt("decrypted secret has the wrong length".to_string())))
}

fn checksum_input(identities: &[EncryptedIdentity]) -> Vec<u8> {
  let zeroed = BackupEnvelope {
    version: BACKUP_VERSION,
    identities: identities.to_vec(),
    checksum: String::new(),
  };
  serde_json::to_vec(&zeroed).expect("envelope always serializes")
}

pub fn build_envelope(identities: Vec<EncryptedIdentity>) -> BackupEnvelope {
  let checksum = hex::encode(Sha256::digest(checksum_input(&identities)));
  BackupEnvelope {
    version: BACKUP_VERSION,
    identities,
    checksum,
  }
}

pub fn verify_checksum(envelope: &BackupEnvelope) -> crate::Result<()> {
  let expected = hex::encode(Sha256::digest(checksum_input(&envelope.identities)));
  if expected != envelope.checksum {
    return Err(Error::KeyStore(KeyStoreError::BackupCorrupt("checksum mismatch".to_string())));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn identity_round_trips_through_encryption() {
    let secret = [9u8; 32];
    let encrypted = encrypt_identity("id1", "correct horse", &secret);
    let decrypted = decrypt_identity("correct horse", &encrypted).unwrap();
    assert_eq!(decrypted, secret);
  }

  #[test]
  fn wrong_password_fails_to_decrypt() {
    let secret = [9u8; 32];
    let encrypted = encrypt_identity("id1", "correct horse", &secret);
    assert!(decrypt_identity("wrong password", &encrypted).is_err());
  }

  #[test]
  fn envelope_checksum_detects_tampering() {
    let encrypted = encrypt_identity("id1", "pw", &[1u8; 32]);
    let mut envelope = build_envelope(vec![encrypted]);
    verify_checksum(&envelope).unwrap();

    envelope.identities[0].salt = hex::encode([0u8; 32]);
    assert!(verify_checksum(&envelope).is_err());
  }
}
