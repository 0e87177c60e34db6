//! `KeyStore` (§4.H): composes a `SecretStore` into named **identities**,
//! each an encrypted private key plus a `Permissions` record consulted
//! on every access. Adds derivation (`derivation.rs`) and backup/restore
//! (`backup.rs`) on top. Generalizes the teacher's `KeysTable`, which
//! held exactly one hardcoded keypair under fixed `private_key`/
//! `public_key` entries, into an arbitrary number of named identities
//! addressed by the key prefixes in §6 ("Secret store keys").

pub mod backup;
pub mod derivation;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::crypto::Crypto;
use crate::error::{Error, KeyStoreError};
use crate::secret_store::{Protection, SecretStore};

pub use backup::BackupEnvelope;

fn now_secs() -> i64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .expect("system clock before unix epoch")
    .as_secs() as i64
}

/// §3 "Identity record".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
  pub id: String,
  pub name: String,
  pub created_at: i64,
  pub last_used_at: i64,
  pub derivation_path: Option<String>,
  pub parent: Option<String>,
  pub metadata: JsonValue,
}

/// §3 "Permissions", consulted on every signing/decryption/derivation
/// access; expired or over-limit permissions block use (§4.H).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Permissions {
  pub can_sign: bool,
  pub can_decrypt: bool,
  pub can_derive: bool,
  pub can_export: Option<bool>,
  pub requires_biometric: bool,
  pub valid_from: Option<i64>,
  pub valid_until: Option<i64>,
  pub usage_limit: Option<u64>,
  pub usage_count: u64,
}

impl Permissions {
  /// A freshly created identity can do everything, with no usage bound.
  pub fn unrestricted() -> Self {
    Self {
      can_sign: true,
      can_decrypt: true,
      can_derive: true,
      can_export: Some(true),
      requires_biometric: false,
      valid_from: None,
      valid_until: None,
      usage_limit: None,
      usage_count: 0,
    }
  }

  fn check(&self, now: i64) -> crate::Result<()> {
    if let Some(from) = self.valid_from {
      if now < from {
        return Err(Error::KeyStore(KeyStoreError::PermissionExpired));
      }
    }
    if let Some(until) = self.valid_until {
      if now > until {
        return Err(Error::KeyStore(KeyStoreError::PermissionExpired));
      }
    }
    if let Some(limit) = self.usage_limit {
      if self.usage_count >= limit {
        return Err(Error::KeyStore(KeyStoreError::PermissionExpired));
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMetadata {
  identity: Identity,
  permissions: Permissions,
}

fn identity_private_key(id: &str) -> String {
  format!("identity.{id}.private")
}

fn identity_public_key(id: &str) -> String {
  format!("identity.{id}.public")
}

fn metadata_key(id: &str) -> String {
  format!("metadata.{id}")
}

/// Identity storage, permission enforcement, derivation and backup over
/// a narrow `SecretStore`, the way the teacher's `ClientDatabase`
/// composes table wrappers over one `redb::Database` handle.
pub struct KeyStore<S: SecretStore> {
  store: S,
  crypto: Box<dyn Crypto>,
  /// Guards `get_or_create` style sequences so concurrent callers don't
  /// race on identity creation; the `SecretStore` itself is already
  /// safe for concurrent access.
  lock: Mutex<()>,
}

impl<S: SecretStore> KeyStore<S> {
  pub fn new(store: S, crypto: Box<dyn Crypto>) -> Self {
    Self {
      store,
      crypto,
      lock: Mutex::new(()),
    }
  }

  fn load_metadata(&self, id: &str) -> crate::Result<StoredMetadata> {
    let raw = self
      .store
      .get(&metadata_key(id))?
      .ok_or_else(|| Error::KeyStore(KeyStoreError::IdentityMissing(id.to_string())))?;
    serde_json::from_slice(&raw)
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(format!("corrupt identity metadata: {e}"))))
  }

  fn save_metadata(&self, meta: &StoredMetadata) -> crate::Result<()> {
    let raw = serde_json::to_vec(meta)
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    self.store.put(&metadata_key(&meta.identity.id), &raw, Protection::None)
  }

  fn load_private_key(&self, id: &str) -> crate::Result<[u8; 32]> {
    let raw = self
      .store
      .get(&identity_private_key(id))?
      .ok_or_else(|| Error::KeyStore(KeyStoreError::IdentityMissing(id.to_string())))?;
    raw
      .try_into()
      .map_err(|_| Error::KeyStore(KeyStoreError::PlatformCryptoFailure("malformed private key".to_string())))
  }

  fn store_keypair(&self, id: &str, secret: &[u8; 32], protection: Protection) -> crate::Result<()> {
    let pubkey = self.crypto.x_only_public_key(secret)?;
    self.store.put(&identity_private_key(id), secret, protection)?;
    self.store.put(&identity_public_key(id), &pubkey, Protection::None)?;
    Ok(())
  }

  /// Creates a brand-new identity with a fresh keypair and unrestricted
  /// permissions, rejecting a name collision on the chosen id.
  pub fn create_identity(&self, id: &str, name: &str, metadata: JsonValue) -> crate::Result<Identity> {
    let _guard = self.lock.lock().expect("keystore mutex poisoned");
    if self.store.exists(&metadata_key(id))? {
      return Err(Error::KeyStore(KeyStoreError::IdentityDuplicate(id.to_string())));
    }
    let secret = self.crypto.generate_secret_key();
    self.store_keypair(id, &secret, Protection::UnlockRequired)?;

    let now = now_secs();
    let identity = Identity {
      id: id.to_string(),
      name: name.to_string(),
      created_at: now,
      last_used_at: now,
      derivation_path: None,
      parent: None,
      metadata,
    };
    let stored = StoredMetadata {
      identity: identity.clone(),
      permissions: Permissions::unrestricted(),
    };
    self.save_metadata(&stored)?;
    Ok(identity)
  }

  pub fn get_identity(&self, id: &str) -> crate::Result<Identity> {
    Ok(self.load_metadata(id)?.identity)
  }

  pub fn get_permissions(&self, id: &str) -> crate::Result<Permissions> {
    Ok(self.load_metadata(id)?.permissions)
  }

  pub fn set_permissions(&self, id: &str, permissions: Permissions) -> crate::Result<()> {
    let mut stored = self.load_metadata(id)?;
    stored.permissions = permissions;
    self.save_metadata(&stored)
  }

  pub fn public_key(&self, id: &str) -> crate::Result<[u8; 32]> {
    let raw = self
      .store
      .get(&identity_public_key(id))?
      .ok_or_else(|| Error::KeyStore(KeyStoreError::IdentityMissing(id.to_string())))?;
    raw
      .try_into()
      .map_err(|_| Error::KeyStore(KeyStoreError::PlatformCryptoFailure("malformed public key".to_string())))
  }

  pub fn list_identities(&self) -> crate::Result<Vec<Identity>> {
    let mut out = Vec::new();
    for key in self.store.list()? {
      if let Some(id) = key.strip_prefix("metadata.") {
        out.push(self.load_metadata(id)?.identity);
      }
    }
    out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(out)
  }

  pub fn delete_identity(&self, id: &str) -> crate::Result<()> {
    self.store.delete(&identity_private_key(id))?;
    self.store.delete(&identity_public_key(id))?;
    self.store.delete(&metadata_key(id))?;
    Ok(())
  }

  /// Marks an access against `id`'s permissions, bumping `usage_count`
  /// and `last_used_at`. Call after the guarded operation succeeds.
  fn record_use(&self, mut stored: StoredMetadata) -> crate::Result<()> {
    stored.permissions.usage_count += 1;
    stored.identity.last_used_at = now_secs();
    self.save_metadata(&stored)
  }

  fn require(&self, id: &str, check: impl FnOnce(&Permissions) -> bool, denial: KeyStoreError) -> crate::Result<StoredMetadata> {
    let stored = self.load_metadata(id)?;
    if !check(&stored.permissions) {
      return Err(Error::KeyStore(denial));
    }
    stored.permissions.check(now_secs())?;
    Ok(stored)
  }

  /// Signs `digest` under identity `id`'s key, subject to `can_sign` and
  /// the permission's validity window/usage limit.
  pub fn sign(&self, id: &str, digest: &[u8; 32]) -> crate::Result<[u8; 64]> {
    let stored = self.require(id, |p| p.can_sign, KeyStoreError::PermissionDenied)?;
    let secret = self.load_private_key(id)?;
    let sig = self.crypto.sign_schnorr(digest, &secret)?;
    self.record_use(stored)?;
    Ok(sig)
  }

  /// Computes an ECDH shared secret under identity `id`'s key, subject
  /// to `can_decrypt` (the overlay's only use for raw ECDH).
  pub fn ecdh(&self, id: &str, peer_pubkey: &[u8; 32]) -> crate::Result<[u8; 32]> {
    let stored = self.require(id, |p| p.can_decrypt, KeyStoreError::PermissionDenied)?;
    let secret = self.load_private_key(id)?;
    let shared = self.crypto.ecdh(&secret, peer_pubkey)?;
    self.record_use(stored)?;
    Ok(shared)
  }

  /// Derives a child identity from `parent_id` via HMAC-SHA-256 over the
  /// parent's private key (§4.H "Derivation"). The parent must have
  /// `can_derive`; the child inherits the parent's permissions verbatim
  /// except for a reset `usage_count`.
  pub fn derive(&self, parent_id: &str, child_id: &str, path: &str) -> crate::Result<Identity> {
    let _guard = self.lock.lock().expect("keystore mutex poisoned");
    let parent_stored = self.require(parent_id, |p| p.can_derive, KeyStoreError::PermissionDenied)?;
    if self.store.exists(&metadata_key(child_id))? {
      return Err(Error::KeyStore(KeyStoreError::IdentityDuplicate(child_id.to_string())));
    }

    let parent_secret = self.load_private_key(parent_id)?;
    let child_secret = derivation::derive_child_secret(&parent_secret, path);
    self.store_keypair(child_id, &child_secret, Protection::UnlockRequired)?;

    let now = now_secs();
    let identity = Identity {
      id: child_id.to_string(),
      name: format!("{} / {}", parent_stored.identity.name, path),
      created_at: now,
      last_used_at: now,
      derivation_path: Some(path.to_string()),
      parent: Some(parent_id.to_string()),
      metadata: parent_stored.identity.metadata.clone(),
    };
    let mut inherited = parent_stored.permissions;
    inherited.usage_count = 0;
    let stored = StoredMetadata {
      identity: identity.clone(),
      permissions: inherited,
    };
    self.save_metadata(&stored)?;
    Ok(identity)
  }

  /// Exports the given identities (or all, if `ids` is empty) as an
  /// encrypted backup envelope (§4.H "Backup"). Every identity must
  /// have `can_export` set.
  pub fn export(&self, ids: &[String], password: &str) -> crate::Result<BackupEnvelope> {
    let targets: Vec<String> = if ids.is_empty() {
      self.list_identities()?.into_iter().map(|i| i.id).collect()
    } else {
      ids.to_vec()
    };

    let mut encrypted = Vec::with_capacity(targets.len());
    for id in &targets {
      let stored = self.load_metadata(id)?;
      if stored.permissions.can_export != Some(true) {
        return Err(Error::KeyStore(KeyStoreError::PermissionDenied));
      }
      let secret = self.load_private_key(id)?;
      encrypted.push(backup::encrypt_identity(id, password, &secret));
    }
    Ok(backup::build_envelope(encrypted))
  }

  /// Restores identities from a backup envelope (§4.H "Backup"). The
  /// checksum is verified before any decryption is attempted so a
  /// corrupted envelope never partially writes (S6).
  pub fn import(&self, envelope: &BackupEnvelope, password: &str) -> crate::Result<Vec<String>> {
    backup::verify_checksum(envelope)?;

    let mut decrypted = Vec::with_capacity(envelope.identities.len());
    for encrypted in &envelope.identities {
      decrypted.push((encrypted.id.clone(), backup::decrypt_identity(password, encrypted)?));
    }

    let _guard = self.lock.lock().expect("keystore mutex poisoned");
    let mut imported = Vec::with_capacity(decrypted.len());
    for (id, secret) in decrypted {
      self.store_keypair(&id, &secret, Protection::UnlockRequired)?;
      if !self.store.exists(&metadata_key(&id))? {
        let now = now_secs();
        let identity = Identity {
          id: id.clone(),
          name: id.clone(),
          created_at: now,
          last_used_at: now,
          derivation_path: None,
          parent: None,
          metadata: JsonValue::Null,
        };
        self.save_metadata(&StoredMetadata {
          identity,
          permissions: Permissions::unrestricted(),
        })?;
      }
      imported.push(id);
    }
    Ok(imported)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  use crate::crypto::Secp256k1Crypto;
  use crate::secret_store::InMemorySecretStore;

  fn store() -> KeyStore<InMemorySecretStore> {
    KeyStore::new(InMemorySecretStore::new(), Box::new(Secp256k1Crypto::new()))
  }

  #[test]
  fn create_then_sign_round_trips_through_verify() {
    let ks = store();
    ks.create_identity("alice", "Alice", JsonValue::Null).unwrap();
    let pubkey = ks.public_key("alice").unwrap();
    let digest = [7u8; 32];

    let sig = ks.sign("alice", &digest).unwrap();
    let crypto = Secp256k1Crypto::new();
    assert!(crypto.verify_schnorr(&digest, &sig, &pubkey).unwrap());
    assert_eq!(ks.get_permissions("alice").unwrap().usage_count, 1);
  }

  #[test]
  fn duplicate_identity_is_rejected() {
    let ks = store();
    ks.create_identity("alice", "Alice", JsonValue::Null).unwrap();
    let err = ks.create_identity("alice", "Alice2", JsonValue::Null).unwrap_err();
    assert!(matches!(err, Error::KeyStore(KeyStoreError::IdentityDuplicate(_))));
  }

  #[test]
  fn sign_is_denied_without_permission() {
    let ks = store();
    ks.create_identity("alice", "Alice", JsonValue::Null).unwrap();
    let mut perms = ks.get_permissions("alice").unwrap();
    perms.can_sign = false;
    ks.set_permissions("alice", perms).unwrap();

    let err = ks.sign("alice", &[1u8; 32]).unwrap_err();
    assert!(matches!(err, Error::KeyStore(KeyStoreError::PermissionDenied)));
  }

  #[test]
  fn sign_is_denied_once_usage_limit_is_exhausted() {
    let ks = store();
    ks.create_identity("alice", "Alice", JsonValue::Null).unwrap();
    let mut perms = ks.get_permissions("alice").unwrap();
    perms.usage_limit = Some(1);
    ks.set_permissions("alice", perms).unwrap();

    ks.sign("alice", &[1u8; 32]).unwrap();
    let err = ks.sign("alice", &[2u8; 32]).unwrap_err();
    assert!(matches!(err, Error::KeyStore(KeyStoreError::PermissionExpired)));
  }

  #[test]
  fn derive_is_deterministic_and_inherits_permissions() {
    let ks = store();
    ks.create_identity("parent", "Parent", JsonValue::Null).unwrap();

    let child = ks.derive("parent", "parent/0", "m/0").unwrap();
    assert_eq!(child.parent.as_deref(), Some("parent"));
    assert_eq!(child.derivation_path.as_deref(), Some("m/0"));

    let child_secret = ks.load_private_key("parent/0").unwrap();
    let direct_parent_secret = ks.load_private_key("parent").unwrap();
    let expected = derivation::derive_child_secret(&direct_parent_secret, "m/0");
    assert_eq!(child_secret, expected);

    assert!(ks.get_permissions("parent/0").unwrap().can_derive);
  }

  #[test]
  fn derive_is_denied_without_can_derive() {
    let ks = store();
    ks.create_identity("parent", "Parent", JsonValue::Null).unwrap();
    let mut perms = ks.get_permissions("parent").unwrap();
    perms.can_derive = false;
    ks.set_permissions("parent", perms).unwrap();

    let err = ks.derive("parent", "parent/0", "m/0").unwrap_err();
    assert!(matches!(err, Error::KeyStore(KeyStoreError::PermissionDenied)));
  }

  #[test]
  fn export_then_import_restores_signing_capability() {
    let ks = store();
    ks.create_identity("alice", "Alice", JsonValue::Null).unwrap();
    ks.create_identity("bob", "Bob", JsonValue::Null).unwrap();
    let alice_pubkey = ks.public_key("alice").unwrap();
    let bob_pubkey = ks.public_key("bob").unwrap();

    let envelope = ks.export(&[], "p@ss").unwrap();

    let restored = store();
    let imported = restored.import(&envelope, "p@ss").unwrap();
    assert_eq!(imported.len(), 2);
    assert_eq!(restored.public_key("alice").unwrap(), alice_pubkey);
    assert_eq!(restored.public_key("bob").unwrap(), bob_pubkey);
  }

  #[test]
  fn import_rejects_a_corrupted_envelope_without_writing_anything() {
    let ks = store();
    ks.create_identity("alice", "Alice", JsonValue::Null).unwrap();
    let mut envelope = ks.export(&[], "p@ss").unwrap();
    envelope.identities[0].payload = "not valid base64 payload at all!!".to_string();

    let restored = store();
    let err = restored.import(&envelope, "p@ss").unwrap_err();
    assert!(matches!(err, Error::KeyStore(KeyStoreError::BackupCorrupt(_))));
    assert!(restored.list_identities().unwrap().is_empty());
  }

  #[test]
  fn export_is_denied_when_can_export_is_false() {
    let ks = store();
    ks.create_identity("alice", "Alice", JsonValue::Null).unwrap();
    let mut perms = ks.get_permissions("alice").unwrap();
    perms.can_export = Some(false);
    ks.set_permissions("alice", perms).unwrap();

    let err = ks.export(&[], "p@ss").unwrap_err();
    assert!(matches!(err, Error::KeyStore(KeyStoreError::PermissionDenied)));
  }
}
