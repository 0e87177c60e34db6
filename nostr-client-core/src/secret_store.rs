//! The `SecretStore` capability (§4.H, §9): `{put, get, delete, list,
//! exists}` over opaque byte blobs keyed by string, with a protection
//! level the platform keychain would enforce. Grounded in the teacher's
//! `db.rs`/`database/keys_table.rs`, generalized from two hardcoded keys
//! (`private_key`, `public_key`) to an arbitrary key namespace and from a
//! bare `Database` handle to a trait so the KeyStore never depends on
//! `redb` directly.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{Error, KeyStoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
  None,
  UnlockRequired,
  BiometricRequired,
}

pub trait SecretStore: Send + Sync {
  fn put(&self, key: &str, bytes: &[u8], protection: Protection) -> crate::Result<()>;
  fn get(&self, key: &str) -> crate::Result<Option<Vec<u8>>>;
  fn delete(&self, key: &str) -> crate::Result<()>;
  fn list(&self) -> crate::Result<Vec<String>>;
  fn exists(&self, key: &str) -> crate::Result<bool> {
    Ok(self.get(key)?.is_some())
  }
}

const VALUES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("secret_store_values");
const PROTECTION_TABLE: TableDefinition<&str, u8> = TableDefinition::new("secret_store_protection");

fn protection_to_tag(protection: Protection) -> u8 {
  match protection {
    Protection::None => 0,
    Protection::UnlockRequired => 1,
    Protection::BiometricRequired => 2,
  }
}

/// `redb`-backed default implementation, one database file holding two
/// tables (values and their protection tags), the way the teacher keeps
/// one `.redb` file per logical table under `db/`.
pub struct RedbSecretStore {
  db: Mutex<Database>,
}

impl RedbSecretStore {
  pub fn open(path: impl AsRef<Path>) -> crate::Result<Self> {
    if let Some(parent) = path.as_ref().parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    }
    let db = Database::create(path.as_ref())
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    {
      let write_txn = db
        .begin_write()
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
      write_txn
        .open_table(VALUES_TABLE)
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
      write_txn
        .open_table(PROTECTION_TABLE)
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
      write_txn
        .commit()
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    }
    Ok(Self { db: Mutex::new(db) })
  }
}

impl SecretStore for RedbSecretStore {
  fn put(&self, key: &str, bytes: &[u8], protection: Protection) -> crate::Result<()> {
    let db = self.db.lock().expect("secret store mutex poisoned");
    let write_txn = db
      .begin_write()
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    {
      let mut values = write_txn
        .open_table(VALUES_TABLE)
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
      values
        .insert(key, bytes)
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
      let mut protections = write_txn
        .open_table(PROTECTION_TABLE)
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
      protections
        .insert(key, protection_to_tag(protection))
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    }
    write_txn
      .commit()
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    Ok(())
  }

  fn get(&self, key: &str) -> crate::Result<Option<Vec<u8>>> {
    let db = self.db.lock().expect("secret store mutex poisoned");
    let read_txn = db
      .begin_read()
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    let table = read_txn
      .open_table(VALUES_TABLE)
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    Ok(table
      .get(key)
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?
      .map(|v| v.value().to_vec()))
  }

  fn delete(&self, key: &str) -> crate::Result<()> {
    let db = self.db.lock().expect("secret store mutex poisoned");
    let write_txn = db
      .begin_write()
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    {
      let mut values = write_txn
        .open_table(VALUES_TABLE)
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
      values
        .remove(key)
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
      let mut protections = write_txn
        .open_table(PROTECTION_TABLE)
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
      protections
        .remove(key)
        .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    }
    write_txn
      .commit()
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    Ok(())
  }

  fn list(&self) -> crate::Result<Vec<String>> {
    let db = self.db.lock().expect("secret store mutex poisoned");
    let read_txn = db
      .begin_read()
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    let table = read_txn
      .open_table(VALUES_TABLE)
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
    let mut keys = Vec::new();
    for entry in table
      .iter()
      .map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?
    {
      let (k, _v) = entry.map_err(|e| Error::KeyStore(KeyStoreError::PlatformCryptoFailure(e.to_string())))?;
      keys.push(k.value().to_string());
    }
    Ok(keys)
  }
}

/// In-memory implementation for tests and for hosts with no platform
/// keychain; never persists anything to disk.
#[derive(Default)]
pub struct InMemorySecretStore {
  values: Mutex<BTreeMap<String, (Vec<u8>, Protection)>>,
}

impl InMemorySecretStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl SecretStore for InMemorySecretStore {
  fn put(&self, key: &str, bytes: &[u8], protection: Protection) -> crate::Result<()> {
    self
      .values
      .lock()
      .expect("secret store mutex poisoned")
      .insert(key.to_string(), (bytes.to_vec(), protection));
    Ok(())
  }

  fn get(&self, key: &str) -> crate::Result<Option<Vec<u8>>> {
    Ok(
      self
        .values
        .lock()
        .expect("secret store mutex poisoned")
        .get(key)
        .map(|(bytes, _)| bytes.clone()),
    )
  }

  fn delete(&self, key: &str) -> crate::Result<()> {
    self.values.lock().expect("secret store mutex poisoned").remove(key);
    Ok(())
  }

  fn list(&self) -> crate::Result<Vec<String>> {
    Ok(
      self
        .values
        .lock()
        .expect("secret store mutex poisoned")
        .keys()
        .cloned()
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  #[cfg(test)]
  use pretty_assertions::assert_eq;

  #[test]
  fn in_memory_put_get_delete_round_trips() {
    let store = InMemorySecretStore::new();
    assert!(!store.exists("identity.abc.private").unwrap());

    store
      .put("identity.abc.private", b"secret-bytes", Protection::UnlockRequired)
      .unwrap();
    assert!(store.exists("identity.abc.private").unwrap());
    assert_eq!(store.get("identity.abc.private").unwrap().unwrap(), b"secret-bytes");

    store.delete("identity.abc.private").unwrap();
    assert!(store.get("identity.abc.private").unwrap().is_none());
  }

  #[test]
  fn in_memory_list_reflects_all_live_keys() {
    let store = InMemorySecretStore::new();
    store.put("a", b"1", Protection::None).unwrap();
    store.put("b", b"2", Protection::None).unwrap();
    let mut keys = store.list().unwrap();
    keys.sort();
    assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
  }

  #[test]
  fn redb_store_persists_across_handles_at_same_path() {
    let dir = std::env::temp_dir().join(format!("nostr-client-core-test-{}", std::process::id()));
    let path = dir.join("secrets.redb");

    {
      let store = RedbSecretStore::open(&path).unwrap();
      store.put("identity.x.private", b"deadbeef", Protection::None).unwrap();
    }
    {
      let store = RedbSecretStore::open(&path).unwrap();
      assert_eq!(store.get("identity.x.private").unwrap().unwrap(), b"deadbeef");
    }

    let _ = std::fs::remove_dir_all(&dir);
  }
}
