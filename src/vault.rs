//! Secret store collaborator and the sidecar vault export.
//!
//! The secrets store is external to this crate; it is modelled as a plain
//! `get/put/remove` by service name with opaque string values. Two services
//! are written here:
//!
//! - `marketplace-signing`: the `VaultEntry` the sidecar signs with. Written
//!   only, never read back into the signing session.
//! - `marketplace-signing-session`: the remembered decrypted key for durable
//!   unlock durations (see `session`).

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::codec::{decode_base64, encode_base64};
use crate::key_store::write_private_file;
use crate::types::{IdentityError, Result};

/// Service name of the sidecar's signing key entry
pub const VAULT_SERVICE: &str = "marketplace-signing";

/// Service name of the remembered unlock key
pub const SESSION_KEY_SERVICE: &str = "marketplace-signing-session";

// =============================================================================
// Vault Entry
// =============================================================================

/// The signing key copy handed to the sidecar.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct VaultEntry {
    pub service: String,

    /// PKCS8 private key (base64, sensitive)
    pub private_key: String,

    pub public_key: String,

    pub public_key_hash: String,

    #[zeroize(skip)]
    pub synced_at: DateTime<Utc>,
}

impl VaultEntry {
    pub fn new(
        private_key: &[u8],
        public_key: &str,
        public_key_hash: &str,
        synced_at: DateTime<Utc>,
    ) -> Self {
        Self {
            service: VAULT_SERVICE.to_string(),
            private_key: encode_base64(private_key),
            public_key: public_key.to_string(),
            public_key_hash: public_key_hash.to_string(),
            synced_at,
        }
    }

    /// Decoded private key bytes, for the consumer of the entry.
    pub fn private_key_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        decode_base64(&self.private_key)
            .map(Zeroizing::new)
            .map_err(|e| IdentityError::Storage(format!("vault entry key: {e}")))
    }
}

impl fmt::Debug for VaultEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultEntry")
            .field("service", &self.service)
            .field("public_key_hash", &self.public_key_hash)
            .field("synced_at", &self.synced_at)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

// =============================================================================
// Secret Store
// =============================================================================

/// Encrypted key-value collaborator keyed by service name.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, service: &str) -> Result<Option<Zeroizing<String>>>;

    async fn put(&self, service: &str, value: &str) -> Result<()>;

    async fn remove(&self, service: &str) -> Result<()>;

    /// Write (or overwrite) the sidecar's vault entry.
    async fn save_vault_entry(&self, entry: &VaultEntry) -> Result<()> {
        let value = Zeroizing::new(serde_json::to_string(entry)?);
        self.put(&entry.service, &value).await
    }

    async fn load_vault_entry(&self) -> Result<Option<VaultEntry>> {
        match self.get(VAULT_SERVICE).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }
}

/// In-process secret store for tests and embedding.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<BTreeMap<String, Zeroizing<String>>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get(&self, service: &str) -> Result<Option<Zeroizing<String>>> {
        Ok(self.entries.read().await.get(service).cloned())
    }

    async fn put(&self, service: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(service.to_string(), Zeroizing::new(value.to_string()));
        Ok(())
    }

    async fn remove(&self, service: &str) -> Result<()> {
        self.entries.write().await.remove(service);
        Ok(())
    }
}

/// Service → value map, wiped when dropped.
#[derive(Default, Serialize, Deserialize)]
#[serde(transparent)]
struct SecretMap(BTreeMap<String, String>);

impl Drop for SecretMap {
    fn drop(&mut self) {
        for value in self.0.values_mut() {
            value.zeroize();
        }
    }
}

/// Local stand-in for the external vault: one owner-only JSON file.
///
/// Values are stored as given; protection is the file permissions.
pub struct FileSecretStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process
    lock: Mutex<()>,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_map(&self) -> Result<SecretMap> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => {
                let contents = Zeroizing::new(contents);
                Ok(serde_json::from_str(&contents)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SecretMap::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_map(&self, map: &SecretMap) -> Result<()> {
        let contents = Zeroizing::new(serde_json::to_vec_pretty(map)?);
        let path = self.path.clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::task::spawn_blocking(move || write_private_file(&path, &contents)).await??;
        Ok(())
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get(&self, service: &str) -> Result<Option<Zeroizing<String>>> {
        let _guard = self.lock.lock().await;
        let map = self.read_map().await?;
        Ok(map.0.get(service).map(|v| Zeroizing::new(v.clone())))
    }

    async fn put(&self, service: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map().await?;
        map.0.insert(service.to_string(), value.to_string());
        self.write_map(&map).await
    }

    async fn remove(&self, service: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map().await?;
        if let Some(mut old) = map.0.remove(service) {
            old.zeroize();
            self.write_map(&map).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry() -> VaultEntry {
        VaultEntry::new(&[7u8; 48], "cHVibGlj", "abcd", Utc::now())
    }

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemorySecretStore::new();

        tokio_test::block_on(async {
            assert!(store.get("svc").await.unwrap().is_none());

            store.put("svc", "value-1").await.unwrap();
            store.put("svc", "value-2").await.unwrap();
            assert_eq!(store.get("svc").await.unwrap().as_deref().map(String::as_str), Some("value-2"));

            store.remove("svc").await.unwrap();
            assert!(store.get("svc").await.unwrap().is_none());
        });
    }

    #[tokio::test]
    async fn test_vault_entry_slot() {
        let store = MemorySecretStore::new();
        assert!(store.load_vault_entry().await.unwrap().is_none());

        let entry = sample_entry();
        store.save_vault_entry(&entry).await.unwrap();

        let loaded = store.load_vault_entry().await.unwrap().unwrap();
        assert_eq!(loaded.service, VAULT_SERVICE);
        assert_eq!(loaded.public_key_hash, "abcd");
        assert_eq!(*loaded.private_key_bytes().unwrap(), vec![7u8; 48]);

        // Stored under the fixed service name
        assert!(store.get(VAULT_SERVICE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secrets").join("vault.json");

        {
            let store = FileSecretStore::new(&path);
            store.put("a", "1").await.unwrap();
            store.put("b", "2").await.unwrap();
            store.remove("a").await.unwrap();
            // Removing a missing service is a no-op
            store.remove("missing").await.unwrap();
        }

        let reopened = FileSecretStore::new(&path);
        assert!(reopened.get("a").await.unwrap().is_none());
        assert_eq!(reopened.get("b").await.unwrap().as_deref().map(String::as_str), Some("2"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o077, 0);
        }
    }

    #[test]
    fn test_debug_redacts_key() {
        let entry = sample_entry();
        let debug = format!("{:?}", entry);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&entry.private_key));
    }
}
