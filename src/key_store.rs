//! Durable storage for the instance key bundle and session record.
//!
//! Both are single-slot records keyed by fixed identifiers. Writes replace
//! the whole record; nothing is ever patched in place.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::bundle::KeyBundle;
use crate::expiring::Expiry;
use crate::session::UnlockDuration;
use crate::types::{IdentityError, Result};

/// Slot identifier for the instance key bundle
pub const INSTANCE_KEY_ID: &str = "instance-key";

/// Slot identifier for the signing session record
pub const SESSION_RECORD_ID: &str = "signing-session";

/// Durable session state: the duration preference and, while unlocked
/// with a durable duration, the unlock deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub unlock_duration: UnlockDuration,

    #[serde(default)]
    pub unlocked_until: Option<Expiry>,
}

impl SessionRecord {
    pub fn locked(unlock_duration: UnlockDuration) -> Self {
        Self {
            unlock_duration,
            unlocked_until: None,
        }
    }
}

/// Persistence for the key bundle and session record.
///
/// Methods may block on disk I/O; async callers run them with
/// `tokio::task::spawn_blocking`.
pub trait KeyStore: Send + Sync {
    fn save_bundle(&self, bundle: &KeyBundle) -> Result<()>;

    /// Load the bundle, rejecting one whose hash does not match its key.
    fn load_bundle(&self) -> Result<Option<KeyBundle>>;

    fn delete_bundle(&self) -> Result<()>;

    /// Whether a bundle exists, without decrypting anything.
    fn has_instance_key(&self) -> Result<bool>;

    fn save_session_record(&self, record: &SessionRecord) -> Result<()>;

    fn load_session_record(&self) -> Result<Option<SessionRecord>>;
}

fn check_bundle(bundle: KeyBundle) -> Result<KeyBundle> {
    if !bundle.verify_hash() {
        return Err(IdentityError::Storage(
            "stored key bundle hash does not match its public key".into(),
        ));
    }
    Ok(bundle)
}

// =============================================================================
// File Store
// =============================================================================

/// JSON files under a data directory, one per slot.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn slot_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn read_slot<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        let path = self.slot_path(id);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_slot<T: Serialize>(&self, id: &str, value: &T) -> Result<()> {
        let path = self.slot_path(id);
        let contents = serde_json::to_vec_pretty(value)?;
        write_private_file(&path, &contents)?;
        debug!(path = %path.display(), "Wrote key store slot");
        Ok(())
    }

    fn delete_slot(&self, id: &str) -> Result<()> {
        match fs::remove_file(self.slot_path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write via a temp file + rename so a crash never leaves half a record.
/// On Unix the file is readable by the owner only.
pub(crate) fn write_private_file(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    // A leftover temp file would keep its old permissions
    match fs::remove_file(&tmp) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
        _ => {}
    }
    {
        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

impl KeyStore for FileKeyStore {
    fn save_bundle(&self, bundle: &KeyBundle) -> Result<()> {
        self.write_slot(INSTANCE_KEY_ID, bundle)
    }

    fn load_bundle(&self) -> Result<Option<KeyBundle>> {
        self.read_slot::<KeyBundle>(INSTANCE_KEY_ID)?
            .map(check_bundle)
            .transpose()
    }

    fn delete_bundle(&self) -> Result<()> {
        self.delete_slot(INSTANCE_KEY_ID)
    }

    fn has_instance_key(&self) -> Result<bool> {
        Ok(self.slot_path(INSTANCE_KEY_ID).is_file())
    }

    fn save_session_record(&self, record: &SessionRecord) -> Result<()> {
        self.write_slot(SESSION_RECORD_ID, record)
    }

    fn load_session_record(&self) -> Result<Option<SessionRecord>> {
        self.read_slot(SESSION_RECORD_ID)
    }
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-process store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryKeyStore {
    bundle: RwLock<Option<KeyBundle>>,
    session: RwLock<Option<SessionRecord>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn save_bundle(&self, bundle: &KeyBundle) -> Result<()> {
        *self.bundle.write().unwrap_or_else(PoisonError::into_inner) = Some(bundle.clone());
        Ok(())
    }

    fn load_bundle(&self) -> Result<Option<KeyBundle>> {
        self.bundle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .map(check_bundle)
            .transpose()
    }

    fn delete_bundle(&self) -> Result<()> {
        *self.bundle.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    fn has_instance_key(&self) -> Result<bool> {
        Ok(self
            .bundle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some())
    }

    fn save_session_record(&self, record: &SessionRecord) -> Result<()> {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(*record);
        Ok(())
    }

    fn load_session_record(&self) -> Result<Option<SessionRecord>> {
        Ok(*self.session.read().unwrap_or_else(PoisonError::into_inner))
    }
}
