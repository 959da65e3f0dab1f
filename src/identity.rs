//! Instance identity lifecycle.
//!
//! Creates, replaces, imports and exports the instance `KeyBundle`. Any
//! operation that replaces the bundle also locks the signing session, so a
//! key decrypted from the old bundle never signs for the new identity.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::bundle::KeyBundle;
use crate::clock::Clock;
use crate::crypto::{encrypt_private_key, generate_keypair};
use crate::key_store::KeyStore;
use crate::session::SigningSession;
use crate::types::{IdentityError, Result};

/// Public half of the instance identity, safe to display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIdentity {
    pub public_key: String,

    /// Instance ID
    pub public_key_hash: String,

    pub created_at: DateTime<Utc>,
}

impl From<&KeyBundle> for PublicIdentity {
    fn from(bundle: &KeyBundle) -> Self {
        Self {
            public_key: bundle.public_key.clone(),
            public_key_hash: bundle.public_key_hash.clone(),
            created_at: bundle.created_at,
        }
    }
}

/// Service for the instance identity.
pub struct IdentityService {
    key_store: Arc<dyn KeyStore>,
    session: Arc<SigningSession>,
    clock: Arc<dyn Clock>,
}

impl IdentityService {
    pub fn new(
        key_store: Arc<dyn KeyStore>,
        session: Arc<SigningSession>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            key_store,
            session,
            clock,
        }
    }

    pub fn session(&self) -> &Arc<SigningSession> {
        &self.session
    }

    pub fn key_store(&self) -> &Arc<dyn KeyStore> {
        &self.key_store
    }

    /// Whether an identity exists. Never decrypts.
    pub fn has_instance_key(&self) -> Result<bool> {
        self.key_store.has_instance_key()
    }

    pub fn public_identity(&self) -> Result<Option<PublicIdentity>> {
        Ok(self.key_store.load_bundle()?.as_ref().map(PublicIdentity::from))
    }

    /// The stored bundle, or `NoInstanceKey`.
    pub fn bundle(&self) -> Result<KeyBundle> {
        self.key_store
            .load_bundle()?
            .ok_or(IdentityError::NoInstanceKey)
    }

    /// Generate the instance identity, protected by `password`.
    ///
    /// Fails with `IdentityExists` if one is already stored; use
    /// `regenerate_identity` to replace it deliberately.
    pub async fn create_identity(&self, password: &str) -> Result<PublicIdentity> {
        if self.key_store.has_instance_key()? {
            return Err(IdentityError::IdentityExists);
        }
        let bundle = self.generate_bundle(password).await?;
        self.save_bundle(&bundle).await?;

        info!(public_key_hash = %bundle.public_key_hash, "Created instance identity");
        Ok(PublicIdentity::from(&bundle))
    }

    /// Replace the identity with a freshly generated one.
    ///
    /// The old private key is gone for good; the marketplace will see a new
    /// instance ID.
    pub async fn regenerate_identity(&self, password: &str) -> Result<PublicIdentity> {
        let bundle = self.generate_bundle(password).await?;
        self.replace_bundle(&bundle).await?;

        info!(public_key_hash = %bundle.public_key_hash, "Regenerated instance identity");
        Ok(PublicIdentity::from(&bundle))
    }

    /// Replace the identity with one from an exported key file.
    ///
    /// The file is validated before anything is written; an invalid file
    /// leaves the current identity in place.
    pub async fn import_key_file(&self, contents: &str) -> Result<PublicIdentity> {
        let bundle = KeyBundle::from_key_file(contents)?;
        self.replace_bundle(&bundle).await?;

        info!(public_key_hash = %bundle.public_key_hash, "Imported instance identity");
        Ok(PublicIdentity::from(&bundle))
    }

    /// Export the stored bundle as a key file. The private key stays
    /// encrypted under the identity password.
    pub fn export_key_file(&self) -> Result<String> {
        let bundle = self.bundle()?;
        debug!(public_key_hash = %bundle.public_key_hash, "Exporting key file");
        bundle.to_key_file()
    }

    async fn generate_bundle(&self, password: &str) -> Result<KeyBundle> {
        let password = Zeroizing::new(password.to_string());
        let created_at = self.clock.now();

        tokio::task::spawn_blocking(move || {
            let key_pair = generate_keypair()?;
            let encrypted = encrypt_private_key(&key_pair.private_key, &password)?;
            Ok::<_, IdentityError>(KeyBundle::new(&key_pair, encrypted, created_at))
        })
        .await?
    }

    async fn save_bundle(&self, bundle: &KeyBundle) -> Result<()> {
        let key_store = self.key_store.clone();
        let bundle = bundle.clone();
        tokio::task::spawn_blocking(move || key_store.save_bundle(&bundle)).await?
    }

    async fn replace_bundle(&self, bundle: &KeyBundle) -> Result<()> {
        self.save_bundle(bundle).await?;
        self.session.lock().await
    }
}
