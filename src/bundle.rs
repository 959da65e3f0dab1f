//! The durable identity record and its key-file form.
//!
//! A `KeyBundle` is written once at identity setup and replaced wholesale
//! on regenerate/import. The key-file export is the same JSON document, so
//! a bundle exported from one install imports into another unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::decode_base64;
use crate::crypto::{hash_encoded_public_key, EncryptedBundle, KeyPair, IV_LEN, SALT_LEN};
use crate::types::{IdentityError, Result};

/// Top-level fields a key file must carry.
pub const KEY_FILE_FIELDS: [&str; 4] = [
    "publicKey",
    "publicKeyHash",
    "encryptedPrivateKey",
    "createdAt",
];

/// Instance identity as persisted and exported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyBundle {
    /// Raw Ed25519 public key (base64)
    pub public_key: String,

    /// Hex SHA-256 of the raw public key (instance ID)
    pub public_key_hash: String,

    /// Password-encrypted PKCS8 private key
    pub encrypted_private_key: EncryptedBundle,

    /// When the identity was created
    pub created_at: DateTime<Utc>,
}

impl KeyBundle {
    pub fn new(key_pair: &KeyPair, encrypted: EncryptedBundle, created_at: DateTime<Utc>) -> Self {
        Self {
            public_key: key_pair.public_key.clone(),
            public_key_hash: key_pair.public_key_hash.clone(),
            encrypted_private_key: encrypted,
            created_at,
        }
    }

    /// Check that `public_key_hash` is the hash of `public_key`.
    pub fn verify_hash(&self) -> bool {
        hash_encoded_public_key(&self.public_key)
            .map(|hash| hash.eq_ignore_ascii_case(&self.public_key_hash))
            .unwrap_or(false)
    }

    /// Parse and validate an exported key file.
    ///
    /// # Errors
    ///
    /// `InvalidKeyFile` if the document is not JSON, lacks any of the four
    /// top-level fields, has malformed encrypted fields, or carries a hash
    /// that does not match its public key.
    pub fn from_key_file(contents: &str) -> Result<Self> {
        let document: Value = serde_json::from_str(contents)
            .map_err(|e| IdentityError::InvalidKeyFile(format!("not valid JSON: {e}")))?;

        let object = document
            .as_object()
            .ok_or_else(|| IdentityError::InvalidKeyFile("expected a JSON object".into()))?;

        let missing: Vec<&str> = KEY_FILE_FIELDS
            .iter()
            .copied()
            .filter(|field| object.get(*field).map_or(true, Value::is_null))
            .collect();

        if !missing.is_empty() {
            return Err(IdentityError::InvalidKeyFile(format!(
                "missing field(s): {}",
                missing.join(", ")
            )));
        }

        let bundle: KeyBundle = serde_json::from_value(document)
            .map_err(|e| IdentityError::InvalidKeyFile(e.to_string()))?;

        bundle.validate_encrypted_fields()?;

        if !bundle.verify_hash() {
            return Err(IdentityError::InvalidKeyFile(
                "publicKeyHash does not match publicKey".into(),
            ));
        }

        Ok(bundle)
    }

    /// Serialize as a standalone key file.
    pub fn to_key_file(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    fn validate_encrypted_fields(&self) -> Result<()> {
        let encrypted = &self.encrypted_private_key;

        let expect_len = |name: &str, value: &str, len: Option<usize>| -> Result<()> {
            let bytes = decode_base64(value)
                .map_err(|e| IdentityError::InvalidKeyFile(format!("{name}: {e}")))?;
            match len {
                Some(expected) if bytes.len() != expected => Err(IdentityError::InvalidKeyFile(
                    format!("{name}: expected {expected} bytes, got {}", bytes.len()),
                )),
                _ if bytes.is_empty() => {
                    Err(IdentityError::InvalidKeyFile(format!("{name}: empty")))
                }
                _ => Ok(()),
            }
        };

        expect_len("encryptedPrivateKey.encrypted", &encrypted.encrypted, None)?;
        expect_len("encryptedPrivateKey.iv", &encrypted.iv, Some(IV_LEN))?;
        expect_len("encryptedPrivateKey.salt", &encrypted.salt, Some(SALT_LEN))?;
        Ok(())
    }
}
