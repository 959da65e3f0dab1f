//! Cryptographic primitives for instance identity keys.
//!
//! # Algorithms
//!
//! - **Key Generation**: Ed25519, private key exported as PKCS8 DER
//! - **Key Derivation**: PBKDF2-HMAC-SHA256 (600,000 iterations)
//! - **Encryption**: AES-256-GCM (authenticated encryption)
//! - **Signing**: Ed25519 over the canonical JSON form of a payload
//!
//! # Security Parameters
//!
//! The PBKDF2 iteration count is part of the stored bundle format. Bundles
//! carry no parameter version, so lowering it breaks every existing bundle.

use std::fmt;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

use crate::codec::{decode_base64, decode_base64_array, encode_base64, encode_hex, CodecError};
use crate::types::{IdentityError, Result};

// =============================================================================
// Constants
// =============================================================================

/// PBKDF2-HMAC-SHA256 iteration count
pub const PBKDF2_ITERATIONS: u32 = 600_000;

/// Salt length for key derivation (32 bytes)
pub const SALT_LEN: usize = 32;

/// IV length for AES-256-GCM (12 bytes)
pub const IV_LEN: usize = 12;

/// AES-256 key length (32 bytes)
pub const AES_KEY_LEN: usize = 32;

/// AES-GCM auth tag length (16 bytes), appended to the ciphertext
pub const AUTH_TAG_LEN: usize = 16;

/// Raw Ed25519 public key length (32 bytes)
pub const PUBLIC_KEY_LEN: usize = 32;

/// Raw Ed25519 seed length (32 bytes)
pub const SEED_LEN: usize = 32;

/// Ed25519 signature length (64 bytes)
pub const SIGNATURE_LEN: usize = 64;

/// Field excluded from the canonical form of a signed payload
pub const SIGNATURE_FIELD: &str = "signature";

// =============================================================================
// Key Generation
// =============================================================================

/// A freshly generated instance keypair.
pub struct KeyPair {
    /// Raw 32-byte Ed25519 public key (base64)
    pub public_key: String,

    /// PKCS8 DER private key (sensitive, zeroized on drop)
    pub private_key: Zeroizing<Vec<u8>>,

    /// Hex SHA-256 of the raw public key (instance ID)
    pub public_key_hash: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("public_key_hash", &self.public_key_hash)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Generate cryptographically secure random bytes.
///
/// Fails with `CryptoUnsupported` when the OS random source is unavailable.
pub fn generate_random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
        IdentityError::CryptoUnsupported(format!("secure random source unavailable: {e}"))
    })?;
    Ok(bytes)
}

/// Generate a new Ed25519 keypair for this instance.
///
/// The private key is exported as PKCS8 DER, the public key as its raw
/// 32 bytes, and the instance ID is the SHA-256 of those raw bytes.
pub fn generate_keypair() -> Result<KeyPair> {
    let seed = Zeroizing::new(generate_random_bytes::<SEED_LEN>()?);
    let signing_key = SigningKey::from_bytes(&seed);
    let verifying_key = signing_key.verifying_key();

    let document = signing_key.to_pkcs8_der().map_err(|e| {
        IdentityError::CryptoUnsupported(format!("PKCS8 export failed: {e}"))
    })?;

    Ok(KeyPair {
        public_key: encode_base64(verifying_key.as_bytes()),
        private_key: Zeroizing::new(document.as_bytes().to_vec()),
        public_key_hash: public_key_hash(verifying_key.as_bytes()),
    })
}

/// Hex SHA-256 of raw public key bytes.
pub fn public_key_hash(raw_public_key: &[u8]) -> String {
    encode_hex(Sha256::digest(raw_public_key))
}

/// Hex SHA-256 of a base64-encoded raw public key.
pub fn hash_encoded_public_key(public_key: &str) -> std::result::Result<String, CodecError> {
    let raw: [u8; PUBLIC_KEY_LEN] = decode_base64_array(public_key)?;
    Ok(public_key_hash(&raw))
}

/// Rebuild a signing key from PKCS8 DER or a bare 32-byte seed.
fn signing_key_from_private(private_key: &[u8]) -> Result<SigningKey> {
    if private_key.len() == SEED_LEN {
        let mut seed = [0u8; SEED_LEN];
        seed.copy_from_slice(private_key);
        let signing_key = SigningKey::from_bytes(&seed);
        seed.zeroize();
        return Ok(signing_key);
    }

    SigningKey::from_pkcs8_der(private_key)
        .map_err(|_| IdentityError::Internal("Private key is not a valid Ed25519 key".into()))
}

/// Base64 raw public key matching a private key.
pub fn public_key_from_private(private_key: &[u8]) -> Result<String> {
    let signing_key = signing_key_from_private(private_key)?;
    Ok(encode_base64(signing_key.verifying_key().as_bytes()))
}

// =============================================================================
// Key Derivation
// =============================================================================

/// Derive a 256-bit AES key from a password using PBKDF2-HMAC-SHA256.
///
/// Same password + salt always yields the same key.
pub fn derive_aes_key(password: &str, salt: &[u8]) -> Zeroizing<[u8; AES_KEY_LEN]> {
    let mut key = Zeroizing::new([0u8; AES_KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key[..]);
    key
}

// =============================================================================
// Encryption / Decryption
// =============================================================================

/// Ciphertext, IV and salt produced by one encryption call (all base64).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBundle {
    /// AES-256-GCM ciphertext with the auth tag appended
    pub encrypted: String,

    /// 12-byte IV
    pub iv: String,

    /// 32-byte PBKDF2 salt
    pub salt: String,
}

/// Encrypt a private key under a password with a fresh salt and IV.
pub fn encrypt_private_key(private_key: &[u8], password: &str) -> Result<EncryptedBundle> {
    let salt: [u8; SALT_LEN] = generate_random_bytes()?;
    let iv: [u8; IV_LEN] = generate_random_bytes()?;
    encrypt_private_key_with(private_key, password, &salt, &iv)
}

/// Encrypt with caller-supplied salt and IV.
///
/// Deterministic for fixed inputs. A salt/IV pair must never be used twice.
pub fn encrypt_private_key_with(
    private_key: &[u8],
    password: &str,
    salt: &[u8; SALT_LEN],
    iv: &[u8; IV_LEN],
) -> Result<EncryptedBundle> {
    let key = derive_aes_key(password, salt);
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|_| IdentityError::Internal("Invalid AES key length".into()))?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(iv), private_key)
        .map_err(|_| IdentityError::Internal("Encryption failed".into()))?;

    Ok(EncryptedBundle {
        encrypted: encode_base64(&ciphertext),
        iv: encode_base64(iv),
        salt: encode_base64(salt),
    })
}

/// Decrypt and authenticate a private key.
///
/// # Errors
///
/// `WrongPasswordOrTampered` for every failure: wrong password, flipped
/// bytes, truncated fields or bad encoding all look the same to the caller.
pub fn decrypt_private_key(bundle: &EncryptedBundle, password: &str) -> Result<Zeroizing<Vec<u8>>> {
    let salt = decode_base64(&bundle.salt).map_err(|_| IdentityError::WrongPasswordOrTampered)?;
    let iv: [u8; IV_LEN] =
        decode_base64_array(&bundle.iv).map_err(|_| IdentityError::WrongPasswordOrTampered)?;
    let ciphertext =
        decode_base64(&bundle.encrypted).map_err(|_| IdentityError::WrongPasswordOrTampered)?;

    let key = derive_aes_key(password, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|_| IdentityError::Internal("Invalid AES key length".into()))?;

    let plaintext = cipher
        .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
        .map_err(|_| IdentityError::WrongPasswordOrTampered)?;

    Ok(Zeroizing::new(plaintext))
}

// =============================================================================
// Canonical Payloads + Signing
// =============================================================================

/// Canonical form of a payload: top-level `signature` dropped, object keys
/// sorted at every depth, no whitespace.
///
/// The marketplace recomputes exactly this string to verify, so any change
/// here invalidates every signature in flight.
pub fn canonicalize(data: &Value) -> String {
    let mut out = String::new();
    match data {
        Value::Object(map) => write_object(map, Some(SIGNATURE_FIELD), &mut out),
        other => write_value(other, &mut out),
    }
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_object(map, None, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        // Display on a scalar Value is its compact JSON
        scalar => out.push_str(&scalar.to_string()),
    }
}

fn write_object(map: &Map<String, Value>, skip: Option<&str>, out: &mut String) {
    let mut keys: Vec<&String> = map
        .keys()
        .filter(|k| Some(k.as_str()) != skip)
        .collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.into_iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_value(&map[key.as_str()], out);
    }
    out.push('}');
}

/// Sign the canonical form of `data`, returning a base64 Ed25519 signature.
///
/// Ed25519 is deterministic: same key + same canonical payload gives the
/// same signature bytes.
pub fn sign_payload(private_key: &[u8], data: &Value) -> Result<String> {
    let signing_key = signing_key_from_private(private_key)?;
    let canonical = canonicalize(data);
    let signature: Signature = signing_key.sign(canonical.as_bytes());
    Ok(encode_base64(signature.to_bytes()))
}

/// Verify a base64 signature over the canonical form of `data`.
///
/// Malformed keys or signatures simply fail verification.
pub fn verify_payload(public_key: &str, data: &Value, signature: &str) -> bool {
    let Ok(raw_public) = decode_base64_array::<PUBLIC_KEY_LEN>(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&raw_public) else {
        return false;
    };
    let Ok(raw_signature) = decode_base64_array::<SIGNATURE_LEN>(signature) else {
        return false;
    };

    let signature = Signature::from_bytes(&raw_signature);
    verifying_key
        .verify(canonicalize(data).as_bytes(), &signature)
        .is_ok()
}

// =============================================================================
// Tests
// =============================================================================
