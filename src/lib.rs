//! marketplace-identity - instance identity and signing sessions
//!
//! Generates and keeps the Ed25519 keypair that identifies an instance on
//! the marketplace, encrypts the private key at rest under a password, and
//! holds the decrypted key in a time-boxed signing session so privileged
//! requests can be signed without re-prompting.
//!
//! ## Components
//!
//! - **Crypto**: key generation, PBKDF2 + AES-256-GCM key encryption,
//!   canonical-JSON Ed25519 signing
//! - **Key store**: durable key bundle and session record
//! - **Signing session**: the unlocked key with its expiry
//! - **Identity**: create, regenerate, import and export the identity
//! - **Client**: signed marketplace requests and the vault export

pub mod bundle;
pub mod client;
pub mod clock;
pub mod codec;
pub mod config;
pub mod crypto;
pub mod expiring;
pub mod identity;
pub mod key_store;
pub mod session;
pub mod types;
pub mod vault;

pub use bundle::KeyBundle;
pub use client::{MarketplaceClient, MarketplaceConfig, MarketplaceResult};
pub use config::Args;
pub use identity::{IdentityService, PublicIdentity};
pub use key_store::{FileKeyStore, KeyStore, MemoryKeyStore};
pub use session::{SessionStatus, SigningSession, UnlockDuration};
pub use types::{IdentityError, Result};
pub use vault::{FileSecretStore, MemorySecretStore, SecretStore};
