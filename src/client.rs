//! Marketplace signing client.
//!
//! Every outbound marketplace call is a JSON POST whose body carries the
//! instance public key, its hash, a timestamp, a nonce and an Ed25519
//! signature over the canonical form of everything else. The client also
//! owns the one-way export of the unlocked key to the sidecar vault.
//!
//! Requests are never retried. Failures come back as a `MarketplaceResult`
//! with `success: false` rather than as an `Err`, so callers can surface the
//! server's message directly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::bundle::KeyBundle;
use crate::clock::Clock;
use crate::crypto::{hash_encoded_public_key, public_key_from_private, sign_payload, SIGNATURE_FIELD};
use crate::key_store::KeyStore;
use crate::session::{SessionStatus, SigningSession, UnlockDuration};
use crate::types::{IdentityError, Result};
use crate::vault::{SecretStore, VaultEntry};

/// Instance registration endpoint
pub const REGISTER_PATH: &str = "/api/instances/register";

/// Instance profile sync endpoint
pub const PROFILE_PATH: &str = "/api/instances/profile";

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// Configuration
// =============================================================================

/// What the instance reports about itself on registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub name: String,
    pub version: String,
    pub platform: String,
}

impl InstanceMetadata {
    /// Metadata for this build running on this host.
    pub fn for_host(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MarketplaceConfig {
    /// Base URL, e.g. `https://marketplace.example.com`
    pub base_url: String,
    pub request_timeout: Duration,
    pub instance: InstanceMetadata,
}

impl MarketplaceConfig {
    pub fn new(base_url: impl Into<String>, instance: InstanceMetadata) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            instance,
        }
    }

    /// Full URL for an endpoint path.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

// =============================================================================
// Results
// =============================================================================

/// Outcome of a marketplace call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketplaceResult {
    pub success: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Parsed response body, when there was one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Set when the call was refused because the session is locked
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub session_locked: bool,
}

impl MarketplaceResult {
    pub fn ok(data: Option<Value>) -> Self {
        Self {
            success: true,
            data,
            ..Default::default()
        }
    }

    pub fn failed(err: &IdentityError) -> Self {
        Self {
            success: false,
            error: Some(err.to_string()),
            data: None,
            session_locked: matches!(err, IdentityError::SessionLocked),
        }
    }

    fn rejected(message: String, data: Option<Value>) -> Self {
        Self {
            data,
            ..Self::failed(&IdentityError::NetworkOrServer(message))
        }
    }
}

// =============================================================================
// Signed Bodies
// =============================================================================

/// Add identity and replay fields to `body` and sign it.
///
/// Any `publicKey`, `publicKeyHash`, `timestamp`, `nonce` or `signature`
/// already in `body` is replaced.
pub fn build_signed_body(
    private_key: &[u8],
    public_key: &str,
    public_key_hash: &str,
    body: Value,
    now: DateTime<Utc>,
) -> Result<Value> {
    let Value::Object(mut fields) = body else {
        return Err(IdentityError::InvalidRequest(
            "request body must be a JSON object".into(),
        ));
    };

    fields.remove(SIGNATURE_FIELD);
    fields.insert("publicKey".into(), Value::String(public_key.to_string()));
    fields.insert(
        "publicKeyHash".into(),
        Value::String(public_key_hash.to_string()),
    );
    fields.insert(
        "timestamp".into(),
        Value::String(now.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    fields.insert("nonce".into(), Value::String(Uuid::new_v4().to_string()));

    let mut signed = Value::Object(fields);
    let signature = sign_payload(private_key, &signed)?;
    if let Value::Object(fields) = &mut signed {
        fields.insert(SIGNATURE_FIELD.into(), Value::String(signature));
    }
    Ok(signed)
}

fn server_message(body: &Option<Value>) -> Option<String> {
    let object = body.as_ref()?.as_object()?;
    ["error", "message"]
        .iter()
        .find_map(|field| object.get(*field).and_then(Value::as_str))
        .map(str::to_string)
}

// =============================================================================
// Client
// =============================================================================

/// Signs and sends marketplace requests on behalf of the instance.
pub struct MarketplaceClient {
    http: reqwest::Client,
    config: MarketplaceConfig,
    key_store: Arc<dyn KeyStore>,
    session: Arc<SigningSession>,
    secrets: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
}

impl MarketplaceClient {
    pub fn new(
        config: MarketplaceConfig,
        key_store: Arc<dyn KeyStore>,
        session: Arc<SigningSession>,
        secrets: Arc<dyn SecretStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| IdentityError::Config(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            config,
            key_store,
            session,
            secrets,
            clock,
        })
    }

    pub fn config(&self) -> &MarketplaceConfig {
        &self.config
    }

    async fn bundle(&self) -> Result<KeyBundle> {
        let key_store = self.key_store.clone();
        tokio::task::spawn_blocking(move || key_store.load_bundle())
            .await??
            .ok_or(IdentityError::NoInstanceKey)
    }

    /// Register the instance with an explicit key pair.
    ///
    /// Usable before the session is set up, e.g. right after generation.
    pub async fn register_on_marketplace(
        &self,
        private_key: &[u8],
        public_key: &str,
    ) -> MarketplaceResult {
        let public_key_hash = match hash_encoded_public_key(public_key) {
            Ok(hash) => hash,
            Err(e) => {
                return MarketplaceResult::failed(&IdentityError::InvalidRequest(format!(
                    "public key: {e}"
                )))
            }
        };

        let payload = json!({ "instance": self.config.instance });
        let signed = match build_signed_body(
            private_key,
            public_key,
            &public_key_hash,
            payload,
            self.clock.now(),
        ) {
            Ok(signed) => signed,
            Err(e) => return MarketplaceResult::failed(&e),
        };

        info!(
            public_key_hash = %public_key_hash,
            instance = %self.config.instance.name,
            "Registering instance on marketplace"
        );
        self.post_signed(REGISTER_PATH, &signed).await
    }

    /// Register using the unlocked session key and the stored public key.
    pub async fn register(&self) -> MarketplaceResult {
        let private_key = match self.session.require_private_key().await {
            Ok(key) => key,
            Err(e) => return MarketplaceResult::failed(&e),
        };
        match self.bundle().await {
            Ok(bundle) => {
                self.register_on_marketplace(&private_key, &bundle.public_key)
                    .await
            }
            Err(e) => MarketplaceResult::failed(&e),
        }
    }

    /// Sign `body` with the session key without sending it.
    pub async fn sign_request(&self, body: Value) -> Result<Value> {
        let private_key = self.session.require_private_key().await?;
        let bundle = self.bundle().await?;
        build_signed_body(
            &private_key,
            &bundle.public_key,
            &bundle.public_key_hash,
            body,
            self.clock.now(),
        )
    }

    /// Sign `body` and POST it to `path`.
    ///
    /// A locked session fails with `session_locked` set and sends nothing.
    pub async fn signed_marketplace_post(&self, path: &str, body: Value) -> MarketplaceResult {
        match self.sign_request(body).await {
            Ok(signed) => self.post_signed(path, &signed).await,
            Err(e) => {
                debug!(path, error = %e, "Not sending marketplace request");
                MarketplaceResult::failed(&e)
            }
        }
    }

    /// Push the instance profile to the marketplace.
    pub async fn sync_profile(&self, profile: Value) -> MarketplaceResult {
        self.signed_marketplace_post(PROFILE_PATH, profile).await
    }

    async fn post_signed(&self, path: &str, body: &Value) -> MarketplaceResult {
        let url = self.config.endpoint(path);

        let response = match self
            .http
            .post(&url)
            .json(body)
            .timeout(self.config.request_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Marketplace request failed");
                return MarketplaceResult::failed(&IdentityError::NetworkOrServer(format!(
                    "Network error: {e}"
                )));
            }
        };

        let status = response.status();
        let data: Option<Value> = match response.text().await {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text).ok(),
            _ => None,
        };

        if !status.is_success() {
            let message = server_message(&data).unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
            warn!(url = %url, status = status.as_u16(), error = %message, "Marketplace rejected request");
            return MarketplaceResult::rejected(message, data);
        }

        let declined = data
            .as_ref()
            .and_then(|d| d.get("success"))
            .and_then(Value::as_bool)
            == Some(false);
        if declined {
            let message = server_message(&data).unwrap_or_else(|| "request declined".to_string());
            warn!(url = %url, error = %message, "Marketplace declined request");
            return MarketplaceResult::rejected(message, data);
        }

        info!(url = %url, status = status.as_u16(), "Marketplace request succeeded");
        MarketplaceResult::ok(data)
    }

    /// Write the signing key to the sidecar vault.
    ///
    /// Uses `private_key` when given, otherwise the unlocked session key.
    ///
    /// # Errors
    ///
    /// - `SessionLocked` when no key is given and the session is locked
    /// - `NoInstanceKey` when there is no stored identity
    /// - `InvalidRequest` when the key does not belong to the stored identity
    pub async fn persist_key_to_vault(&self, private_key: Option<&[u8]>) -> Result<()> {
        let private_key = match private_key {
            Some(key) => Zeroizing::new(key.to_vec()),
            None => self.session.require_private_key().await?,
        };
        let bundle = self.bundle().await?;

        let matches = public_key_from_private(&private_key)
            .map(|public_key| public_key == bundle.public_key)
            .unwrap_or(false);
        if !matches {
            return Err(IdentityError::InvalidRequest(
                "private key does not belong to the instance identity".into(),
            ));
        }

        let entry = VaultEntry::new(
            &private_key,
            &bundle.public_key,
            &bundle.public_key_hash,
            self.clock.now(),
        );
        self.secrets.save_vault_entry(&entry).await?;

        info!(public_key_hash = %bundle.public_key_hash, "Exported signing key to vault");
        Ok(())
    }

    /// Unlock the session, then export the key to the vault.
    ///
    /// Export failures are logged and do not fail the unlock.
    pub async fn unlock_and_sync(&self, password: &str) -> Result<SessionStatus> {
        self.unlock_and_sync_with(password, None).await
    }

    /// `unlock_and_sync`, switching to `duration` only if the password is
    /// accepted.
    pub async fn unlock_and_sync_with(
        &self,
        password: &str,
        duration: Option<UnlockDuration>,
    ) -> Result<SessionStatus> {
        let status = self.session.unlock_with(password, duration).await?;

        if let Err(e) = self.persist_key_to_vault(None).await {
            warn!(error = %e, "Vault export after unlock failed");
        }
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::crypto::{generate_keypair, verify_payload};
    use crate::key_store::MemoryKeyStore;
    use crate::vault::MemorySecretStore;

    #[test]
    fn test_endpoint_joining() {
        let instance = InstanceMetadata::for_host("test");
        let config = MarketplaceConfig::new("https://market.example.com/", instance.clone());
        assert_eq!(
            config.endpoint(REGISTER_PATH),
            "https://market.example.com/api/instances/register"
        );

        let config = MarketplaceConfig::new("http://localhost:8080", instance);
        assert_eq!(
            config.endpoint("api/x"),
            "http://localhost:8080/api/x"
        );
    }

    #[test]
    fn test_signed_body_verifies() {
        let pair = generate_keypair().unwrap();
        let body = json!({ "listing": { "title": "Widget", "price": 12 }, "tags": ["a", "b"] });

        let signed = build_signed_body(
            &pair.private_key,
            &pair.public_key,
            &pair.public_key_hash,
            body,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(signed["publicKey"], pair.public_key.as_str());
        assert_eq!(signed["publicKeyHash"], pair.public_key_hash.as_str());
        assert!(signed["timestamp"].as_str().unwrap().ends_with('Z'));
        assert!(Uuid::parse_str(signed["nonce"].as_str().unwrap()).is_ok());

        let signature = signed["signature"].as_str().unwrap();
        assert!(verify_payload(&pair.public_key, &signed, signature));

        // Any change to the body breaks the signature
        let mut tampered = signed.clone();
        tampered["listing"]["price"] = json!(1);
        assert!(!verify_payload(&pair.public_key, &tampered, signature));
    }

    #[test]
    fn test_signed_body_replaces_caller_identity_fields() {
        let pair = generate_keypair().unwrap();
        let body = json!({
            "publicKey": "spoofed",
            "signature": "stale",
            "nonce": "reused",
        });

        let signed = build_signed_body(
            &pair.private_key,
            &pair.public_key,
            &pair.public_key_hash,
            body,
            Utc::now(),
        )
        .unwrap();

        assert_eq!(signed["publicKey"], pair.public_key.as_str());
        assert_ne!(signed["nonce"], "reused");
        assert!(verify_payload(
            &pair.public_key,
            &signed,
            signed["signature"].as_str().unwrap()
        ));
    }

    #[test]
    fn test_nonces_are_unique() {
        let pair = generate_keypair().unwrap();
        let now = Utc::now();
        let sign = || {
            build_signed_body(&pair.private_key, &pair.public_key, &pair.public_key_hash, json!({}), now)
                .unwrap()
        };
        assert_ne!(sign()["nonce"], sign()["nonce"]);
    }

    #[test]
    fn test_signed_body_must_be_object() {
        let pair = generate_keypair().unwrap();
        let result = build_signed_body(
            &pair.private_key,
            &pair.public_key,
            &pair.public_key_hash,
            json!([1, 2]),
            Utc::now(),
        );
        assert!(matches!(result, Err(IdentityError::InvalidRequest(_))));
    }

    #[test]
    fn test_server_message() {
        assert_eq!(
            server_message(&Some(json!({ "error": "bad nonce" }))).as_deref(),
            Some("bad nonce")
        );
        assert_eq!(
            server_message(&Some(json!({ "message": "slow down" }))).as_deref(),
            Some("slow down")
        );
        assert_eq!(server_message(&Some(json!({ "error": 42 }))), None);
        assert_eq!(server_message(&None), None);
    }

    #[test]
    fn test_result_serialization() {
        let locked = MarketplaceResult::failed(&IdentityError::SessionLocked);
        let json = serde_json::to_value(&locked).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["sessionLocked"], true);
        assert!(json["error"].as_str().unwrap().contains("locked"));

        let ok = serde_json::to_value(MarketplaceResult::ok(None)).unwrap();
        assert_eq!(ok, json!({ "success": true }));
    }

    #[tokio::test]
    async fn test_locked_session_sends_nothing() {
        let key_store: Arc<dyn KeyStore> = Arc::new(MemoryKeyStore::new());
        let secrets: Arc<dyn SecretStore> = Arc::new(MemorySecretStore::new());
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let session = Arc::new(
            SigningSession::open(key_store.clone(), secrets.clone(), clock.clone())
                .await
                .unwrap(),
        );

        // Unroutable: any attempt to send would fail with a network error
        let config = MarketplaceConfig::new("http://127.0.0.1:1", InstanceMetadata::for_host("t"));
        let client = MarketplaceClient::new(config, key_store, session, secrets.clone(), clock).unwrap();

        let result = client.signed_marketplace_post("/api/anything", json!({})).await;
        assert!(!result.success);
        assert!(result.session_locked);

        let result = client.register().await;
        assert!(result.session_locked);

        assert!(matches!(
            client.persist_key_to_vault(None).await,
            Err(IdentityError::SessionLocked)
        ));
        assert!(secrets.load_vault_entry().await.unwrap().is_none());
    }
}
