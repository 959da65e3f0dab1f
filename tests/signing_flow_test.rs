//! End-to-end identity, unlock and signed request tests against a mock marketplace

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use marketplace_identity::client::InstanceMetadata;
use marketplace_identity::clock::{Clock, SystemClock};
use marketplace_identity::crypto::{generate_keypair, public_key_from_private, verify_payload};
use marketplace_identity::vault::VAULT_SERVICE;
use marketplace_identity::{
    FileKeyStore, FileSecretStore, IdentityError, IdentityService, KeyStore, MarketplaceClient,
    MarketplaceConfig, SecretStore, SigningSession, UnlockDuration,
};

const PASSWORD: &str = "correct horse battery staple";

struct Instance {
    key_store: Arc<dyn KeyStore>,
    secrets: Arc<dyn SecretStore>,
    session: Arc<SigningSession>,
    identity: IdentityService,
    client: MarketplaceClient,
}

/// Open an instance over file stores in `dir`, as a fresh process would.
async fn open_instance(dir: &Path, marketplace_url: &str) -> Instance {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let key_store: Arc<dyn KeyStore> = Arc::new(FileKeyStore::open(dir).unwrap());
    let secrets: Arc<dyn SecretStore> = Arc::new(FileSecretStore::new(dir.join("vault.json")));
    let session = Arc::new(
        SigningSession::open(key_store.clone(), secrets.clone(), clock.clone())
            .await
            .unwrap(),
    );
    let identity = IdentityService::new(key_store.clone(), session.clone(), clock.clone());

    let mut config = MarketplaceConfig::new(
        marketplace_url,
        InstanceMetadata::for_host("test-instance"),
    );
    config.request_timeout = Duration::from_secs(5);
    let client = MarketplaceClient::new(
        config,
        key_store.clone(),
        session.clone(),
        secrets.clone(),
        clock,
    )
    .unwrap();

    Instance {
        key_store,
        secrets,
        session,
        identity,
        client,
    }
}

async fn received_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

#[tokio::test]
async fn test_signed_post_verifies_against_saved_key() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/listings"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "success": true, "id": "l-1" })),
        )
        .mount(&server)
        .await;

    // Generate, encrypt and save, then drop everything
    {
        let instance = open_instance(dir.path(), &server.uri()).await;
        instance.identity.create_identity(PASSWORD).await.unwrap();
    }

    // Reload as a new process
    let instance = open_instance(dir.path(), &server.uri()).await;
    let saved = instance.key_store.load_bundle().unwrap().unwrap();

    // Locked: nothing is sent
    let locked = instance
        .client
        .signed_marketplace_post("/api/listings", json!({ "title": "Widget" }))
        .await;
    assert!(!locked.success);
    assert!(locked.session_locked);

    // Wrong password fails at unlock
    let wrong = instance.session.unlock("Tr0ub4dor&3").await;
    assert!(matches!(wrong, Err(IdentityError::WrongPasswordOrTampered)));
    assert!(received_bodies(&server).await.is_empty());

    instance.session.unlock(PASSWORD).await.unwrap();
    let result = instance
        .client
        .signed_marketplace_post("/api/listings", json!({ "title": "Widget", "price": 12 }))
        .await;

    assert!(result.success, "unexpected failure: {:?}", result.error);
    assert_eq!(result.data.unwrap()["id"], "l-1");

    let bodies = received_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];

    assert_eq!(body["title"], "Widget");
    assert_eq!(body["publicKey"], saved.public_key.as_str());
    assert_eq!(body["publicKeyHash"], saved.public_key_hash.as_str());
    assert!(body["timestamp"].is_string());
    assert!(body["nonce"].is_string());

    let signature = body["signature"].as_str().unwrap();
    assert!(verify_payload(&saved.public_key, body, signature));
}

#[tokio::test]
async fn test_registration_and_profile_sync() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/instances/register"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "success": true })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/instances/profile"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let instance = open_instance(dir.path(), &server.uri()).await;
    let identity = instance.identity.create_identity(PASSWORD).await.unwrap();
    instance.session.unlock(PASSWORD).await.unwrap();

    let registered = instance.client.register().await;
    assert!(registered.success, "unexpected failure: {:?}", registered.error);

    let synced = instance
        .client
        .sync_profile(json!({ "displayName": "Acme AI", "skills": ["writing", "research"] }))
        .await;
    assert!(synced.success);
    assert!(synced.data.is_none());

    let bodies = received_bodies(&server).await;
    assert_eq!(bodies.len(), 2);

    let registration = &bodies[0];
    assert_eq!(registration["instance"]["name"], "test-instance");
    assert!(registration["instance"]["version"].is_string());
    assert_eq!(registration["publicKeyHash"], identity.public_key_hash.as_str());
    assert!(verify_payload(
        &identity.public_key,
        registration,
        registration["signature"].as_str().unwrap()
    ));

    let profile = &bodies[1];
    assert_eq!(profile["displayName"], "Acme AI");
    assert_ne!(profile["nonce"], registration["nonce"]);
    assert!(verify_payload(
        &identity.public_key,
        profile,
        profile["signature"].as_str().unwrap()
    ));
}

#[tokio::test]
async fn test_register_with_explicit_key() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/instances/register"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .mount(&server)
        .await;

    // No stored identity and no session: the caller supplies the pair
    let instance = open_instance(dir.path(), &server.uri()).await;
    let pair = generate_keypair().unwrap();

    let result = instance
        .client
        .register_on_marketplace(&pair.private_key, &pair.public_key)
        .await;
    assert!(result.success);

    let bodies = received_bodies(&server).await;
    assert_eq!(bodies[0]["publicKeyHash"], pair.public_key_hash.as_str());
    assert!(verify_payload(
        &pair.public_key,
        &bodies[0],
        bodies[0]["signature"].as_str().unwrap()
    ));
}

#[tokio::test]
async fn test_server_failures_are_surfaced() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/rejected"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({ "error": "Invalid signature" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/unavailable"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/declined"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "success": false, "message": "Listing limit reached" })),
        )
        .mount(&server)
        .await;

    let instance = open_instance(dir.path(), &server.uri()).await;
    instance.identity.create_identity(PASSWORD).await.unwrap();
    instance.session.unlock(PASSWORD).await.unwrap();

    let rejected = instance
        .client
        .signed_marketplace_post("/api/rejected", json!({}))
        .await;
    assert!(!rejected.success);
    assert!(!rejected.session_locked);
    assert!(rejected.error.unwrap().contains("Invalid signature"));

    let unavailable = instance
        .client
        .signed_marketplace_post("/api/unavailable", json!({}))
        .await;
    assert!(unavailable.error.unwrap().contains("HTTP 503"));

    let declined = instance
        .client
        .signed_marketplace_post("/api/declined", json!({}))
        .await;
    assert!(!declined.success);
    assert!(declined.error.unwrap().contains("Listing limit reached"));

    // Each request was sent exactly once
    assert_eq!(received_bodies(&server).await.len(), 3);

    // Non-object bodies are refused before signing
    let invalid = instance
        .client
        .signed_marketplace_post("/api/rejected", json!("just a string"))
        .await;
    assert!(!invalid.success);
    assert_eq!(received_bodies(&server).await.len(), 3);
}

#[tokio::test]
async fn test_network_error() {
    let dir = tempfile::tempdir().unwrap();

    // Nothing listens on port 1
    let instance = open_instance(dir.path(), "http://127.0.0.1:1").await;
    instance.identity.create_identity(PASSWORD).await.unwrap();
    instance.session.unlock(PASSWORD).await.unwrap();

    let result = instance
        .client
        .signed_marketplace_post("/api/listings", json!({}))
        .await;
    assert!(!result.success);
    assert!(!result.session_locked);
    assert!(result.error.unwrap().contains("Network error"));
}

#[tokio::test]
async fn test_vault_export_on_unlock() {
    let dir = tempfile::tempdir().unwrap();
    let instance = open_instance(dir.path(), "http://127.0.0.1:1").await;
    let identity = instance.identity.create_identity(PASSWORD).await.unwrap();

    assert!(instance.secrets.load_vault_entry().await.unwrap().is_none());
    instance.client.unlock_and_sync(PASSWORD).await.unwrap();

    let entry = instance.secrets.load_vault_entry().await.unwrap().unwrap();
    assert_eq!(entry.service, VAULT_SERVICE);
    assert_eq!(entry.public_key, identity.public_key);
    assert_eq!(entry.public_key_hash, identity.public_key_hash);
    let private_key = entry.private_key_bytes().unwrap();
    assert_eq!(public_key_from_private(&private_key).unwrap(), identity.public_key);

    // The vault copy is write-only: locking does not touch it, and it never
    // unlocks the session
    instance.session.lock().await.unwrap();
    assert!(instance.secrets.load_vault_entry().await.unwrap().is_some());
    assert!(!instance.session.is_unlocked().await);

    // A key from another identity is refused
    let stranger = generate_keypair().unwrap();
    let result = instance
        .client
        .persist_key_to_vault(Some(stranger.private_key.as_slice()))
        .await;
    assert!(matches!(result, Err(IdentityError::InvalidRequest(_))));
}

#[tokio::test]
async fn test_durable_unlock_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;

    {
        let instance = open_instance(dir.path(), &server.uri()).await;
        instance.identity.create_identity(PASSWORD).await.unwrap();
        instance
            .session
            .set_unlock_duration(UnlockDuration::Week)
            .await
            .unwrap();
        instance.session.unlock(PASSWORD).await.unwrap();
    }

    // Restarted process signs without the password
    {
        let instance = open_instance(dir.path(), &server.uri()).await;
        assert!(instance.session.is_unlocked().await);
        let result = instance
            .client
            .signed_marketplace_post("/api/ping", json!({}))
            .await;
        assert!(result.success);
        instance.session.lock().await.unwrap();
    }

    // After an explicit lock the next process starts locked
    let instance = open_instance(dir.path(), &server.uri()).await;
    assert!(!instance.session.is_unlocked().await);
    assert_eq!(
        instance.session.unlock_duration().await,
        UnlockDuration::Week
    );
}

#[tokio::test]
async fn test_session_unlock_does_not_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let instance = open_instance(dir.path(), "http://127.0.0.1:1").await;
        instance.identity.create_identity(PASSWORD).await.unwrap();
        instance.session.unlock(PASSWORD).await.unwrap();
        assert!(instance.session.is_unlocked().await);
    }

    let instance = open_instance(dir.path(), "http://127.0.0.1:1").await;
    assert!(!instance.session.is_unlocked().await);
}

#[tokio::test]
async fn test_wrong_password_keeps_duration_across_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let instance = open_instance(dir.path(), "http://127.0.0.1:1").await;
        instance.identity.create_identity(PASSWORD).await.unwrap();
        let result = instance
            .client
            .unlock_and_sync_with("Tr0ub4dor&3", Some(UnlockDuration::Forever))
            .await;
        assert!(matches!(result, Err(IdentityError::WrongPasswordOrTampered)));
    }

    let instance = open_instance(dir.path(), "http://127.0.0.1:1").await;
    assert_eq!(
        instance.session.unlock_duration().await,
        UnlockDuration::Session
    );

    instance
        .client
        .unlock_and_sync_with(PASSWORD, Some(UnlockDuration::Day))
        .await
        .unwrap();
    assert_eq!(instance.session.unlock_duration().await, UnlockDuration::Day);

    // Corrupt record from a crash mid-write; the next process still opens
    std::fs::write(dir.path().join("signing-session.json"), "{").unwrap();
    let instance = open_instance(dir.path(), "http://127.0.0.1:1").await;
    assert!(!instance.session.is_unlocked().await);
    instance.session.unlock(PASSWORD).await.unwrap();
}
