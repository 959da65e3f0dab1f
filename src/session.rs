//! Signing session: the time-boxed unlock of the instance private key.
//!
//! # States
//!
//! - `Locked`: no decrypted key in memory.
//! - `Unlocked(expires)`: the decrypted key is cached until `expires`.
//!
//! The only way into `Unlocked` is `unlock` with the right password, or
//! resuming a durable unlock recorded by an earlier process.
//!
//! # Expiry
//!
//! Expiry is enforced on every read, not by a timer, so a process that was
//! suspended past the deadline cannot hand out the key after it resumes.
//! An expired key is dropped (and zeroized) the moment a read notices.
//!
//! # Durable unlock
//!
//! For `day | week | month | forever` the deadline goes to the key store
//! and the decrypted key itself goes to the secret store under
//! `marketplace-signing-session`, so a restarted process resumes without
//! the password. This is a reduced-security "remember me": anyone who can
//! read the secret store before the deadline can sign as this instance.
//! `session` keeps the key in memory only.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::bundle::KeyBundle;
use crate::clock::Clock;
use crate::codec::{decode_base64, encode_base64};
use crate::crypto::{decrypt_private_key, public_key_from_private};
use crate::expiring::{Expiring, Expiry};
use crate::key_store::{KeyStore, SessionRecord};
use crate::vault::{SecretStore, SESSION_KEY_SERVICE};
use crate::types::{IdentityError, Result};

// =============================================================================
// Unlock Duration
// =============================================================================

/// How long an unlock lasts without re-entering the password.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnlockDuration {
    /// Until the process exits; never persisted
    #[default]
    Session,
    Day,
    Week,
    /// 30 days
    Month,
    Forever,
}

impl UnlockDuration {
    pub const ALL: [UnlockDuration; 5] = [
        Self::Session,
        Self::Day,
        Self::Week,
        Self::Month,
        Self::Forever,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
            Self::Forever => "forever",
        }
    }

    /// Wall-clock lifetime of an unlock (`None` for session and forever).
    pub fn lifetime(&self) -> Option<chrono::Duration> {
        match self {
            Self::Session | Self::Forever => None,
            Self::Day => Some(chrono::Duration::days(1)),
            Self::Week => Some(chrono::Duration::days(7)),
            Self::Month => Some(chrono::Duration::days(30)),
        }
    }

    /// Expiry of an unlock that starts at `now`.
    pub fn expiry_from(&self, now: DateTime<Utc>) -> Expiry {
        match self.lifetime() {
            Some(lifetime) => Expiry::At(now + lifetime),
            None => Expiry::Never,
        }
    }

    /// Whether an unlock with this duration outlives the process.
    pub fn is_durable(&self) -> bool {
        !matches!(self, Self::Session)
    }
}

impl fmt::Display for UnlockDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnlockDuration {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                IdentityError::Config(format!(
                    "unknown unlock duration '{s}' (expected session, day, week, month or forever)"
                ))
            })
    }
}

// =============================================================================
// Session
// =============================================================================

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Locked,
    Unlocked { expires: Expiry },
}

impl SessionStatus {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, Self::Unlocked { .. })
    }
}

struct SessionState {
    duration: UnlockDuration,
    key: Expiring<Zeroizing<Vec<u8>>>,
}

/// The process-wide cache of the decrypted instance key.
///
/// Construct one per process and share it by `Arc`. All reads and writes go
/// through one mutex, so an expiry check and the read that follows it are a
/// single step and two keys can never be cached at once.
pub struct SigningSession {
    key_store: Arc<dyn KeyStore>,
    secrets: Arc<dyn SecretStore>,
    clock: Arc<dyn Clock>,
    state: Mutex<SessionState>,
}

impl SigningSession {
    /// Open the session, loading the duration preference and resuming a
    /// durable unlock if one is recorded and still live.
    ///
    /// An unreadable session record or secret store does not prevent
    /// opening: the session starts locked with the default duration and
    /// the next write replaces the bad record.
    pub async fn open(
        key_store: Arc<dyn KeyStore>,
        secrets: Arc<dyn SecretStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let session = Self {
            key_store,
            secrets,
            clock,
            state: Mutex::new(SessionState {
                duration: UnlockDuration::default(),
                key: Expiring::empty(),
            }),
        };

        session.restore().await;
        Ok(session)
    }

    async fn restore(&self) {
        let record = match self.load_session_record().await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Session record unreadable; starting locked");
                None
            }
        };

        let mut state = self.state.lock().await;
        let now = self.clock.now();
        if let Some(record) = record {
            state.duration = record.unlock_duration;
        }

        let recorded_deadline = record.and_then(|r| r.unlocked_until);
        let live_deadline = recorded_deadline
            .filter(|expiry| state.duration.is_durable() && !expiry.is_expired(now));

        if let Some(expires) = live_deadline {
            let remembered = match self.remembered_key().await {
                Some(key) => self.belongs_to_instance(&key).await.then_some(key),
                None => None,
            };
            match remembered {
                Some(key) => {
                    state.key.set(key, expires);
                    info!(duration = %state.duration, "Resumed durable signing session");
                }
                None => warn!("Durable unlock recorded but remembered key is missing or stale"),
            }
        } else if recorded_deadline.is_some() {
            debug!("Discarding expired durable unlock");
        }

        // Rewrites a stale or unreadable record and drops any orphaned remembered key
        if let Err(e) = self.sync_durable(&mut state, now).await {
            warn!(error = %e, "Failed to reconcile durable session state");
        }
    }

    async fn remembered_key(&self) -> Option<Zeroizing<Vec<u8>>> {
        match self.secrets.get(SESSION_KEY_SERVICE).await {
            Ok(Some(encoded)) => decode_base64(&encoded).ok().map(Zeroizing::new),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Remembered unlock key unreadable");
                None
            }
        }
    }

    async fn belongs_to_instance(&self, private_key: &[u8]) -> bool {
        match self.load_bundle().await {
            Ok(Some(bundle)) => public_key_from_private(private_key)
                .map(|public_key| public_key == bundle.public_key)
                .unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                warn!(error = %e, "Key bundle unreadable");
                false
            }
        }
    }

    // Key store access runs on the blocking pool; callers may hold the state mutex.

    async fn load_bundle(&self) -> Result<Option<KeyBundle>> {
        let key_store = self.key_store.clone();
        tokio::task::spawn_blocking(move || key_store.load_bundle()).await?
    }

    async fn load_session_record(&self) -> Result<Option<SessionRecord>> {
        let key_store = self.key_store.clone();
        tokio::task::spawn_blocking(move || key_store.load_session_record()).await?
    }

    async fn save_session_record(&self, record: SessionRecord) -> Result<()> {
        let key_store = self.key_store.clone();
        tokio::task::spawn_blocking(move || key_store.save_session_record(&record)).await?
    }

    /// Make durable storage match the in-memory state: the record always
    /// carries the preference; the deadline and remembered key exist only
    /// while unlocked with a durable duration.
    ///
    /// The record is written after storing the key and before removing it,
    /// so a partial failure never leaves a deadline that a restart would
    /// resume.
    async fn sync_durable(&self, state: &mut SessionState, now: DateTime<Utc>) -> Result<()> {
        let unlocked_until = if state.duration.is_durable() {
            state.key.expiry(now)
        } else {
            None
        };
        let record = SessionRecord {
            unlock_duration: state.duration,
            unlocked_until,
        };

        match (unlocked_until, state.key.get(now)) {
            (Some(_), Some(key)) => {
                let encoded = Zeroizing::new(encode_base64(key.as_slice()));
                self.secrets.put(SESSION_KEY_SERVICE, &encoded).await?;
                self.save_session_record(record).await
            }
            _ => {
                self.save_session_record(record).await?;
                self.secrets.remove(SESSION_KEY_SERVICE).await
            }
        }
    }

    /// Drop an expired key and clear its durable copy.
    async fn observe_expiry(&self, state: &mut SessionState, now: DateTime<Utc>) {
        if state.key.evict_expired(now) {
            info!(duration = %state.duration, "Signing session expired");
            if let Err(e) = self.sync_durable(state, now).await {
                warn!(error = %e, "Failed to clear expired unlock from durable storage");
            }
        }
    }

    /// Decrypt the instance key with `password` and cache it.
    ///
    /// The expiry comes from the duration configured right now. On failure
    /// the session is left as it was.
    ///
    /// # Errors
    ///
    /// - `NoInstanceKey` when no identity exists
    /// - `WrongPasswordOrTampered` when decryption fails, or the decrypted
    ///   key does not belong to the stored public key
    pub async fn unlock(&self, password: &str) -> Result<SessionStatus> {
        self.unlock_with(password, None).await
    }

    /// Like `unlock`, also switching to `duration` once the password is
    /// accepted. A failed unlock leaves the preference untouched.
    pub async fn unlock_with(
        &self,
        password: &str,
        duration: Option<UnlockDuration>,
    ) -> Result<SessionStatus> {
        let mut state = self.state.lock().await;

        let bundle = self
            .load_bundle()
            .await?
            .ok_or(IdentityError::NoInstanceKey)?;

        let password = Zeroizing::new(password.to_string());
        let encrypted = bundle.encrypted_private_key.clone();
        let decrypted =
            tokio::task::spawn_blocking(move || decrypt_private_key(&encrypted, &password))
                .await?;

        let private_key = match decrypted {
            Ok(key) => key,
            Err(e) => {
                warn!(public_key_hash = %bundle.public_key_hash, "Unlock attempt failed");
                return Err(e);
            }
        };

        match public_key_from_private(&private_key) {
            Ok(public_key) if public_key == bundle.public_key => {}
            _ => {
                warn!(
                    public_key_hash = %bundle.public_key_hash,
                    "Decrypted key does not match the instance public key"
                );
                return Err(IdentityError::WrongPasswordOrTampered);
            }
        }

        if let Some(duration) = duration {
            state.duration = duration;
        }

        let now = self.clock.now();
        let expires = state.duration.expiry_from(now);
        state.key.set(private_key, expires);

        if let Err(e) = self.sync_durable(&mut state, now).await {
            warn!(error = %e, "Failed to persist durable unlock; unlock lasts for this process only");
        }

        info!(
            public_key_hash = %bundle.public_key_hash,
            duration = %state.duration,
            "Signing session unlocked"
        );

        Ok(SessionStatus::Unlocked { expires })
    }

    /// Discard the cached key now, including any durable copy.
    ///
    /// The in-memory key is gone even when this returns an error.
    pub async fn lock(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let was_unlocked = state.key.clear();
        self.sync_durable(&mut state, self.clock.now()).await?;

        if was_unlocked {
            info!("Signing session locked");
        }
        Ok(())
    }

    /// Change the duration preference.
    ///
    /// If unlocked, the new duration applies from now: the remaining time
    /// is extended or shortened without asking for the password again. If
    /// durable storage cannot be updated the previous duration and expiry
    /// stay in effect.
    pub async fn set_unlock_duration(&self, duration: UnlockDuration) -> Result<SessionStatus> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        let previous = (state.duration, state.key.expiry(now));

        state.duration = duration;
        let unlocked = state.key.reset_expiry(duration.expiry_from(now), now);

        if let Err(e) = self.sync_durable(&mut state, now).await {
            let (previous_duration, previous_expiry) = previous;
            state.duration = previous_duration;
            if let Some(expiry) = previous_expiry {
                state.key.reset_expiry(expiry, now);
            }
            if let Err(restore_err) = self.sync_durable(&mut state, now).await {
                warn!(error = %restore_err, "Failed to restore durable session state");
            }
            return Err(e);
        }

        info!(duration = %duration, unlocked, "Unlock duration changed");

        Ok(match state.key.expiry(now) {
            Some(expires) => SessionStatus::Unlocked { expires },
            None => SessionStatus::Locked,
        })
    }

    pub async fn unlock_duration(&self) -> UnlockDuration {
        self.state.lock().await.duration
    }

    pub async fn status(&self) -> SessionStatus {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        self.observe_expiry(&mut state, now).await;

        match state.key.expiry(now) {
            Some(expires) => SessionStatus::Unlocked { expires },
            None => SessionStatus::Locked,
        }
    }

    pub async fn is_unlocked(&self) -> bool {
        self.status().await.is_unlocked()
    }

    /// The decrypted private key, or `None` if locked or expired.
    pub async fn cached_private_key(&self) -> Option<Zeroizing<Vec<u8>>> {
        let mut state = self.state.lock().await;
        let now = self.clock.now();
        self.observe_expiry(&mut state, now).await;
        state.key.get(now).cloned()
    }

    /// Like `cached_private_key`, but `SessionLocked` when there is none.
    pub async fn require_private_key(&self) -> Result<Zeroizing<Vec<u8>>> {
        self.cached_private_key()
            .await
            .ok_or(IdentityError::SessionLocked)
    }
}
