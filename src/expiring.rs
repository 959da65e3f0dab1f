//! A cached value with an expiry deadline.
//!
//! Expiry is checked on every read. An expired value is dropped at the
//! moment the read observes it, so anything that zeroizes on drop (the
//! decrypted signing key) is wiped then rather than whenever the next
//! cleanup runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// When a cached value stops being usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "at")]
pub enum Expiry {
    At(DateTime<Utc>),
    Never,
}

impl Expiry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::At(deadline) => now >= *deadline,
            Self::Never => false,
        }
    }

    /// Time left before expiry (`None` for `Never`).
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        match self {
            Self::At(deadline) => Some((*deadline - now).max(chrono::Duration::zero())),
            Self::Never => None,
        }
    }
}

/// A value that is only readable until its expiry.
#[derive(Debug)]
pub struct Expiring<T> {
    value: Option<T>,
    expiry: Expiry,
}

impl<T> Expiring<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            expiry: Expiry::Never,
        }
    }

    /// Store a value, dropping whatever was held before.
    pub fn set(&mut self, value: T, expiry: Expiry) {
        self.value = Some(value);
        self.expiry = expiry;
    }

    /// Read the value, discarding it first if it has expired.
    pub fn get(&mut self, now: DateTime<Utc>) -> Option<&T> {
        self.evict_expired(now);
        self.value.as_ref()
    }

    /// The expiry of the live value, if there is one.
    pub fn expiry(&mut self, now: DateTime<Utc>) -> Option<Expiry> {
        self.evict_expired(now);
        self.value.as_ref().map(|_| self.expiry)
    }

    /// Replace the deadline of a live value. Returns false when empty.
    pub fn reset_expiry(&mut self, expiry: Expiry, now: DateTime<Utc>) -> bool {
        self.evict_expired(now);
        if self.value.is_none() {
            return false;
        }
        self.expiry = expiry;
        true
    }

    /// Drop the value. Returns true if one was held.
    pub fn clear(&mut self) -> bool {
        self.expiry = Expiry::Never;
        self.value.take().is_some()
    }

    /// Drop the value if its deadline has passed. Returns true if it was dropped.
    pub fn evict_expired(&mut self, now: DateTime<Utc>) -> bool {
        if self.value.is_some() && self.expiry.is_expired(now) {
            return self.clear();
        }
        false
    }
}

impl<T> Default for Expiring<T> {
    fn default() -> Self {
        Self::empty()
    }
}
