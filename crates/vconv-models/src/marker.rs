//! Claim and lock marker documents.
//!
//! Both markers are written with a conditional create, so the object's
//! existence is the mutual-exclusion token. The body only carries lease
//! information so a crashed holder can be detected and superseded.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-item, per-attempt claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimMarker {
    /// Source item key
    pub item: String,
    /// Attempt number this marker owns
    pub attempt: u32,
    /// Worker holding the claim
    pub worker_id: String,
    /// When the claim was created
    pub claimed_at: DateTime<Utc>,
    /// Claim is considered abandoned after this instant
    pub lease_expires_at: DateTime<Utc>,
}

impl ClaimMarker {
    pub fn new(
        item: impl Into<String>,
        attempt: u32,
        worker_id: impl Into<String>,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            item: item.into(),
            attempt,
            worker_id: worker_id.into(),
            claimed_at: now,
            lease_expires_at: now + ttl,
        }
    }

    /// Check whether the lease has lapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }

    /// Extend the lease from `now`.
    pub fn renew(&mut self, ttl: Duration, now: DateTime<Utc>) {
        self.lease_expires_at = now + ttl;
    }
}

/// Body of the shared bookkeeping lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockMarker {
    /// Worker holding the lock
    pub owner: String,
    /// Unique token for this acquisition
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockMarker {
    /// Create a marker with a fresh token.
    pub fn new(owner: impl Into<String>, ttl: Duration, now: DateTime<Utc>) -> Self {
        Self {
            owner: owner.into(),
            token: Uuid::new_v4().simple().to_string(),
            acquired_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_lease_expiry_and_renewal() {
        let now = Utc::now();
        let mut claim = ClaimMarker::new("in/a.mp4", 1, "w1", Duration::seconds(30), now);

        assert!(!claim.is_expired(now));
        assert!(claim.is_expired(now + Duration::seconds(30)));

        claim.renew(Duration::seconds(30), now + Duration::seconds(20));
        assert!(!claim.is_expired(now + Duration::seconds(30)));
        assert!(claim.is_expired(now + Duration::seconds(50)));
    }

    #[test]
    fn test_lock_tokens_are_unique() {
        let now = Utc::now();
        let a = LockMarker::new("w1", Duration::seconds(60), now);
        let b = LockMarker::new("w1", Duration::seconds(60), now);
        assert_ne!(a.token, b.token);
        assert!(!a.is_expired(now));
        assert!(a.is_expired(now + Duration::seconds(61)));
    }

    #[test]
    fn test_marker_json_shape() {
        let now = Utc::now();
        let claim = ClaimMarker::new("in/a.mp4", 3, "w1", Duration::seconds(5), now);
        let value = serde_json::to_value(&claim).unwrap();
        assert_eq!(value["item"], "in/a.mp4");
        assert_eq!(value["attempt"], 3);

        let parsed: ClaimMarker = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, claim);
    }
}
