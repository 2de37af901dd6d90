use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// A stored secret. Metadata is plaintext so liveness can be judged
/// (and dead records pruned) without the address.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct SecretRecord {
    #[zeroize(skip)]
    pub created_at: DateTime<Utc>,
    /// Absent means the secret never expires by time.
    #[zeroize(skip)]
    pub expires_at: Option<DateTime<Utc>>,
    pub remaining_views: u32,
    /// Nonce-prefixed ciphertext keyed by the address.
    pub ciphertext: Vec<u8>,
    /// Optimistic-concurrency counter. Owned by the store, which persists it
    /// separately from the payload.
    #[serde(skip)]
    #[zeroize(skip)]
    pub version: u64,
}

/// Liveness of a record at a point in time. Never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretState {
    Fresh,
    Expired,
    Exhausted,
}

impl SecretRecord {
    pub fn new(
        created_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        remaining_views: u32,
        ciphertext: Vec<u8>,
    ) -> Self {
        Self {
            created_at,
            expires_at,
            remaining_views,
            ciphertext,
            version: 0,
        }
    }

    /// Expiry wins over exhaustion when both hold.
    pub fn state(&self, now: DateTime<Utc>) -> SecretState {
        if let Some(exp) = self.expires_at {
            if now > exp {
                return SecretState::Expired;
            }
        }
        if self.remaining_views == 0 {
            return SecretState::Exhausted;
        }
        SecretState::Fresh
    }

    pub fn is_dead(&self, now: DateTime<Utc>) -> bool {
        self.state(now) != SecretState::Fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn fresh_until_past_expiry() {
        let now = at("2020-02-01T10:10:10Z");
        let rec = SecretRecord::new(now, Some(now + Duration::minutes(10)), 3, vec![]);
        assert_eq!(rec.state(now), SecretState::Fresh);
        // The deadline itself is still servable.
        assert_eq!(rec.state(now + Duration::minutes(10)), SecretState::Fresh);
        assert_eq!(
            rec.state(now + Duration::minutes(10) + Duration::milliseconds(1)),
            SecretState::Expired
        );
    }

    #[test]
    fn no_expiry_never_expires() {
        let now = at("2020-02-01T10:10:10Z");
        let rec = SecretRecord::new(now, None, 1, vec![]);
        assert_eq!(rec.state(now + Duration::days(3650)), SecretState::Fresh);
    }

    #[test]
    fn zero_views_is_exhausted() {
        let now = at("2020-02-01T10:10:10Z");
        let rec = SecretRecord::new(now, None, 0, vec![]);
        assert_eq!(rec.state(now), SecretState::Exhausted);
        assert!(rec.is_dead(now));
    }

    #[test]
    fn expiry_checked_before_exhaustion() {
        let now = at("2020-02-01T10:10:10Z");
        let rec = SecretRecord::new(now, Some(now - Duration::seconds(1)), 0, vec![]);
        assert_eq!(rec.state(now), SecretState::Expired);
    }
}
