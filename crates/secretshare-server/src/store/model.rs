use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A stored secret. `ciphertext` holds a serialized [`super::crypto::Envelope`];
/// the remaining fields are plaintext so expiry and burn checks never need
/// to decrypt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecretRecord {
    pub id: String,
    pub ciphertext: String,
    /// Argon2id PHC string. `None` means the secret has no password gate.
    pub password_hash: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
    pub one_time_access: bool,
    pub is_viewed: bool,
    pub owner_id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
}

impl SecretRecord {
    /// Still readable at exactly `expires_at`; expired only after it.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(exp) if now > exp)
    }

    /// A one-time secret that has already been read.
    pub fn is_burned(&self) -> bool {
        self.one_time_access && self.is_viewed
    }

    pub fn has_password(&self) -> bool {
        self.password_hash.is_some()
    }

    pub fn status(&self, now: DateTime<Utc>) -> SecretStatus {
        if self.is_burned() {
            SecretStatus::Viewed
        } else if self.is_expired(now) {
            SecretStatus::Expired
        } else {
            SecretStatus::Active
        }
    }
}

/// Derived at read time, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretStatus {
    Active,
    Viewed,
    Expired,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(one_time: bool, viewed: bool, expires_in: Option<i64>) -> SecretRecord {
        let now = Utc::now();
        SecretRecord {
            id: "abc".into(),
            ciphertext: "{}".into(),
            password_hash: None,
            expires_at: expires_in.map(|s| now + Duration::seconds(s)),
            one_time_access: one_time,
            is_viewed: viewed,
            owner_id: "owner".into(),
            created_at: now,
        }
    }

    #[test]
    fn status_prefers_viewed_over_expired() {
        let now = Utc::now();
        assert_eq!(record(true, true, Some(-10)).status(now), SecretStatus::Viewed);
        assert_eq!(record(true, false, Some(-10)).status(now), SecretStatus::Expired);
        assert_eq!(record(false, true, None).status(now), SecretStatus::Active);
        assert_eq!(record(true, false, Some(3600)).status(now), SecretStatus::Active);
    }

    #[test]
    fn expiry_instant_is_still_live() {
        let r = record(false, false, Some(60));
        let exp = r.expires_at.unwrap();
        assert!(!r.is_expired(exp));
        assert!(r.is_expired(exp + Duration::milliseconds(1)));
    }

    #[test]
    fn viewed_reusable_secret_is_not_burned() {
        assert!(!record(false, true, None).is_burned());
        assert!(record(true, true, None).is_burned());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&SecretStatus::Expired).unwrap(),
            "\"expired\""
        );
    }
}
