//! Records persisted by the vault.
//!
//! A `DataKey` (DEK) is 32 random bytes encrypted under one KEK version.
//! It may encrypt at most `max_counter` values before `finish_ts`, and
//! stays valid for decryption forever.  A `DataToken` maps an opaque
//! token string to one encrypted value.

use chrono::{DateTime, SecondsFormat, Utc};

/// What a data key is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// Encrypts tokenized values; bounded by `max_counter`.
    Data,
    /// Wraps an HMAC key; `max_counter` is 0 (not bounded by count).
    Hmac,
}

/// A stored data encryption key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataKey {
    pub id: i64,
    /// Key material, AES-ECB encrypted under `kek_version`, base64.
    pub dek_crypted: String,
    pub kek_version: i32,
    pub start_ts: DateTime<Utc>,
    pub finish_ts: DateTime<Utc>,
    pub counter: i64,
    pub max_counter: i64,
}

impl DataKey {
    /// Usable for new encryption at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        (self.max_counter == 0 || self.counter < self.max_counter) && self.finish_ts > now
    }

    /// Eligible for the DEK pool: active and bounded by count.
    pub fn is_pool_candidate(&self, now: DateTime<Utc>) -> bool {
        self.max_counter > 0 && self.is_active(now)
    }

    /// Uses left before the count limit is hit.
    pub fn remaining_uses(&self) -> i64 {
        (self.max_counter - self.counter).max(0)
    }

    pub fn purpose(&self) -> KeyPurpose {
        if self.max_counter == 0 {
            KeyPurpose::Hmac
        } else {
            KeyPurpose::Data
        }
    }
}

/// Fields for a data key that is about to be inserted.
#[derive(Debug, Clone)]
pub struct NewDataKey {
    pub dek_crypted: String,
    pub kek_version: i32,
    pub start_ts: DateTime<Utc>,
    pub finish_ts: DateTime<Utc>,
    pub max_counter: i64,
}

/// Which token table a tokenizer reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenTable {
    /// Card numbers and CVNs.
    DataToken,
    /// Generic secrets.
    SecureVault,
}

impl TokenTable {
    pub fn name(self) -> &'static str {
        match self {
            TokenTable::DataToken => "data_token",
            TokenTable::SecureVault => "secure_vault",
        }
    }
}

/// A stored token record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataToken {
    pub id: i64,
    pub token_string: String,
    pub dek_id: i64,
    pub data_crypted: String,
    pub hmac_version: i32,
    pub hmac_digest: String,
    pub finish_ts: DateTime<Utc>,
}

/// Fields for a token record that is about to be inserted.
#[derive(Debug, Clone)]
pub struct NewDataToken {
    pub token_string: String,
    pub data_crypted: String,
    pub hmac_version: i32,
    pub hmac_digest: String,
    pub finish_ts: DateTime<Utc>,
}

/// Summary of the DEK pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DekPoolStatus {
    /// All data keys ever created.
    pub total_count: i64,
    /// Data keys currently usable for encryption.
    pub active_count: i64,
    /// Remaining uses summed over active keys.
    pub use_count: i64,
}

/// Timestamp text as stored in the database.
///
/// Fixed width (microseconds, `Z` suffix) so that string comparison in
/// SQL matches time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by `format_ts`.
pub fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, SubsecRound};

    fn key(counter: i64, max_counter: i64, ttl: Duration) -> DataKey {
        let now = Utc::now();
        DataKey {
            id: 1,
            dek_crypted: String::new(),
            kek_version: 1,
            start_ts: now,
            finish_ts: now + ttl,
            counter,
            max_counter,
        }
    }

    #[test]
    fn active_requires_headroom_and_future_expiry() {
        let now = Utc::now();
        assert!(key(0, 10, Duration::hours(1)).is_active(now));
        assert!(!key(10, 10, Duration::hours(1)).is_active(now));
        assert!(!key(0, 10, Duration::hours(-1)).is_active(now));
    }

    #[test]
    fn hmac_keys_are_unbounded_but_not_pool_candidates() {
        let now = Utc::now();
        let hk = key(5, 0, Duration::days(300));
        assert!(hk.is_active(now));
        assert!(!hk.is_pool_candidate(now));
        assert_eq!(hk.purpose(), KeyPurpose::Hmac);
    }

    #[test]
    fn remaining_uses_never_negative() {
        assert_eq!(key(3, 10, Duration::hours(1)).remaining_uses(), 7);
        assert_eq!(key(12, 10, Duration::hours(1)).remaining_uses(), 0);
    }

    #[test]
    fn formatted_timestamps_sort_in_time_order() {
        let a = Utc::now();
        let b = a + Duration::microseconds(1);
        let c = a + Duration::days(400);
        assert!(format_ts(a) < format_ts(b));
        assert!(format_ts(b) < format_ts(c));
        assert_eq!(parse_ts(&format_ts(a)).unwrap(), a.trunc_subsecs(6));
    }
}
