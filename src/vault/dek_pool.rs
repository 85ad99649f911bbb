//! The pool of data encryption keys (DEKs).
//!
//! Many processes draw DEKs from the same `data_key` table.  Selection is
//! optimistic: pick a random key from a cached list of active keys, then
//! re-read it under the database write lock and start over if another
//! caller used it up in the meantime.  The use itself is recorded later,
//! in the same transaction that stores the token
//! (`Store::insert_token_using_key`).

use chrono::{Duration, Utc};
use rand::Rng;
use tracing::{debug, info};

use crate::config::DekSettings;
use crate::crypto::keys::wrap_key;
use crate::crypto::SecretKey;
use crate::errors::Result;

use super::model::{DataKey, DekPoolStatus, KeyPurpose, NewDataKey};
use super::store::Store;

/// Lifetime of an HMAC-purpose key.
pub const HMAC_KEY_LIFETIME_DAYS: i64 = 366;

/// Creates and hands out DEKs wrapped under one KEK version.
pub struct DekPool {
    settings: DekSettings,
    kek_version: i32,
    master_key: SecretKey,
    /// Active keys as of the last fill; may be stale.
    active: Vec<DataKey>,
}

impl DekPool {
    /// A pool with an empty cache.  Fails on limits that cannot work,
    /// such as a zero `use_count`.
    pub fn new(settings: DekSettings, kek_version: i32, master_key: SecretKey) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            kek_version,
            master_key,
            active: Vec::new(),
        })
    }

    /// KEK version new keys are wrapped under.
    pub fn kek_version(&self) -> i32 {
        self.kek_version
    }

    /// Key counts and headroom, read from the database.
    pub fn get_status(&self, store: &Store) -> Result<DekPoolStatus> {
        let (active_count, use_count) = store.active_headroom(Utc::now())?;
        Ok(DekPoolStatus {
            total_count: store.count_data_keys()?,
            active_count,
            use_count,
        })
    }

    /// Create, wrap and store one new key.
    pub fn generate_new_data_key(&self, store: &Store, purpose: KeyPurpose) -> Result<DataKey> {
        let dek = SecretKey::generate();
        let start_ts = Utc::now();
        let (max_counter, finish_ts) = match purpose {
            KeyPurpose::Data => (
                self.settings.use_count,
                start_ts + Duration::days(self.settings.usage_period_days),
            ),
            KeyPurpose::Hmac => (0, start_ts + Duration::days(HMAC_KEY_LIFETIME_DAYS)),
        };

        let key = store.insert_data_key(&NewDataKey {
            dek_crypted: wrap_key(&self.master_key, &dek)?,
            kek_version: self.kek_version,
            start_ts,
            finish_ts,
            max_counter,
        })?;
        info!(id = key.id, kek_version = self.kek_version, ?purpose, "generated data key");
        Ok(key)
    }

    /// Top the pool up until the headroom reaches `min_active_limit`,
    /// then reload the cached active list.  Returns how many keys were
    /// created.
    pub fn generate_enough_deks(&mut self, store: &Store) -> Result<i64> {
        let status = self.get_status(store)?;

        let missing = self.settings.min_active_limit - status.use_count;
        let mut needed = if missing > 0 {
            (missing + self.settings.use_count - 1) / self.settings.use_count
        } else {
            0
        };
        // Something must be selectable even with a zero limit.
        if status.active_count == 0 {
            needed = needed.max(1);
        }

        for _ in 0..needed {
            self.generate_new_data_key(store, KeyPurpose::Data)?;
        }
        if needed > 0 {
            debug!(created = needed, headroom = status.use_count, "DEK pool topped up");
        }

        self.active = store.active_data_keys(Utc::now())?;
        Ok(needed)
    }

    /// Pick a DEK that may encrypt one more value.
    ///
    /// Loops until a candidate survives the locked re-read; a candidate
    /// that turns out exhausted or expired is dropped from the cache.
    pub fn get_active_data_key(&mut self, store: &mut Store) -> Result<DataKey> {
        loop {
            let cached_headroom: i64 = self.active.iter().map(DataKey::remaining_uses).sum();
            if self.active.is_empty() || cached_headroom < self.settings.min_active_limit {
                self.generate_enough_deks(store)?;
            }
            if self.active.is_empty() {
                // Drained by other callers between the top-up and the fill.
                continue;
            }

            let choice = rand::rng().random_range(0..self.active.len());
            let candidate_id = self.active[choice].id;

            match store.lock_data_key(candidate_id)? {
                Some(dek) if dek.is_pool_candidate(Utc::now()) => {
                    debug!(id = dek.id, "selected DEK");
                    self.active[choice] = dek.clone();
                    return Ok(dek);
                }
                _ => {
                    debug!(id = candidate_id, "candidate DEK is no longer active, trying again");
                    self.active.swap_remove(choice);
                }
            }
        }
    }

    /// Forget a cached key, e.g. after losing the race to record a use.
    pub fn discard(&mut self, id: i64) {
        self.active.retain(|k| k.id != id);
    }
}
