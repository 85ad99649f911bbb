//! Versioned master keys and HMAC keys, cached behind one lock.
//!
//! `TokenizerConfig` is owned by whoever hosts the tokenizers and shared
//! with them through an `Arc`.  A reload rebuilds the whole snapshot
//! from the local settings, the `config` table and the key-share source,
//! then swaps it in under the write lock, so readers see either the old
//! snapshot or the new one.
//!
//! Config entries read from the database:
//!
//! | key                          | meaning                              |
//! |------------------------------|--------------------------------------|
//! | `KEK_VERSION`                | active KEK version                   |
//! | `KEK_TARGET_VERSION`         | version being switched to            |
//! | `KEK_VER<v>_PART3`           | share #3 (hex)                       |
//! | `KEK_CONTROL_PHRASE`         | phrase every KEK must encrypt        |
//! | `KEK_VER<v>_CONTROL_CODE`    | expected encryption of the phrase    |
//! | `KEK_VER<v>_PART<n>_CHECK`   | `"1"` once share `n` is confirmed    |
//! | `HMAC_VERSION`               | active HMAC version                  |
//! | `HMAC_VER<v>_ID`             | `data_key.id` holding the HMAC key   |

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use subtle::ConstantTimeEq;
use tracing::{debug, error, info, warn};

use crate::crypto::keys::{assemble_kek, control_code, unwrap_key};
use crate::crypto::SecretKey;
use crate::errors::{CardVaultError, Result};
use crate::vault::Store;

use super::share::KeyShareSource;

/// How long a snapshot is served before the next caller reloads it.
pub const REFRESH_TTL_SECS: i64 = 15;

pub const KEK_VERSION: &str = "KEK_VERSION";
pub const KEK_TARGET_VERSION: &str = "KEK_TARGET_VERSION";
pub const KEK_CONTROL_PHRASE: &str = "KEK_CONTROL_PHRASE";
pub const HMAC_VERSION: &str = "HMAC_VERSION";

/// `KEK_VER<v>_PART<n>`
pub fn kek_part_key(version: i32, part: u8) -> String {
    format!("KEK_VER{version}_PART{part}")
}

/// `KEK_VER<v>_PART<n>_CHECK`
pub fn kek_check_key(version: i32, part: u8) -> String {
    format!("KEK_VER{version}_PART{part}_CHECK")
}

/// `KEK_VER<v>_CONTROL_CODE`
pub fn kek_control_code_key(version: i32) -> String {
    format!("KEK_VER{version}_CONTROL_CODE")
}

/// `HMAC_VER<v>_ID`
pub fn hmac_id_key(version: i32) -> String {
    format!("HMAC_VER{version}_ID")
}

/// Pull `<v>` out of a key shaped `<prefix><v><suffix>`.
pub(crate) fn version_in(key: &str, prefix: &str, suffix: &str) -> Option<i32> {
    key.strip_prefix(prefix)?.strip_suffix(suffix)?.parse().ok()
}

fn parse_version(key: &str, value: &str) -> Result<i32> {
    value.trim().parse().map_err(|_| {
        CardVaultError::ConfigError(format!("{key} is not a version number: '{value}'"))
    })
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Snapshot {
    local_params: BTreeMap<String, String>,
    db_params: BTreeMap<String, String>,
    /// Hex shares per version, index 0..3 for parts 1..3, as used for assembly.
    components: BTreeMap<i32, [Option<String>; 3]>,
    master_keys: BTreeMap<i32, SecretKey>,
    valid: BTreeSet<i32>,
    hmac_keys: BTreeMap<i32, SecretKey>,
    last_refresh: Option<DateTime<Utc>>,
}

impl Snapshot {
    fn db_param(&self, key: &str) -> Result<&str> {
        self.db_params
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| CardVaultError::ConfigKeyMissing(key.to_string()))
    }

    fn db_version(&self, key: &str) -> Result<i32> {
        parse_version(key, self.db_param(key)?)
    }

    fn master_key(&self, version: i32, valid_only: bool) -> Result<SecretKey> {
        match self.master_keys.get(&version) {
            Some(key) if !valid_only || self.valid.contains(&version) => Ok(key.clone()),
            _ => Err(CardVaultError::KeyVersionNotFound(format!(
                "master key ver{version}"
            ))),
        }
    }

    fn hmac_key(&self, version: i32) -> Result<SecretKey> {
        self.hmac_keys
            .get(&version)
            .cloned()
            .ok_or_else(|| CardVaultError::KeyVersionNotFound(format!("HMAC key ver{version}")))
    }

    fn is_part_checked(&self, version: i32, part: u8) -> bool {
        self.db_params
            .get(&kek_check_key(version, part))
            .is_some_and(|v| v == "1")
    }
}

// ---------------------------------------------------------------------------
// TokenizerConfig
// ---------------------------------------------------------------------------

/// Cached key configuration shared by all tokenizers of a process.
pub struct TokenizerConfig {
    local_params: BTreeMap<String, String>,
    shares: Mutex<Box<dyn KeyShareSource>>,
    snapshot: RwLock<Snapshot>,
}

impl TokenizerConfig {
    /// An empty config; nothing is loaded until `reload` or `refresh`.
    ///
    /// `local_params` are the `[key_settings]` items (share #2 per version).
    pub fn new(local_params: BTreeMap<String, String>, shares: Box<dyn KeyShareSource>) -> Self {
        Self {
            local_params,
            shares: Mutex::new(shares),
            snapshot: RwLock::new(Snapshot::default()),
        }
    }

    /// Build a config and load it from `store` right away.
    pub fn load(
        store: &Store,
        local_params: BTreeMap<String, String>,
        shares: Box<dyn KeyShareSource>,
    ) -> Result<Self> {
        let config = Self::new(local_params, shares);
        config.reload(store)?;
        Ok(config)
    }

    // ------------------------------------------------------------------
    // Reload
    // ------------------------------------------------------------------

    /// Rebuild the snapshot from scratch and swap it in.
    ///
    /// A version whose master key or HMAC key cannot be built is logged
    /// and left out; only failing to read the `config` table is an error.
    pub fn reload(&self, store: &Store) -> Result<()> {
        info!("reloading key configuration");
        let db_params = store.config_params()?;

        let mut next = Snapshot {
            local_params: self.local_params.clone(),
            db_params,
            ..Snapshot::default()
        };
        self.assemble_master_keys(&mut next);
        check_master_keys(&mut next);
        load_hmac_keys(store, &mut next);
        next.last_refresh = Some(Utc::now());

        *self.snapshot.write() = next;
        Ok(())
    }

    /// Reload when the snapshot is older than the TTL, never loaded, or
    /// `force` is set.  Returns whether a reload happened.
    pub fn refresh(&self, store: &Store, force: bool) -> Result<bool> {
        let stale = match self.snapshot.read().last_refresh {
            Some(ts) => Utc::now() - ts > Duration::seconds(REFRESH_TTL_SECS),
            None => true,
        };
        if force || stale {
            self.reload(store)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Hand share #1 of `version` to the key-share source.
    pub fn put_share(&self, version: i32, share_hex: &str) -> Result<()> {
        self.shares.lock().put_key_by_version(version, share_hex)
    }

    fn assemble_master_keys(&self, next: &mut Snapshot) {
        let versions: BTreeSet<i32> = next
            .db_params
            .keys()
            .filter_map(|k| version_in(k, "KEK_VER", "_PART3"))
            .chain(
                next.local_params
                    .keys()
                    .filter_map(|k| version_in(k, "KEK_VER", "_PART2")),
            )
            .collect();

        let mut shares = self.shares.lock();
        for version in versions {
            debug!(version, "assembling master key");
            let slots = next.components.entry(version).or_default();

            slots[2] = next.db_params.get(&kek_part_key(version, 3)).cloned();
            slots[1] = next.local_params.get(&kek_part_key(version, 2)).cloned();
            slots[0] = match shares.get_key_by_version(version) {
                Ok(hex) => Some(hex),
                Err(e) => {
                    error!(version, error = %e, "fetching KEK share #1 failed");
                    None
                }
            };

            let assembled = match (&slots[0], &slots[1], &slots[2]) {
                (Some(p1), Some(p2), Some(p3)) => assemble_kek(p1, p2, p3),
                (_, None, _) => Err(CardVaultError::ConfigKeyMissing(kek_part_key(version, 2))),
                (_, _, None) => Err(CardVaultError::ConfigKeyMissing(kek_part_key(version, 3))),
                (None, _, _) => Err(CardVaultError::ConnectivityError(format!(
                    "{} unavailable",
                    kek_part_key(version, 1)
                ))),
            };
            match assembled {
                Ok(key) => {
                    next.master_keys.insert(version, key);
                    info!(version, "master key assembled");
                }
                Err(e) => error!(version, error = %e, "assembling master key failed"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Plain parameters
    // ------------------------------------------------------------------

    /// An item from the local `[key_settings]`.
    pub fn get_local_param(&self, key: &str) -> Result<String> {
        self.snapshot
            .read()
            .local_params
            .get(key)
            .cloned()
            .ok_or_else(|| CardVaultError::ConfigKeyMissing(key.to_string()))
    }

    /// An entry of the `config` table as of the last reload.
    pub fn get_db_param(&self, key: &str) -> Result<String> {
        self.snapshot.read().db_param(key).map(str::to_string)
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.snapshot.read().last_refresh
    }

    // ------------------------------------------------------------------
    // Master keys
    // ------------------------------------------------------------------

    pub fn get_active_master_key_version(&self) -> Result<i32> {
        self.snapshot.read().db_version(KEK_VERSION)
    }

    /// Master key of `version`.  With `valid_only`, a key that failed the
    /// control-code check counts as missing.
    pub fn get_master_key(&self, version: i32, valid_only: bool) -> Result<SecretKey> {
        self.snapshot.read().master_key(version, valid_only)
    }

    pub fn get_active_master_key(&self, valid_only: bool) -> Result<SecretKey> {
        let snap = self.snapshot.read();
        let version = snap.db_version(KEK_VERSION)?;
        snap.master_key(version, valid_only)
    }

    pub fn get_master_keys(&self, valid_only: bool) -> BTreeMap<i32, SecretKey> {
        let snap = self.snapshot.read();
        snap.master_keys
            .iter()
            .filter(|(v, _)| !valid_only || snap.valid.contains(v))
            .map(|(v, k)| (*v, k.clone()))
            .collect()
    }

    /// The hex share `part` (1 remote, 2 local, 3 database) of `version`.
    pub fn get_master_key_component(&self, version: i32, part: u8) -> Result<String> {
        if !(1..=3).contains(&part) {
            return Err(CardVaultError::InvalidInput(format!(
                "KEK part must be 1, 2 or 3 (got {part})"
            )));
        }
        self.snapshot
            .read()
            .components
            .get(&version)
            .and_then(|slots| slots[usize::from(part) - 1].clone())
            .ok_or_else(|| {
                CardVaultError::KeyVersionNotFound(format!("KEK ver{version} part{part}"))
            })
    }

    pub fn get_current_version(&self) -> Result<i32> {
        self.get_active_master_key_version()
    }

    /// Version being switched to, if a switch is under way.
    pub fn get_switch_version(&self) -> Result<Option<i32>> {
        let snap = self.snapshot.read();
        match snap.db_params.get(KEK_TARGET_VERSION) {
            Some(value) => parse_version(KEK_TARGET_VERSION, value).map(Some),
            None => Ok(None),
        }
    }

    /// Highest version that has any share.
    pub fn get_last_version(&self) -> Option<i32> {
        self.snapshot.read().components.keys().next_back().copied()
    }

    /// Known versions, ascending.  Without `include_incomplete`, only
    /// versions whose master key assembled.
    pub fn get_versions(&self, include_incomplete: bool) -> Vec<i32> {
        let snap = self.snapshot.read();
        if include_incomplete {
            snap.components.keys().copied().collect()
        } else {
            snap.master_keys.keys().copied().collect()
        }
    }

    /// Whether the master key of `version` encrypts the control phrase to
    /// the stored control code.
    pub fn is_kek_valid(&self, version: i32) -> bool {
        self.snapshot.read().valid.contains(&version)
    }

    pub fn is_kek_part_checked(&self, version: i32, part: u8) -> bool {
        self.snapshot.read().is_part_checked(version, part)
    }

    /// All three shares of `version` confirmed.
    pub fn is_version_checked(&self, version: i32) -> bool {
        let snap = self.snapshot.read();
        (1..=3).all(|part| snap.is_part_checked(version, part))
    }

    /// A version may become active only when it is valid and checked.
    pub fn can_switch_to(&self, version: i32) -> bool {
        self.is_kek_valid(version) && self.is_version_checked(version)
    }

    // ------------------------------------------------------------------
    // HMAC keys
    // ------------------------------------------------------------------

    pub fn get_active_hmac_key_version(&self) -> Result<i32> {
        self.snapshot.read().db_version(HMAC_VERSION)
    }

    pub fn get_hmac_key(&self, version: i32) -> Result<SecretKey> {
        self.snapshot.read().hmac_key(version)
    }

    pub fn get_active_hmac_key(&self) -> Result<SecretKey> {
        let snap = self.snapshot.read();
        let version = snap.db_version(HMAC_VERSION)?;
        snap.hmac_key(version)
    }

    pub fn get_hmac_keys(&self) -> BTreeMap<i32, SecretKey> {
        self.snapshot.read().hmac_keys.clone()
    }

    /// Loaded HMAC versions, the active one first, the rest ascending.
    pub fn get_hmac_versions(&self) -> Result<Vec<i32>> {
        let snap = self.snapshot.read();
        let active = snap.db_version(HMAC_VERSION)?;

        let mut versions = Vec::with_capacity(snap.hmac_keys.len());
        if snap.hmac_keys.contains_key(&active) {
            versions.push(active);
        }
        versions.extend(snap.hmac_keys.keys().copied().filter(|v| *v != active));
        Ok(versions)
    }
}

// ---------------------------------------------------------------------------
// Snapshot building
// ---------------------------------------------------------------------------

/// Mark each assembled key valid when it reproduces its control code.
fn check_master_keys(next: &mut Snapshot) {
    let Some(phrase) = next.db_params.get(KEK_CONTROL_PHRASE) else {
        warn!("{KEK_CONTROL_PHRASE} is not set, no master key can be validated");
        return;
    };

    for (version, key) in &next.master_keys {
        let Some(expected) = next.db_params.get(&kek_control_code_key(*version)) else {
            warn!(version = *version, "no control code stored");
            continue;
        };
        match control_code(key, phrase) {
            Ok(code) if bool::from(code.as_bytes().ct_eq(expected.trim().as_bytes())) => {
                next.valid.insert(*version);
            }
            Ok(_) => warn!(version = *version, "master key does not match its control code"),
            Err(e) => error!(version = *version, error = %e, "control code check failed"),
        }
    }
}

fn load_hmac_keys(store: &Store, next: &mut Snapshot) {
    let entries: Vec<(i32, String)> = next
        .db_params
        .iter()
        .filter_map(|(k, v)| version_in(k, "HMAC_VER", "_ID").map(|ver| (ver, v.clone())))
        .collect();

    for (version, id) in entries {
        debug!(version, "loading HMAC key");
        match load_hmac_key(store, next, &id) {
            Ok(key) => {
                next.hmac_keys.insert(version, key);
                info!(version, "HMAC key loaded");
            }
            Err(e) => error!(version, error = %e, "loading HMAC key failed"),
        }
    }
}

fn load_hmac_key(store: &Store, next: &Snapshot, id: &str) -> Result<SecretKey> {
    let id: i64 = id
        .trim()
        .parse()
        .map_err(|_| CardVaultError::ConfigError(format!("HMAC key id is not a number: '{id}'")))?;
    let record = store
        .get_data_key(id)?
        .ok_or_else(|| CardVaultError::KeyVersionNotFound(format!("data_key id {id}")))?;
    let master = next.master_key(record.kek_version, true)?;
    unwrap_key(&master, &record.dek_crypted)
}
