//! Writing key material into the `config` table.
//!
//! These are the building blocks of the operator workflows: create a new
//! KEK version, confirm its shares, switch to it, and create HMAC keys.
//! Share #1 and share #2 of a new version are returned to the caller,
//! who is responsible for placing them in the key-share service and the
//! local settings.

use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::config::DekSettings;
use crate::crypto::keys::{assemble_kek, control_code, generate_share_hex, random_hex};
use crate::errors::{CardVaultError, Result};
use crate::vault::{DataKey, DekPool, KeyPurpose, Store};

use super::config::{
    hmac_id_key, kek_check_key, kek_control_code_key, kek_part_key, version_in,
    TokenizerConfig, HMAC_VERSION, KEK_CONTROL_PHRASE, KEK_TARGET_VERSION, KEK_VERSION,
};

/// Length in bytes of a generated control phrase (hex doubles it).
const CONTROL_PHRASE_BYTES: usize = 16;

/// The three hex shares of a freshly created KEK version.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KekShares {
    pub version: i32,
    pub part1: String,
    pub part2: String,
    pub part3: String,
}

impl std::fmt::Debug for KekShares {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KekShares")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Generate fresh shares for KEK `version` without writing anything.
///
/// Fails if the version already has share #3 in the database.
pub fn generate_kek_shares(store: &Store, version: i32) -> Result<KekShares> {
    if store.get_config_param(&kek_part_key(version, 3))?.is_some() {
        return Err(CardVaultError::InvalidInput(format!(
            "KEK version {version} already exists"
        )));
    }
    Ok(KekShares {
        version,
        part1: generate_share_hex(),
        part2: generate_share_hex(),
        part3: generate_share_hex(),
    })
}

/// Write KEK `shares.version` to the database: share #3, the control
/// code and cleared confirmation flags.  The version becomes the switch
/// target.
///
/// Callers place share #1 and share #2 first, so a failure there leaves
/// no half-created version behind.
pub fn store_kek_version(store: &Store, shares: &KekShares) -> Result<()> {
    let version = shares.version;
    if store.get_config_param(&kek_part_key(version, 3))?.is_some() {
        return Err(CardVaultError::InvalidInput(format!(
            "KEK version {version} already exists"
        )));
    }
    let master = assemble_kek(&shares.part1, &shares.part2, &shares.part3)?;

    let phrase = match store.get_config_param(KEK_CONTROL_PHRASE)? {
        Some(phrase) => phrase,
        None => {
            let phrase = random_hex(CONTROL_PHRASE_BYTES);
            store.set_config_param(KEK_CONTROL_PHRASE, &phrase)?;
            phrase
        }
    };

    store.set_config_param(&kek_part_key(version, 3), &shares.part3)?;
    store.set_config_param(&kek_control_code_key(version), &control_code(&master, &phrase)?)?;
    for part in 1..=3 {
        store.set_config_param(&kek_check_key(version, part), "0")?;
    }
    store.set_config_param(KEK_TARGET_VERSION, &version.to_string())?;

    info!(version, "provisioned KEK version");
    Ok(())
}

/// Generate and store KEK `version` in one go.
pub fn provision_kek_version(store: &Store, version: i32) -> Result<KekShares> {
    let shares = generate_kek_shares(store, version)?;
    store_kek_version(store, &shares)?;
    Ok(shares)
}

/// One past the highest KEK version with share #3 in the database.
pub fn next_kek_version(store: &Store) -> Result<i32> {
    let last = store
        .config_params()?
        .keys()
        .filter_map(|key| version_in(key, "KEK_VER", "_PART3"))
        .max()
        .unwrap_or(0);
    Ok(last + 1)
}

/// One past the highest registered HMAC version.
pub fn next_hmac_version(store: &Store) -> Result<i32> {
    let last = store
        .config_params()?
        .keys()
        .filter_map(|key| version_in(key, "HMAC_VER", "_ID"))
        .max()
        .unwrap_or(0);
    Ok(last + 1)
}

/// Record that the holder of share `part` of `version` confirmed it.
pub fn confirm_kek_part(store: &Store, version: i32, part: u8) -> Result<()> {
    if !(1..=3).contains(&part) {
        return Err(CardVaultError::InvalidInput(format!(
            "KEK part must be 1, 2 or 3 (got {part})"
        )));
    }
    if store.get_config_param(&kek_part_key(version, 3))?.is_none() {
        return Err(CardVaultError::KeyVersionNotFound(format!("KEK ver{version}")));
    }
    store.set_config_param(&kek_check_key(version, part), "1")?;
    info!(version, part, "KEK share confirmed");
    Ok(())
}

/// Make `version` the active KEK.  It must be valid, fully confirmed and
/// not already active.  A switch target pointing at `version` is cleared.
pub fn switch_kek_version(store: &Store, config: &TokenizerConfig, version: i32) -> Result<()> {
    config.refresh(store, true)?;
    if config.get_active_master_key_version().ok() == Some(version) {
        return Err(CardVaultError::InvalidInput(format!(
            "KEK version {version} is already active"
        )));
    }
    if !config.can_switch_to(version) {
        return Err(CardVaultError::InvalidInput(format!(
            "KEK version {version} is not valid and confirmed"
        )));
    }
    store.set_config_param(KEK_VERSION, &version.to_string())?;
    if config.get_switch_version()? == Some(version) {
        store.delete_config_param(KEK_TARGET_VERSION)?;
    }
    config.refresh(store, true)?;
    info!(version, "switched active KEK version");
    Ok(())
}

/// Point the switch target at `version`, which must be valid and fully
/// confirmed.
pub fn reset_target_version(store: &Store, config: &TokenizerConfig, version: i32) -> Result<()> {
    config.refresh(store, true)?;
    if !config.can_switch_to(version) {
        return Err(CardVaultError::InvalidInput(format!(
            "KEK version {version} is not valid and confirmed"
        )));
    }
    store.set_config_param(KEK_TARGET_VERSION, &version.to_string())?;
    config.refresh(store, true)?;
    info!(version, "reset KEK switch target");
    Ok(())
}

/// Create an HMAC key under the pool's KEK and register it as
/// `hmac_version`.
pub fn provision_hmac_key(store: &Store, pool: &DekPool, hmac_version: i32) -> Result<DataKey> {
    if store.get_config_param(&hmac_id_key(hmac_version))?.is_some() {
        return Err(CardVaultError::InvalidInput(format!(
            "HMAC version {hmac_version} already exists"
        )));
    }
    let key = pool.generate_new_data_key(store, KeyPurpose::Hmac)?;
    store.set_config_param(&hmac_id_key(hmac_version), &key.id.to_string())?;
    info!(hmac_version, id = key.id, "provisioned HMAC key");
    Ok(key)
}

/// Make `hmac_version` the active HMAC version.  Its key must load.
pub fn activate_hmac_version(
    store: &Store,
    config: &TokenizerConfig,
    hmac_version: i32,
) -> Result<()> {
    config.refresh(store, true)?;
    config.get_hmac_key(hmac_version)?;
    store.set_config_param(HMAC_VERSION, &hmac_version.to_string())?;
    config.refresh(store, true)?;
    info!(hmac_version, "switched active HMAC version");
    Ok(())
}

/// Finish setting up a fresh deployment once `kek_version` has been
/// provisioned and its shares placed: confirm all three shares, make the
/// version active, and create and activate HMAC version 1.
pub fn complete_bootstrap(
    store: &Store,
    config: &TokenizerConfig,
    pool_settings: DekSettings,
    kek_version: i32,
) -> Result<DataKey> {
    for part in 1..=3 {
        confirm_kek_part(store, kek_version, part)?;
    }
    switch_kek_version(store, config, kek_version)?;

    // An earlier, interrupted bootstrap may already have created the key.
    let hmac_key = match store.get_config_param(&hmac_id_key(1))? {
        Some(id) => {
            let id: i64 = id.trim().parse().map_err(|_| {
                CardVaultError::ConfigError(format!("{} is not a key id: '{id}'", hmac_id_key(1)))
            })?;
            store
                .get_data_key(id)?
                .ok_or_else(|| CardVaultError::KeyVersionNotFound(format!("data_key id {id}")))?
        }
        None => {
            let pool =
                DekPool::new(pool_settings, kek_version, config.get_master_key(kek_version, true)?)?;
            provision_hmac_key(store, &pool, 1)?
        }
    };
    activate_hmac_version(store, config, 1)?;
    Ok(hmac_key)
}
