//! `cardvault hmac`: create and activate HMAC key versions.

use crate::cli::output;
use crate::cli::{load_config, load_settings, open_store, Cli};
use crate::errors::Result;
use crate::kek::provision::{activate_hmac_version, next_hmac_version, provision_hmac_key};
use crate::vault::DekPool;

/// Execute `hmac generate`.
pub fn execute_generate(cli: &Cli) -> Result<()> {
    let settings = load_settings(cli)?;
    let store = open_store(cli, &settings)?;
    let config = load_config(&settings, &store)?;

    let kek_version = config.get_active_master_key_version()?;
    let pool = DekPool::new(settings.dek, kek_version, config.get_active_master_key(true)?)?;
    let version = next_hmac_version(&store)?;
    provision_hmac_key(&store, &pool, version)?;

    output::success(&format!(
        "HMAC version {version} created under KEK version {kek_version}"
    ));
    output::tip(&format!("Run `cardvault hmac switch {version}` to use it for new tokens."));
    Ok(())
}

/// Execute `hmac switch <version>`.
pub fn execute_switch(cli: &Cli, version: i32) -> Result<()> {
    let settings = load_settings(cli)?;
    let store = open_store(cli, &settings)?;
    let config = load_config(&settings, &store)?;

    activate_hmac_version(&store, &config, version)?;
    output::success(&format!("HMAC version {version} is now active"));
    output::tip("Searches still match values indexed under older versions.");
    Ok(())
}
