//! `cardvault kek`: create, confirm and activate master key versions.
//!
//! A rotation runs `generate`, then `confirm <v> 1`, `confirm <v> 2` and
//! `confirm <v> 3` as each custodian takes their share, then `switch`.

use crate::cli::output;
use crate::cli::{
    load_config, load_settings, open_store, place_new_shares, project_dir, share_source, Cli,
};
use crate::errors::{CardVaultError, Result};
use crate::kek::provision::{
    confirm_kek_part, generate_kek_shares, next_kek_version, reset_target_version,
    store_kek_version, switch_kek_version,
};

/// Execute `kek generate`.
pub fn execute_generate(cli: &Cli) -> Result<()> {
    let dir = project_dir(cli)?;
    let mut settings = load_settings(cli)?;
    let store = open_store(cli, &settings)?;

    let version = next_kek_version(&store)?;
    let shares = generate_kek_shares(&store, version)?;

    // Shares #1 and #2 first; the database row makes the version visible.
    let mut source = share_source(&settings);
    place_new_shares(&dir, &mut settings, source.as_mut(), &shares)?;
    store_kek_version(&store, &shares)?;

    output::success(&format!("KEK version {version} created and set as the switch target"));
    output::print_new_shares(&shares);
    output::tip(&format!(
        "Confirm each share with `cardvault kek confirm {version} <part>`, then run `cardvault kek switch`."
    ));
    Ok(())
}

/// Execute `kek confirm <version> <part>`.
pub fn execute_confirm(cli: &Cli, version: i32, part: u8) -> Result<()> {
    let settings = load_settings(cli)?;
    let store = open_store(cli, &settings)?;

    confirm_kek_part(&store, version, part)?;
    output::success(&format!("Share #{part} of KEK version {version} confirmed"));
    Ok(())
}

/// Execute `kek switch [version]`.
pub fn execute_switch(cli: &Cli, version: Option<i32>) -> Result<()> {
    let settings = load_settings(cli)?;
    let store = open_store(cli, &settings)?;
    let config = load_config(&settings, &store)?;

    let version = match version {
        Some(v) => v,
        None => config.get_switch_version()?.ok_or_else(|| {
            CardVaultError::CommandFailed(
                "no switch target is set (pass a version or run `cardvault kek generate`)".into(),
            )
        })?,
    };

    switch_kek_version(&store, &config, version)?;
    output::success(&format!("KEK version {version} is now active"));
    output::tip("New data keys are wrapped under this version; existing tokens stay readable.");
    Ok(())
}

/// Execute `kek reset-target <version>`.
pub fn execute_reset_target(cli: &Cli, version: i32) -> Result<()> {
    let settings = load_settings(cli)?;
    let store = open_store(cli, &settings)?;
    let config = load_config(&settings, &store)?;

    reset_target_version(&store, &config, version)?;
    output::success(&format!("Switch target set to KEK version {version}"));
    Ok(())
}
