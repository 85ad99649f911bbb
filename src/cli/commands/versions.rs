//! `cardvault versions`: KEK and HMAC versions with their state.

use crate::cli::output::{self, VersionRow};
use crate::cli::{load_config, load_settings, open_store, Cli};
use crate::errors::Result;

/// Execute the `versions` command.
pub fn execute(cli: &Cli) -> Result<()> {
    let settings = load_settings(cli)?;
    let store = open_store(cli, &settings)?;
    let config = load_config(&settings, &store)?;

    let active = config.get_active_master_key_version().ok();
    let target = config.get_switch_version()?;
    let assembled = config.get_versions(false);

    let rows: Vec<VersionRow> = config
        .get_versions(true)
        .into_iter()
        .map(|version| VersionRow {
            version,
            assembled: assembled.contains(&version),
            valid: config.is_kek_valid(version),
            checked: [1, 2, 3].map(|part| config.is_kek_part_checked(version, part)),
            active: active == Some(version),
            target: target == Some(version),
        })
        .collect();
    output::print_versions_table(&rows);

    match config.get_hmac_versions() {
        Ok(versions) if !versions.is_empty() => {
            let list: Vec<String> = versions.iter().map(i32::to_string).collect();
            output::info(&format!("HMAC versions (active first): {}", list.join(", ")));
        }
        _ => output::info("No HMAC key loaded."),
    }
    Ok(())
}
