//! `cardvault init`: create the database, optionally bootstrapping keys.

use std::fs;

use crate::cli::output;
use crate::cli::{place_new_shares, project_dir, share_source, Cli};
use crate::config::Settings;
use crate::errors::{CardVaultError, Result};
use crate::kek::config::{kek_part_key, KEK_VERSION};
use crate::kek::provision::{complete_bootstrap, generate_kek_shares, store_kek_version};
use crate::kek::TokenizerConfig;
use crate::vault::Store;

/// KEK version created by `--bootstrap`.
const FIRST_KEK_VERSION: i32 = 1;

/// Execute the `init` command.
pub fn execute(cli: &Cli, bootstrap: bool) -> Result<()> {
    let dir = project_dir(cli)?;

    // 1. Create the project directory and a default settings file.
    if !dir.exists() {
        fs::create_dir_all(&dir)?;
        output::info(&format!("Created project directory: {}", dir.display()));
    }
    let mut settings = Settings::load(&dir)?;
    if !dir.join(Settings::FILE_NAME).exists() {
        settings.save(&dir)?;
        output::info(&format!("Wrote default {}", Settings::FILE_NAME));
    }

    // 2. Create (or upgrade) the schema.
    let db_path = settings.database_path(&dir);
    let store = Store::open(&db_path)?;
    output::success(&format!("Database ready at {}", db_path.display()));

    if !bootstrap {
        output::tip("Run `cardvault init --bootstrap` to generate the first master key.");
        return Ok(());
    }

    // 3. Refuse to bootstrap twice.
    if store.get_config_param(KEK_VERSION)?.is_some() {
        output::tip("Use `cardvault versions` to inspect the existing keys.");
        return Err(CardVaultError::CommandFailed(
            "keys are already bootstrapped".into(),
        ));
    }

    // 4. Resume a bootstrap that stopped after writing the version.
    if store.get_config_param(&kek_part_key(FIRST_KEK_VERSION, 3))?.is_some() {
        let config =
            TokenizerConfig::load(&store, settings.key_settings.clone(), share_source(&settings))?;
        if !config.is_kek_valid(FIRST_KEK_VERSION) {
            return Err(CardVaultError::CommandFailed(format!(
                "KEK version {FIRST_KEK_VERSION} exists but its shares do not reproduce the control code"
            )));
        }
        complete_bootstrap(&store, &config, settings.dek, FIRST_KEK_VERSION)?;
        output::success(&format!(
            "Resumed bootstrap: KEK version {FIRST_KEK_VERSION} and HMAC version 1 are active"
        ));
        return Ok(());
    }

    // 5. Generate the shares and place #1 and #2 before the database
    //    learns about the version, so a failure here can simply be retried.
    let shares = generate_kek_shares(&store, FIRST_KEK_VERSION)?;
    let mut source = share_source(&settings);
    place_new_shares(&dir, &mut settings, source.as_mut(), &shares)?;
    if settings.key_keeper.url.is_none() {
        output::warning("No key-share service configured: share #1 was written to the settings file.");
    }

    // 6. Share #3, control code and confirmation flags.
    store_kek_version(&store, &shares)?;

    // 7. Confirm, activate, and create the first HMAC key.
    let config = TokenizerConfig::load(&store, settings.key_settings.clone(), source)?;
    complete_bootstrap(&store, &config, settings.dek, FIRST_KEK_VERSION)?;

    output::success(&format!(
        "KEK version {FIRST_KEK_VERSION} and HMAC version 1 are active"
    ));
    output::print_new_shares(&shares);
    output::tip("Run `cardvault tokenize <card number>` to store your first value.");

    Ok(())
}
