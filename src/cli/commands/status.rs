//! `cardvault status`: DEK pool counts and headroom.

use crate::cli::output;
use crate::cli::{load_config, load_settings, open_store, Cli};
use crate::errors::Result;
use crate::vault::{DataKind, Tokenizer};

/// Execute the `status` command.
pub fn execute(cli: &Cli) -> Result<()> {
    let settings = load_settings(cli)?;
    let store = open_store(cli, &settings)?;
    let config = load_config(&settings, &store)?;
    let mut tokenizer = Tokenizer::new(store, config, settings.dek, DataKind::Card)?;

    let status = tokenizer.get_status()?;
    output::print_pool_status(&status, &settings.dek);

    if status.use_count < settings.dek.min_active_limit {
        output::tip("Headroom is below the minimum; the next tokenize call will create new keys.");
    }
    Ok(())
}
