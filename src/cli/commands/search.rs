//! `cardvault search`: find the existing token for a value.

use crate::cli::output;
use crate::cli::{data_kind, open_tokenizer, Cli};
use crate::errors::Result;
use crate::vault::tokenizer::MIN_INDEXED_LEN;

/// Execute the `search` command.
pub fn execute(cli: &Cli, value: &str, generic: bool) -> Result<()> {
    let tokenizer = open_tokenizer(cli, data_kind(generic))?;

    match tokenizer.search(value)? {
        Some(token) => println!("{token}"),
        None => {
            output::info("No token found for this value.");
            if value.len() < MIN_INDEXED_LEN {
                output::tip(&format!(
                    "Values shorter than {MIN_INDEXED_LEN} characters are never indexed."
                ));
            }
        }
    }
    Ok(())
}
