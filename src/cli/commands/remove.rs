//! `cardvault remove`: delete a token.

use crate::cli::output;
use crate::cli::{data_kind, open_tokenizer, validate_token, Cli};
use crate::errors::Result;

/// Execute the `remove` command.
pub fn execute(cli: &Cli, token: &str, generic: bool) -> Result<()> {
    validate_token(token)?;
    let tokenizer = open_tokenizer(cli, data_kind(generic))?;

    if tokenizer.remove_data_token(token)? {
        output::success(&format!("Removed token {token}"));
    } else {
        output::warning(&format!("Token {token} not found, nothing removed"));
    }
    Ok(())
}
