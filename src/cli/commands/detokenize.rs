//! `cardvault detokenize`: print the value behind a token.

use crate::cli::{data_kind, open_tokenizer, validate_token, Cli};
use crate::errors::Result;

/// Execute the `detokenize` command.
pub fn execute(cli: &Cli, token: &str, generic: bool) -> Result<()> {
    validate_token(token)?;
    let tokenizer = open_tokenizer(cli, data_kind(generic))?;

    let value = tokenizer.detokenize(token)?;
    println!("{value}");

    Ok(())
}
