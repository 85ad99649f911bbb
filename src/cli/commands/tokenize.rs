//! `cardvault tokenize`: store a value and print its token.

use chrono::{Duration, Utc};

use crate::cli::{data_kind, open_tokenizer, Cli};
use crate::errors::{CardVaultError, Result};

/// Execute the `tokenize` command.
pub fn execute(cli: &Cli, value: &str, generic: bool, no_dedup: bool, ttl_days: i64) -> Result<()> {
    if ttl_days < 1 {
        return Err(CardVaultError::CommandFailed(format!(
            "--ttl-days must be at least 1 (got {ttl_days})"
        )));
    }

    let finish_ts = Duration::try_days(ttl_days)
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .ok_or_else(|| CardVaultError::CommandFailed(format!("--ttl-days {ttl_days} is out of range")))?;

    let mut tokenizer = open_tokenizer(cli, data_kind(generic))?;
    let token = tokenizer.tokenize(value, finish_ts, !no_dedup)?;

    println!("{token}");
    Ok(())
}
