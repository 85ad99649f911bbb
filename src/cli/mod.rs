//! CLI module: argument parser, shared helpers and one module per command.

pub mod commands;
pub mod output;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::warn;

use crate::config::Settings;
use crate::errors::{CardVaultError, Result};
use crate::kek::config::kek_part_key;
use crate::kek::{KekShares, KeyKeeperClient, KeyShareSource, StaticKeyShares, TokenizerConfig};
use crate::vault::tokenizer::TOKEN_BYTES;
use crate::vault::{DataKind, Store, Tokenizer};

/// CardVault CLI: tokenize card data under multi-party master keys.
#[derive(Parser)]
#[command(
    name = "cardvault",
    about = "Card-data tokenization vault",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Project directory holding cardvault.toml (default: current directory)
    #[arg(long, default_value = ".", global = true, env = "CARDVAULT_DIR")]
    pub dir: String,
}

/// All available subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create the database (and settings file if missing)
    Init {
        /// Also generate KEK version 1 and an HMAC key, and activate them
        #[arg(long)]
        bootstrap: bool,
    },

    /// Replace a value with a token
    Tokenize {
        /// Card number / CVN, or any text with --generic
        value: String,
        /// Store in the generic vault instead of the card table
        #[arg(long)]
        generic: bool,
        /// Always mint a new token, even for a known value
        #[arg(long)]
        no_dedup: bool,
        /// Days until the token expires
        #[arg(long, default_value = "365")]
        ttl_days: i64,
    },

    /// Print the value behind a token
    Detokenize {
        /// Token string (32 hex characters)
        token: String,
        #[arg(long)]
        generic: bool,
    },

    /// Look up the existing token for a value
    Search {
        value: String,
        #[arg(long)]
        generic: bool,
    },

    /// Delete a token
    Remove {
        token: String,
        #[arg(long)]
        generic: bool,
    },

    /// Show DEK pool counts and headroom
    Status,

    /// Show KEK and HMAC versions
    Versions,

    /// Manage master key (KEK) versions
    Kek {
        #[command(subcommand)]
        action: KekAction,
    },

    /// Manage HMAC key versions
    Hmac {
        #[command(subcommand)]
        action: HmacAction,
    },
}

/// KEK subcommands for the rotation workflow.
#[derive(clap::Subcommand)]
pub enum KekAction {
    /// Create the next KEK version and print its shares
    Generate,

    /// Record that a share holder confirmed their share
    Confirm {
        /// KEK version
        version: i32,
        /// Share number (1, 2 or 3)
        part: u8,
    },

    /// Make a confirmed KEK version active
    Switch {
        /// Version to activate (default: the current switch target)
        version: Option<i32>,
    },

    /// Point the switch target at another confirmed version
    ResetTarget {
        version: i32,
    },
}

/// HMAC subcommands.
#[derive(clap::Subcommand)]
pub enum HmacAction {
    /// Create the next HMAC key under the active KEK
    Generate,

    /// Make an HMAC version active for new tokens
    Switch {
        version: i32,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers used by multiple commands
// ---------------------------------------------------------------------------

/// Absolute project directory from `--dir`.
pub fn project_dir(cli: &Cli) -> Result<PathBuf> {
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(&cli.dir))
}

/// Settings from `<dir>/cardvault.toml` (defaults if absent).
pub fn load_settings(cli: &Cli) -> Result<Settings> {
    Settings::load(&project_dir(cli)?)
}

/// Open the existing database; fails if `init` has not been run.
pub fn open_store(cli: &Cli, settings: &Settings) -> Result<Store> {
    let path = settings.database_path(&project_dir(cli)?);
    if !path.exists() {
        return Err(CardVaultError::CommandFailed(format!(
            "no database at {} (run `cardvault init` first)",
            path.display()
        )));
    }
    Store::open(&path)
}

/// Where share #1 comes from: the key-share service when configured,
/// otherwise `KEK_VER<v>_PART1` items in the local settings.
pub fn share_source(settings: &Settings) -> Box<dyn KeyShareSource> {
    if let Some(client) = KeyKeeperClient::from_settings(&settings.key_keeper) {
        return Box::new(client);
    }

    warn!("no key-share service configured, reading share #1 from local settings");
    let mut shares = StaticKeyShares::new();
    for (id, data) in &settings.key_settings {
        if let Some(version) = id
            .strip_prefix("KEK_VER")
            .and_then(|rest| rest.strip_suffix("_PART1"))
            .and_then(|v| v.parse::<i32>().ok())
        {
            shares = shares.with_share(version, data.clone());
        }
    }
    Box::new(shares)
}

/// Hand share #1 of a new KEK version to `source` and record share #2
/// in the settings file.
///
/// Without a key-share service, share #1 goes to the settings file too.
/// Nothing touches the database here, so a failure leaves no partly
/// created version behind.
pub fn place_new_shares(
    dir: &Path,
    settings: &mut Settings,
    source: &mut dyn KeyShareSource,
    shares: &KekShares,
) -> Result<()> {
    source.put_key_by_version(shares.version, &shares.part1)?;
    if settings.key_keeper.url.is_none() {
        settings
            .key_settings
            .insert(kek_part_key(shares.version, 1), shares.part1.clone());
    }
    settings
        .key_settings
        .insert(kek_part_key(shares.version, 2), shares.part2.clone());
    settings.save(dir)
}

/// Load the key config for an opened store.
pub fn load_config(settings: &Settings, store: &Store) -> Result<Arc<TokenizerConfig>> {
    let config = TokenizerConfig::load(store, settings.key_settings.clone(), share_source(settings))?;
    Ok(Arc::new(config))
}

/// Settings, store and key config wired into a tokenizer.
pub fn open_tokenizer(cli: &Cli, kind: DataKind) -> Result<Tokenizer> {
    let settings = load_settings(cli)?;
    let store = open_store(cli, &settings)?;
    let config = load_config(&settings, &store)?;
    Tokenizer::new(store, config, settings.dek, kind)
}

pub fn data_kind(generic: bool) -> DataKind {
    if generic {
        DataKind::Generic
    } else {
        DataKind::Card
    }
}

/// Reject strings that cannot be tokens before touching the database.
///
/// A token is `2 * TOKEN_BYTES` lowercase hex characters.
pub fn validate_token(token: &str) -> Result<()> {
    if token.len() != TOKEN_BYTES * 2
        || !token
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    {
        return Err(CardVaultError::CommandFailed(format!(
            "'{token}' is not a token (expected {} lowercase hex characters)",
            TOKEN_BYTES * 2
        )));
    }
    Ok(())
}
