use clap::Parser;
use tracing_subscriber::EnvFilter;

use cardvault::cli::commands;
use cardvault::cli::{load_settings, output, Cli, Commands, HmacAction, KekAction};

/// `RUST_LOG` wins; otherwise the `log_level` from cardvault.toml.
fn init_tracing(cli: &Cli) {
    let fallback = load_settings(cli)
        .map(|settings| settings.log_level)
        .unwrap_or_else(|_| "warn".to_string());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&fallback))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let result = match cli.command {
        Commands::Init { bootstrap } => commands::init::execute(&cli, bootstrap),
        Commands::Tokenize {
            ref value,
            generic,
            no_dedup,
            ttl_days,
        } => commands::tokenize::execute(&cli, value, generic, no_dedup, ttl_days),
        Commands::Detokenize { ref token, generic } => {
            commands::detokenize::execute(&cli, token, generic)
        }
        Commands::Search { ref value, generic } => commands::search::execute(&cli, value, generic),
        Commands::Remove { ref token, generic } => commands::remove::execute(&cli, token, generic),
        Commands::Status => commands::status::execute(&cli),
        Commands::Versions => commands::versions::execute(&cli),
        Commands::Kek { ref action } => match action {
            KekAction::Generate => commands::kek::execute_generate(&cli),
            KekAction::Confirm { version, part } => {
                commands::kek::execute_confirm(&cli, *version, *part)
            }
            KekAction::Switch { version } => commands::kek::execute_switch(&cli, *version),
            KekAction::ResetTarget { version } => {
                commands::kek::execute_reset_target(&cli, *version)
            }
        },
        Commands::Hmac { ref action } => match action {
            HmacAction::Generate => commands::hmac::execute_generate(&cli),
            HmacAction::Switch { version } => commands::hmac::execute_switch(&cli, *version),
        },
    };

    if let Err(e) = result {
        output::error(&e.to_string());
        std::process::exit(1);
    }
}
