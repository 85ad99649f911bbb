//! Colored terminal output helpers.
//!
//! Status lines go through these functions so every command looks the
//! same.  Values meant for scripts (tokens, detokenized data) are printed
//! bare with `println!` by the commands themselves.

use comfy_table::{ContentArrangement, Table};
use console::style;

use crate::config::DekSettings;
use crate::kek::KekShares;
use crate::vault::DekPoolStatus;

/// Print a green success message: "check_mark {msg}"
pub fn success(msg: &str) {
    eprintln!("{} {}", style("\u{2713}").green().bold(), msg);
}

/// Print a red error message: "x_mark {msg}"
pub fn error(msg: &str) {
    eprintln!("{} {}", style("\u{2717}").red().bold(), msg);
}

/// Print a yellow warning: "warning_sign {msg}"
pub fn warning(msg: &str) {
    eprintln!("{} {}", style("\u{26a0}").yellow().bold(), msg);
}

/// Print a blue info message: "info_sign {msg}"
pub fn info(msg: &str) {
    eprintln!("{} {}", style("\u{2139}").blue().bold(), msg);
}

/// Print a dim tip/hint: "arrow {msg}"
pub fn tip(msg: &str) {
    eprintln!("{} {}", style("\u{2192}").dim(), style(msg).dim());
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

/// DEK pool counts next to the configured limits.
pub fn print_pool_status(status: &DekPoolStatus, limits: &DekSettings) {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Data keys", "Active", "Headroom", "Min headroom", "Uses per key"]);
    table.add_row(vec![
        status.total_count.to_string(),
        status.active_count.to_string(),
        status.use_count.to_string(),
        limits.min_active_limit.to_string(),
        limits.use_count.to_string(),
    ]);
    println!("{table}");
}

/// One row of the `versions` table.
pub struct VersionRow {
    pub version: i32,
    pub assembled: bool,
    pub valid: bool,
    pub checked: [bool; 3],
    pub active: bool,
    pub target: bool,
}

/// KEK versions with their state.
pub fn print_versions_table(rows: &[VersionRow]) {
    if rows.is_empty() {
        info("No KEK versions configured yet.");
        tip("Run `cardvault init --bootstrap` to create version 1.");
        return;
    }

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["KEK", "Assembled", "Valid", "Confirmed", "Active", "Target"]);

    for row in rows {
        let confirmed: Vec<String> = row
            .checked
            .iter()
            .enumerate()
            .map(|(i, c)| format!("#{}:{}", i + 1, yes_no(*c)))
            .collect();
        table.add_row(vec![
            row.version.to_string(),
            yes_no(row.assembled).to_string(),
            yes_no(row.valid).to_string(),
            confirmed.join(" "),
            if row.active { "*".to_string() } else { String::new() },
            if row.target { "*".to_string() } else { String::new() },
        ]);
    }

    println!("{table}");
}

/// Shares #1 and #2 of a new KEK version, for the operator to file away.
pub fn print_new_shares(shares: &KekShares) {
    warning(&format!(
        "KEK version {} shares below are shown once. Store them with their custodians.",
        shares.version
    ));

    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Share", "Goes to", "Value"]);
    table.add_row(vec!["#1", "key-share service", shares.part1.as_str()]);
    table.add_row(vec!["#2", "cardvault.toml [key_settings]", shares.part2.as_str()]);
    println!("{table}");
}
