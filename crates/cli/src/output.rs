//! Output formatting helpers

use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
}

/// Render a two-column table with aligned keys
pub fn print_kv_table(rows: &[(&str, String)]) {
    let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    for (key, value) in rows {
        println!("  {:width$}  {}", key, value, width = width);
    }
}

/// Underlined section heading
pub fn print_heading(text: &str) {
    println!("{}", text);
    println!("{}", "-".repeat(text.len()));
}
