//! `triage summary` - pass/fail counts for a report

use std::path::PathBuf;

use clap::Args;

use triage_common::report::report_counts;

use crate::output::{print_kv_table, OutputFormat};

#[derive(Args)]
pub struct SummaryArgs {
    /// Path to the JSON test report
    #[arg(long)]
    pub report: PathBuf,
}

pub fn run(args: SummaryArgs, format: OutputFormat) -> anyhow::Result<()> {
    let raw = std::fs::read(&args.report)?;
    let counts = report_counts(&raw)?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&counts)?),
        OutputFormat::Table => {
            print_kv_table(&[
                ("Total", counts.total.to_string()),
                ("Passed", counts.passed.to_string()),
                ("Failed", counts.failed.to_string()),
                ("Skipped", counts.skipped.to_string()),
            ]);
        }
    }
    Ok(())
}
