use anyhow::{bail, Result};
use clap::Parser;

use dedup_storage::IntegrityReport;

use crate::config::StoreArgs;
use crate::inspect::format_bytes;

#[derive(Parser, Debug)]
pub struct CheckConfig {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(long, help = "Re-hash every blob and compare it with its digest")]
    pub verify_content: bool,

    #[arg(long, help = "Print the report as JSON")]
    pub json: bool,
}

/// Cross-checks the reference index, the catalog and the blob store. Fails if
/// anything could lose data.
#[tokio::main]
pub async fn check_integrity(args: CheckConfig) -> Result<()> {
    let store = args.store.open()?;
    let report = store.check(args.verify_content).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.has_violations() {
        bail!("integrity check found problems that can lose data");
    }
    Ok(())
}

fn print_report(report: &IntegrityReport) {
    println!(
        "Checked {} reference(s), {} blob(s), {} file(s)",
        report.entries_checked, report.blobs_checked, report.files_checked
    );
    if report.is_clean() {
        println!("No problems found");
        return;
    }

    for digest in &report.missing_blobs {
        println!("MISSING   {digest}: referenced but not stored");
    }
    for mismatch in &report.count_mismatches {
        let kind = if mismatch.is_undercount() { "UNDER" } else { "OVER" };
        println!(
            "{kind:<9} {}: count {} but {} file(s)",
            mismatch.digest, mismatch.recorded, mismatch.actual
        );
    }
    for id in &report.dangling_files {
        println!("DANGLING  {id}: file without a reference entry");
    }
    for digest in &report.corrupt_blobs {
        println!("CORRUPT   {digest}: content does not match its hash");
    }
    if !report.leaked_blobs.is_empty() {
        let leaked: u64 = report.leaked_blobs.iter().map(|b| b.size).sum();
        for blob in &report.leaked_blobs {
            println!("LEAKED    {}: {}", blob.digest, format_bytes(blob.size));
        }
        println!(
            "{} leaked blob(s) hold {}",
            report.leaked_blobs.len(),
            format_bytes(leaked)
        );
    }
}
