use anyhow::Result;

use dedup_storage::{DedupStore, FileFilter, FileId, PageRequest, Scope, SortKey, SortSpec};

use crate::http_api::format_timestamp;

pub fn num_keys(store: &DedupStore) -> Result<Vec<(&'static str, usize)>> {
    Ok(store.tree_sizes()?)
}

/// Metadata and blob bytes on disk.
pub async fn disk_space(store: &DedupStore) -> Result<(u64, u64)> {
    let blobs = store.blobs().list().await?;
    let blob_bytes = blobs.iter().map(|b| b.size).sum();
    Ok((store.meta().disk_space(), blob_bytes))
}

/// Show storage savings, globally or for one owner
pub fn stats(store: &DedupStore, owner: Option<String>) -> Result<()> {
    let scope = match owner {
        Some(owner) => Scope::Owner(owner),
        None => Scope::Global,
    };
    let stats = store.stats(&scope)?;

    match &scope {
        Scope::Global => println!("Storage statistics (all owners):"),
        Scope::Owner(owner) => println!("Storage statistics for {owner}:"),
    }
    println!("  Files: {}", stats.total_files);
    println!("  Unique payloads: {}", stats.unique_files);
    println!("  Duplicate files: {}", stats.duplicate_files);
    println!(
        "  Logical size: {} ({} bytes)",
        format_bytes(stats.total_logical_size),
        stats.total_logical_size
    );
    println!(
        "  Stored size: {} ({} bytes)",
        format_bytes(stats.actual_stored_size),
        stats.actual_stored_size
    );
    println!("  Saved: {}", format_bytes(stats.saved_space));
    println!("  Storage savings: {:.1}%", stats.savings_percentage);

    if scope == Scope::Global {
        let totals = store.activity_totals()?;
        println!("\nActivity across {} owner(s):", totals.owners);
        println!("  Uploads: {}", totals.uploads);
        println!("  Downloads: {}", totals.downloads);
        println!("  Deletes: {}", totals.deletes);
        println!("  Deduplicated uploads: {}", totals.dedup_hits);
    }
    Ok(())
}

/// List groups of files sharing one payload
pub fn duplicates(store: &DedupStore, owner: Option<String>) -> Result<()> {
    let scope = match owner {
        Some(owner) => Scope::Owner(owner),
        None => Scope::Global,
    };
    let groups = store.duplicate_groups(&scope)?;
    if groups.is_empty() {
        println!("No duplicates found");
        return Ok(());
    }

    for group in &groups {
        println!(
            "{} {} x{}",
            group.digest.to_hex(),
            format_bytes(group.size),
            group.ref_count
        );
        for member in &group.members {
            println!("    {:<38} {:<20} {}", member.id, member.owner, member.name);
        }
    }
    println!("\n{} group(s)", groups.len());
    Ok(())
}

/// List the files of one owner, newest first
pub fn list_files(store: &DedupStore, owner: String) -> Result<()> {
    let listing = store.list_files(
        FileFilter::owner(owner),
        PageRequest {
            sort: Some(SortSpec {
                key: SortKey::Uploaded,
                descending: true,
            }),
            ..Default::default()
        },
    )?;

    if listing.files.is_empty() {
        println!("No files found");
        return Ok(());
    }

    println!(
        "{:<38} {:<30} {:<12} {:<6} {:<22}",
        "ID", "Name", "Size", "Refs", "Uploaded"
    );
    println!("{:-<110}", "");
    for summary in &listing.files {
        let file = &summary.file;
        println!(
            "{:<38} {:<30} {:<12} {:<6} {:<22}",
            file.id,
            truncate(&file.name, 30),
            format_bytes(file.size),
            summary.ref_count,
            format_timestamp(file.uploaded_at),
        );
    }
    Ok(())
}

/// Per-owner storage and activity
pub fn owners(store: &DedupStore) -> Result<()> {
    let report = store.owner_report()?;
    if report.is_empty() {
        println!("No owners found");
        return Ok(());
    }

    println!(
        "{:<24} {:<8} {:<12} {:<12} {:<8} {:<10} {:<22}",
        "Owner", "Files", "Logical", "Stored", "Saved", "Uploads", "Last active"
    );
    println!("{:-<100}", "");
    for entry in &report {
        println!(
            "{:<24} {:<8} {:<12} {:<12} {:<8} {:<10} {:<22}",
            truncate(&entry.owner, 24),
            entry.stats.total_files,
            format_bytes(entry.stats.total_logical_size),
            format_bytes(entry.stats.actual_stored_size),
            format!("{:.1}%", entry.stats.savings_percentage),
            entry.activity.uploads,
            format_timestamp(entry.activity.last_active),
        );
    }
    Ok(())
}

/// Show detailed information about a specific file
pub fn file_info(store: &DedupStore, id: &str) -> Result<()> {
    let id: FileId = id.parse()?;
    let summary = store.file_info(&id)?;
    let file = &summary.file;

    println!("File: {}", file.id);
    println!("Name: {}", file.name);
    println!("Owner: {}", file.owner);
    println!("Type: {}", file.mime_type);
    println!("Size: {} ({} bytes)", format_bytes(file.size), file.size);
    println!("Hash: {}", file.digest.to_hex());
    println!("Uploaded: {}", file.uploaded_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Downloads: {}", file.download_count);
    println!("Public: {}", if file.is_public { "Yes" } else { "No" });
    println!(
        "References: {}{}",
        summary.ref_count,
        if summary.is_deduplicated { " (deduplicated)" } else { "" }
    );

    let members = store.catalog().members_of(&file.digest)?;
    if members.len() > 1 {
        println!("\nShared with:");
        for other in members.iter().filter(|m| m.id != file.id).take(10) {
            println!("  {} {} ({})", other.id, other.name, other.owner);
        }
        if members.len() > 11 {
            println!("  ... ({} more)", members.len() - 11);
        }
    }
    Ok(())
}

fn truncate(s: &str, width: usize) -> String {
    if s.chars().count() <= width {
        return s.to_string();
    }
    let cut: String = s.chars().take(width.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512.00 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-very-long-file-name.txt", 10), "a-very-...");
    }
}
