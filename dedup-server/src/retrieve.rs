use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use dedup_storage::FileId;

use crate::config::StoreArgs;

#[derive(Parser, Debug)]
pub struct RetrieveConfig {
    #[command(flatten)]
    pub store: StoreArgs,

    #[arg(required = true, help = "File id")]
    pub file_id: String,

    #[arg(required = true, help = "Destination file path")]
    pub dest: PathBuf,
}

/// Copies a file's content to `dest` without touching its download counter.
#[tokio::main]
pub async fn retrieve(args: RetrieveConfig) -> Result<()> {
    let store = args.store.open()?;
    let id: FileId = args.file_id.parse()?;

    let file = store.catalog().get(&id)?;
    let mut content = store
        .blobs()
        .get(&file.digest)
        .await
        .with_context(|| format!("Content of {id} is unavailable"))?;

    let mut out = tokio::fs::File::create(&args.dest)
        .await
        .with_context(|| format!("Failed to create {}", args.dest.display()))?;

    let mut written = 0u64;
    while let Some(chunk) = content.next().await {
        let chunk = chunk?;
        out.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    // Ensure all data is written to disk
    out.flush().await?;
    out.sync_all().await?;

    if written != file.size {
        anyhow::bail!(
            "Short read for {id}: expected {} bytes, wrote {written}",
            file.size
        );
    }
    println!("Wrote {} ({written} bytes) to {}", file.name, args.dest.display());
    Ok(())
}
