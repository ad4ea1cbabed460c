//! Ingest command - embeds prior reports into the vector index.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;

use medscribe_store::SharedVectorIndex;

use super::Context;
use crate::pipeline::{self, PipelineArgs};

/// Arguments for the ingest command.
#[derive(Args, Debug)]
pub struct IngestArgs {
    /// Report files to ingest (one report per file)
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

/// Run the ingest command.
pub async fn run(args: IngestArgs, ctx: &Context) -> Result<()> {
    let config = pipeline::load(&args.pipeline)?;
    let embedder = pipeline::build_embedder(&config)?;
    let index = pipeline::open_index(&config, embedder)?;

    let ingested = ingest_files(&index, &args.files).await?;
    let total = index.count().await?;

    if ctx.json_output {
        println!(
            "{}",
            serde_json::json!({ "ingested": ingested, "total": total })
        );
    } else {
        println!("Ingested {} report(s); index now holds {}", ingested, total);
    }
    Ok(())
}

/// Add each non-empty file as one passage. Returns how many were added.
async fn ingest_files(index: &SharedVectorIndex, files: &[PathBuf]) -> Result<usize> {
    let mut ingested = 0;
    for path in files {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let text = text.trim();
        if text.is_empty() {
            tracing::warn!(path = %path.display(), "Skipping empty file");
            continue;
        }

        let source = path.display().to_string();
        let id = index
            .add_document(text, Some(&source))
            .await
            .with_context(|| format!("indexing {}", path.display()))?;
        tracing::debug!(path = %source, passage_id = %id, "Ingested report");
        ingested += 1;
    }
    Ok(ingested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use medscribe_store::MockVectorIndex;

    #[tokio::test]
    async fn test_ingest_skips_empty_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let full = dir.path().join("a.txt");
        let empty = dir.path().join("b.txt");
        std::fs::write(&full, "  Prior echo report.\n").unwrap();
        std::fs::write(&empty, "\n").unwrap();

        let mock = Arc::new(MockVectorIndex::default());
        let index: SharedVectorIndex = mock.clone();
        let ingested = ingest_files(&index, &[full, empty]).await.unwrap();

        assert_eq!(ingested, 1);
        assert_eq!(mock.documents(), vec!["Prior echo report.".to_string()]);
    }

    #[tokio::test]
    async fn test_ingest_missing_file_fails() {
        let index: SharedVectorIndex = Arc::new(MockVectorIndex::default());
        let err = ingest_files(&index, &[PathBuf::from("/nonexistent/x.txt")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("reading"));
    }
}
