//! Generate command - runs one report through the pipeline locally.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Args;
use futures::StreamExt;

use medscribe_domain::{GenerationRequest, StreamChunk};
use medscribe_types::{ReportMetadata, TemplateKind};

use super::Context;
use crate::pipeline::{self, PipelineArgs};

/// Arguments for the generate command.
#[derive(Args, Debug)]
pub struct GenerateArgs {
    /// Template: correction or generation
    #[arg(long, value_parser = parse_kind)]
    pub kind: TemplateKind,

    /// Instruction text (dictated report or clinical notes)
    #[arg(long, conflicts_with = "instruction_file")]
    pub instruction: Option<String>,

    /// Read the instruction from a file
    #[arg(long)]
    pub instruction_file: Option<PathBuf>,

    #[arg(long)]
    pub patient_name: Option<String>,

    #[arg(long)]
    pub age: Option<String>,

    #[arg(long)]
    pub file_number: Option<String>,

    #[arg(long)]
    pub doctor_name: Option<String>,

    #[arg(long)]
    pub department: Option<String>,

    /// Author recorded on the saved report
    #[arg(long)]
    pub author: Option<String>,

    /// Signature image to attach
    #[arg(long)]
    pub signature: Option<PathBuf>,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

fn parse_kind(value: &str) -> std::result::Result<TemplateKind, String> {
    TemplateKind::parse(value)
        .ok_or_else(|| format!("unknown kind '{}', expected correction or generation", value))
}

impl GenerateArgs {
    fn instruction(&self) -> Result<String> {
        match (&self.instruction, &self.instruction_file) {
            (Some(text), _) => Ok(text.clone()),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display())),
            (None, None) => anyhow::bail!("one of --instruction or --instruction-file is required"),
        }
    }

    fn metadata(&self) -> ReportMetadata {
        ReportMetadata {
            patient_name: self.patient_name.clone(),
            age: self.age.clone(),
            file_number: self.file_number.clone(),
            doctor_name: self.doctor_name.clone(),
            department: self.department.clone(),
        }
    }
}

/// Run the generate command.
pub async fn run(args: GenerateArgs, ctx: &Context) -> Result<()> {
    let config = pipeline::load(&args.pipeline)?;
    let built = pipeline::build(config, &args.pipeline)?;

    let mut request = GenerationRequest::new(args.kind, args.instruction()?)
        .with_metadata(args.metadata());
    if let Some(ref author) = args.author {
        request = request.with_author(author);
    }
    if let Some(ref path) = args.signature {
        let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        request = request.with_signature(bytes);
    }

    let started = built.orchestrator.stream(request).await?;
    let mut chunks = started.chunks;
    let mut stdout = std::io::stdout();
    let mut failed = false;

    while let Some(chunk) = chunks.next().await {
        match chunk {
            StreamChunk::Text { ref content } => {
                if !ctx.json_output {
                    write!(stdout, "{}", content)?;
                    stdout.flush()?;
                }
            }
            StreamChunk::Error { ref code, ref message } => {
                failed = true;
                eprintln!("\nerror [{}]: {}", code, message);
            }
            StreamChunk::Done { ref outcome } => {
                if ctx.json_output {
                    println!("{}", serde_json::to_string_pretty(outcome)?);
                } else {
                    println!();
                    if let Some(ref report) = outcome.report {
                        eprintln!("Saved report {}", report.id);
                    }
                    if let Some(ref pending_id) = outcome.pending_id {
                        eprintln!("Report not saved; parked as {}", pending_id);
                    }
                }
            }
        }
    }

    if failed {
        anyhow::bail!("report generation did not complete");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(instruction: Option<&str>, file: Option<PathBuf>) -> GenerateArgs {
        GenerateArgs {
            kind: TemplateKind::Correction,
            instruction: instruction.map(str::to_string),
            instruction_file: file,
            patient_name: Some("Jane".into()),
            age: None,
            file_number: None,
            doctor_name: None,
            department: None,
            author: None,
            signature: None,
            pipeline: PipelineArgs::default(),
        }
    }

    #[test]
    fn test_parse_kind() {
        assert_eq!(parse_kind("generation").unwrap(), TemplateKind::Generation);
        assert!(parse_kind("poem").is_err());
    }

    #[test]
    fn test_instruction_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "BP 120/80").unwrap();

        assert_eq!(args(None, Some(path)).instruction().unwrap(), "BP 120/80");
        assert!(args(None, None).instruction().is_err());
    }

    #[test]
    fn test_metadata_keeps_unset_fields_empty() {
        let metadata = args(Some("x"), None).metadata();
        assert_eq!(metadata.patient_name.as_deref(), Some("Jane"));
        assert!(metadata.age.is_none());
    }
}
