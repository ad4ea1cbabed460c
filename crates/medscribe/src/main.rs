//! Medscribe - context-aware streaming clinical report generation
//!
//! Main entry point for the Medscribe CLI.

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod pipeline;

use commands::{generate, ingest, start};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Medscribe - context-aware streaming clinical report generation
#[derive(Parser)]
#[command(name = "medscribe")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Start(start::StartArgs),

    /// Generate one report locally, printing text as it streams
    Generate(generate::GenerateArgs),

    /// Embed prior reports into the vector index
    Ingest(ingest::IngestArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

const CRATES: [&str; 7] = [
    "medscribe",
    "medscribe_config",
    "medscribe_domain",
    "medscribe_llm",
    "medscribe_server",
    "medscribe_session",
    "medscribe_store",
];

fn filter_for(level: &str, fallback: &str) -> String {
    let mut directives: Vec<String> = CRATES.iter().map(|c| format!("{c}={level}")).collect();
    directives.push(fallback.to_string());
    directives.join(",")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Console (human-readable) + rotating JSON file
    let console_filter = if cli.verbose {
        filter_for("debug", "info")
    } else {
        filter_for("info", "warn")
    };

    let log_dir = medscribe_config::user_config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| std::path::PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "medscribe.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(console_filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(filter_for("trace", "info"))),
        )
        .init();

    let ctx = commands::Context {
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Start(args) => start::run(args, &ctx).await,
        Commands::Generate(args) => generate::run(args, &ctx).await,
        Commands::Ingest(args) => ingest::run(args, &ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_lists_every_crate() {
        let filter = filter_for("debug", "info");
        assert!(filter.starts_with("medscribe=debug,"));
        assert!(filter.contains("medscribe_domain=debug"));
        assert!(filter.ends_with(",info"));
    }

    #[test]
    fn test_cli_parses_generate() {
        let cli = Cli::try_parse_from([
            "medscribe",
            "generate",
            "--kind",
            "correction",
            "--instruction",
            "fix typos",
            "--patient-name",
            "Jane Doe",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Generate(_)));
    }

    #[test]
    fn test_cli_parses_ingest() {
        let cli = Cli::try_parse_from(["medscribe", "-v", "ingest", "a.txt", "b.txt"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Ingest(args) => assert_eq!(args.files.len(), 2),
            _ => panic!("expected ingest"),
        }
    }
}
