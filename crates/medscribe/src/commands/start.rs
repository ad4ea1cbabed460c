//! Start command - launches the Medscribe server.

use std::net::SocketAddr;

use anyhow::{Context as _, Result};
use clap::Args;

use medscribe_server::{Server, ServerConfig};

use super::Context;
use crate::pipeline::{self, PipelineArgs};

/// Arguments for the start command.
///
/// CLI arguments override config file values.
#[derive(Args, Debug)]
pub struct StartArgs {
    /// Port to listen on (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind to (overrides config)
    #[arg(short, long)]
    pub bind: Option<String>,

    #[command(flatten)]
    pub pipeline: PipelineArgs,
}

/// Run the start command.
pub async fn run(args: StartArgs, ctx: &Context) -> Result<()> {
    let config = pipeline::load(&args.pipeline)?;
    let server_section = config.server_or_default();

    let bind = args.bind.clone().unwrap_or(server_section.bind.clone());
    let port = args.port.unwrap_or(server_section.port);
    let bind_address: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", bind, port))?;

    let built = pipeline::build(config, &args.pipeline)?;

    let cleanup = built.orchestrator.sessions().spawn_cleanup_task();
    if cleanup.is_some() {
        tracing::debug!("Session cleanup task started");
    }

    let server_config = ServerConfig::new()
        .with_bind_address(bind_address)
        .with_request_logging(server_section.request_logging)
        .with_cors_origins(server_section.cors_origins.clone())
        .with_max_body_size(server_section.max_body_size);

    if ctx.verbose {
        println!("Template version: {}", built.orchestrator.template_version());
        println!("Indexed passages: {}", built.index.count().await.unwrap_or(0));
    }
    if !ctx.json_output {
        println!("Medscribe listening on http://{}", bind_address);
    }

    let server = Server::new(built.orchestrator, server_config);
    server.run().await?;

    if let Some(handle) = cleanup {
        handle.abort();
    }
    Ok(())
}
