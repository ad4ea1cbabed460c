//! Common test utilities for integration tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::Client;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use medscribe_domain::{PersistenceFinalizer, ReportOrchestrator};
use medscribe_llm::{MockBackend, MockEmbedder};
use medscribe_session::{SessionStore, StoreConfig};
use medscribe_store::{SqliteDocumentStore, SqliteVectorIndex, VectorIndex};
use medscribe_server::{Server, ServerConfig};

/// A server backed by SQLite stores in a temp directory, running in the background.
pub struct TestServer {
    pub addr: SocketAddr,
    pub client: Client,
    pub documents: Arc<SqliteDocumentStore>,
    pub index: Arc<SqliteVectorIndex>,
    _handle: JoinHandle<()>,
    pub temp_dir: TempDir,
}

impl TestServer {
    /// Start a server whose generation backend is `backend`.
    pub async fn start(backend: MockBackend, prior_reports: &[&str]) -> Result<Self> {
        let temp_dir = TempDir::new()?;
        let addr = find_available_port().await?;

        let documents = Arc::new(SqliteDocumentStore::open(temp_dir.path().join("medscribe.db"))?);
        let index = Arc::new(SqliteVectorIndex::open(
            temp_dir.path().join("vectors.db"),
            Arc::new(MockEmbedder::new(64)),
        )?);
        for report in prior_reports {
            index.add_document(report, Some("seed")).await?;
        }

        let finalizer =
            PersistenceFinalizer::new(documents.clone()).with_report_indexing(index.clone());
        let orchestrator = ReportOrchestrator::new(
            SessionStore::new(StoreConfig::default()),
            Arc::new(backend),
            index.clone(),
            documents.clone(),
        )
        .with_finalizer(finalizer);

        let config = ServerConfig::new()
            .with_bind_address(addr)
            .with_request_logging(false);

        let server = Server::new(orchestrator, config);
        let handle = tokio::spawn(async move {
            let _ = server.run_on(addr).await;
        });

        let client = Client::new();
        wait_for_server(&client, addr).await?;

        Ok(Self {
            addr,
            client,
            documents,
            index,
            _handle: handle,
            temp_dir,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(format!("{}{}", self.base_url(), path))
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(format!("{}{}", self.base_url(), path))
    }
}

/// Find an available port for the test server.
async fn find_available_port() -> Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

/// Wait for the server to become ready.
async fn wait_for_server(client: &Client, addr: SocketAddr) -> Result<()> {
    let url = format!("http://{}/health", addr);

    let result = timeout(Duration::from_secs(5), async {
        loop {
            match client.get(&url).send().await {
                Ok(resp) if resp.status().is_success() => return,
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
    })
    .await;

    match result {
        Ok(()) => Ok(()),
        Err(_) => anyhow::bail!("Timeout waiting for server to start"),
    }
}
