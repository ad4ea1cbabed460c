//! End-to-end report generation over HTTP against SQLite stores.

mod common;

use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;

use medscribe_llm::{MockBackend, MockStream};
use medscribe_store::{DocumentStore, VectorIndex};
use medscribe_types::ReportQuery;

#[tokio::test]
async fn test_health_returns_version() -> Result<()> {
    let server = common::TestServer::start(MockBackend::new(vec![]), &[]).await?;

    let body: serde_json::Value = server.get("/health").send().await?.json().await?;
    assert_eq!(body["status"], "ok");
    assert!(body.get("version").is_some());
    Ok(())
}

#[tokio::test]
async fn test_streamed_report_is_persisted_and_indexed() -> Result<()> {
    let server = common::TestServer::start(
        MockBackend::new(vec![]).push_stream(
            MockStream::chunks(["Chief Complaint: ", "chest pain."])
                .with_chunk_delay(Duration::from_millis(20)),
        ),
        &["Echocardiogram normal, EF 60%."],
    )
    .await?;

    let response = server
        .post("/api/v1/reports/stream")
        .json(&serde_json::json!({
            "kind": "generation",
            "metadata": {"patient_name": "Jane Doe", "file_number": "F-100"},
            "instruction": "54F with chest pain",
            "author": "dr.grey"
        }))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 200);
    let session_id = response
        .headers()
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_default();
    assert!(!session_id.is_empty());

    let mut pieces = Vec::new();
    let mut body = response.bytes_stream();
    while let Some(piece) = body.next().await {
        pieces.push(String::from_utf8(piece?.to_vec())?);
    }
    assert_eq!(pieces.concat(), "Chief Complaint: chest pain.");

    let found = server
        .documents
        .find(&ReportQuery {
            file_number: Some("F-100".into()),
            ..Default::default()
        })
        .await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].text, "Chief Complaint: chest pain.");
    assert_eq!(found[0].author.as_deref(), Some("dr.grey"));

    assert_eq!(server.index.count().await?, 2);

    let history: serde_json::Value = server
        .get(&format!("/api/v1/sessions/{session_id}"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(history["turn_count"], 2);
    assert_eq!(history["turns"][0]["role"], "user");
    assert_eq!(history["turns"][1]["content"], "Chief Complaint: chest pain.");
    Ok(())
}

#[tokio::test]
async fn test_failed_generation_records_incident_only() -> Result<()> {
    let server = common::TestServer::start(
        MockBackend::new(vec![])
            .push_stream(MockStream::chunks(["The patient"]).failing_with("upstream reset")),
        &[],
    )
    .await?;

    let text = server
        .post("/api/v1/reports/stream")
        .json(&serde_json::json!({"kind": "correction", "instruction": "fix typos"}))
        .send()
        .await?
        .text()
        .await?;
    assert!(text.starts_with("The patient\n[[medscribe:error:generation_failed]]"));

    assert!(server.documents.find(&ReportQuery::default()).await?.is_empty());
    let incidents = server.documents.incidents(10).await?;
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].streamed_bytes, "The patient".len());
    Ok(())
}
