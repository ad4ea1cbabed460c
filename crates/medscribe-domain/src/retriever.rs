//! History-aware retrieval of related prior reports.

use std::sync::Arc;

use tracing::{debug, warn};

use medscribe_llm::{CompletionRequest, Message, SharedBackend};
use medscribe_store::{Passage, SharedVectorIndex};
use medscribe_types::{ConversationTurn, HasRetrievalConfig, RetrievalConfigProvider};

use crate::error::{DomainError, Result};
use crate::prompt::PromptAssembler;

/// Upper bound on tokens for a rewritten query.
const CONDENSE_MAX_TOKENS: u32 = 256;

/// A search query derived from the latest input and prior turns. Not persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalQuery {
    pub text: String,
    /// True when the model rewrote the input using history.
    pub condensed: bool,
}

/// Relevance-ranked passages for one query, capped at top-k.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievedContext {
    pub passages: Vec<Passage>,
    /// Set when the index could not be reached and the context is empty by degradation.
    pub degraded: bool,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    /// Passage texts, most relevant first.
    pub fn texts(&self) -> Vec<String> {
        self.passages.iter().map(|p| p.text.clone()).collect()
    }
}

/// Turns input and history into a query and fetches context from the index.
#[derive(Clone)]
pub struct Retriever {
    backend: SharedBackend,
    index: SharedVectorIndex,
    assembler: Arc<PromptAssembler>,
    config: RetrievalConfigProvider,
    model: String,
}

impl Retriever {
    pub fn new(
        backend: SharedBackend,
        index: SharedVectorIndex,
        assembler: Arc<PromptAssembler>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            index,
            assembler,
            config: RetrievalConfigProvider::default(),
            model: model.into(),
        }
    }

    pub fn with_config<C: HasRetrievalConfig>(mut self, config: &C) -> Self {
        self.config = RetrievalConfigProvider {
            top_k: config.top_k(),
            timeout: config.retrieval_timeout(),
            condense_queries: config.condense_queries(),
        };
        self
    }

    pub fn with_index(mut self, index: SharedVectorIndex) -> Self {
        self.index = index;
        self
    }

    pub fn with_assembler(mut self, assembler: Arc<PromptAssembler>) -> Self {
        self.assembler = assembler;
        self
    }

    /// Model used for query rewriting.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn top_k(&self) -> usize {
        self.config.top_k
    }

    /// Build the search query for `latest_input`.
    ///
    /// With no history the raw input is used as-is. Otherwise the generation
    /// service rewrites it into a standalone query; if that fails the raw
    /// input is used.
    pub async fn build_query(
        &self,
        latest_input: &str,
        history: &[ConversationTurn],
    ) -> RetrievalQuery {
        let raw = RetrievalQuery {
            text: latest_input.to_string(),
            condensed: false,
        };
        if history.is_empty() || !self.config.condense_queries {
            return raw;
        }

        let prompt = match self.assembler.render_condense(latest_input, history) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(error = %e, "Query condense template failed, using raw input");
                return raw;
            }
        };

        let request = CompletionRequest::new(
            self.model.clone(),
            vec![Message::user(prompt)],
            CONDENSE_MAX_TOKENS,
        )
        .with_temperature(0.0);

        match self.backend.complete(request).await {
            Ok(response) => {
                let text = response.text().trim().to_string();
                if text.is_empty() {
                    warn!("Query rewrite returned empty text, using raw input");
                    return raw;
                }
                debug!(query_len = text.len(), "Condensed retrieval query");
                RetrievalQuery {
                    text,
                    condensed: true,
                }
            }
            Err(e) => {
                warn!(error = %e, "Query rewrite failed, using raw input");
                raw
            }
        }
    }

    /// Query the index once, bounded by the configured timeout.
    pub async fn fetch(&self, query: &RetrievalQuery, top_k: usize) -> Result<RetrievedContext> {
        let timeout = self.config.timeout;
        match tokio::time::timeout(timeout, self.index.similarity_search(&query.text, top_k)).await
        {
            Ok(Ok(mut passages)) => {
                passages.truncate(top_k);
                Ok(RetrievedContext {
                    passages,
                    degraded: false,
                })
            }
            Ok(Err(e)) => Err(DomainError::RetrievalUnavailable(e.to_string())),
            Err(_) => Err(DomainError::RetrievalUnavailable(format!(
                "vector index did not answer within {:?}",
                timeout
            ))),
        }
    }

    /// Build the query and fetch context, degrading to an empty context when
    /// the index is unavailable.
    pub async fn retrieve(
        &self,
        latest_input: &str,
        history: &[ConversationTurn],
    ) -> RetrievedContext {
        let query = self.build_query(latest_input, history).await;

        match self.fetch(&query, self.config.top_k).await {
            Ok(context) => {
                debug!(
                    passages = context.len(),
                    condensed = query.condensed,
                    "Retrieved context"
                );
                context
            }
            Err(e) => {
                warn!(reason = %e, "Retrieval degraded to empty context");
                RetrievedContext {
                    passages: Vec::new(),
                    degraded: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use medscribe_llm::{LlmError, MockBackend};
    use medscribe_store::MockVectorIndex;

    fn retriever(backend: MockBackend, index: MockVectorIndex) -> (Retriever, Arc<MockBackend>, Arc<MockVectorIndex>) {
        let backend = Arc::new(backend);
        let index = Arc::new(index);
        let retriever = Retriever::new(
            backend.clone(),
            index.clone(),
            Arc::new(PromptAssembler::new()),
            "test-model",
        );
        (retriever, backend, index)
    }

    #[tokio::test]
    async fn test_empty_history_uses_raw_input_without_model_call() {
        let (retriever, backend, _) = retriever(MockBackend::new(vec![]), MockVectorIndex::default());
        let query = retriever.build_query("chest pain", &[]).await;

        assert_eq!(query.text, "chest pain");
        assert!(!query.condensed);
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_history_condenses_query() {
        let (retriever, backend, _) = retriever(
            MockBackend::with_text("  echocardiogram findings for chest pain patient \n"),
            MockVectorIndex::default(),
        );
        let history = vec![ConversationTurn::user("54 year old with chest pain")];
        let query = retriever.build_query("what did the echo show?", &history).await;

        assert!(query.condensed);
        assert_eq!(query.text, "echocardiogram findings for chest pain patient");

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        let prompt = requests[0].last_user_text().unwrap();
        assert!(prompt.contains("54 year old with chest pain"));
        assert!(prompt.contains("what did the echo show?"));
    }

    #[tokio::test]
    async fn test_failed_rewrite_falls_back_to_raw_input() {
        let (retriever, _, _) = retriever(
            MockBackend::new(vec![]).push_error(LlmError::Network("down".into())),
            MockVectorIndex::default(),
        );
        let history = vec![ConversationTurn::user("earlier")];
        let query = retriever.build_query("latest", &history).await;
        assert_eq!(query.text, "latest");
        assert!(!query.condensed);
    }

    #[tokio::test]
    async fn test_condensing_can_be_disabled() {
        let (retriever, backend, _) =
            retriever(MockBackend::with_text("rewritten"), MockVectorIndex::default());
        let retriever = retriever.with_config(&RetrievalConfigProvider {
            condense_queries: false,
            ..Default::default()
        });
        let query = retriever
            .build_query("latest", &[ConversationTurn::user("earlier")])
            .await;
        assert_eq!(query.text, "latest");
        assert_eq!(backend.request_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_caps_at_top_k_in_rank_order() {
        let (retriever, _, _) = retriever(
            MockBackend::new(vec![]),
            MockVectorIndex::new(["most", "second", "third", "fourth", "fifth"]),
        );
        let query = RetrievalQuery {
            text: "q".into(),
            condensed: false,
        };
        let context = retriever.fetch(&query, 3).await.unwrap();
        assert_eq!(context.texts(), vec!["most", "second", "third"]);
    }

    #[tokio::test]
    async fn test_fetch_unreachable_index_is_retrieval_unavailable() {
        let (retriever, _, _) = retriever(MockBackend::new(vec![]), MockVectorIndex::unavailable());
        let query = RetrievalQuery {
            text: "q".into(),
            condensed: false,
        };
        assert!(matches!(
            retriever.fetch(&query, 4).await,
            Err(DomainError::RetrievalUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_times_out() {
        let (retriever, _, _) = retriever(
            MockBackend::new(vec![]),
            MockVectorIndex::new(["slow"]).with_delay(Duration::from_secs(60)),
        );
        let retriever = retriever.with_config(&RetrievalConfigProvider {
            timeout: Duration::from_millis(100),
            ..Default::default()
        });

        let query = RetrievalQuery {
            text: "q".into(),
            condensed: false,
        };
        let err = retriever.fetch(&query, 4).await.unwrap_err();
        assert!(err.to_string().contains("did not answer"));
    }

    #[tokio::test]
    async fn test_retrieve_degrades_to_empty_context() {
        let (retriever, _, index) =
            retriever(MockBackend::new(vec![]), MockVectorIndex::unavailable());
        let context = retriever.retrieve("chest pain", &[]).await;

        assert!(context.is_empty());
        assert!(context.degraded);
        assert_eq!(index.queries(), vec!["chest pain".to_string()]);
    }

    #[tokio::test]
    async fn test_retrieve_uses_default_top_k() {
        let (retriever, _, _) = retriever(
            MockBackend::new(vec![]),
            MockVectorIndex::new(["a", "b", "c", "d", "e", "f"]),
        );
        let context = retriever.retrieve("q", &[]).await;
        assert_eq!(context.len(), 4);
        assert!(!context.degraded);
    }
}
