use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::{ChatContext, ContextCollector, RetrievedContent, Scope};
use crate::change::ChangeDetector;
use crate::config::ChatConfig;
use crate::error::{ChatError, ChatResult};
use crate::provider::EmbeddingProvider;
use crate::types::{Message, Reference};
use crate::vector::{Document, DocumentStore, EmbeddedDocument, TextSplitter};

/// Looks the new message up in a [`DocumentStore`] and offers the nearest
/// documents as retrieved content, closest first.
pub struct RetrievalCollector {
    store: Arc<DocumentStore>,
    embedder: Arc<dyn EmbeddingProvider>,
    top_k: usize,
    required_scope: Option<Scope>,
}

impl RetrievalCollector {
    /// Fails with `DimensionMismatch` when the embedder's vectors would not
    /// fit the store's index.
    pub fn new(
        store: Arc<DocumentStore>,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> ChatResult<Self> {
        if embedder.dimensions() != store.dimensions() {
            return Err(ChatError::DimensionMismatch {
                expected: store.dimensions(),
                actual: embedder.dimensions(),
            });
        }
        Ok(Self {
            store,
            embedder,
            top_k: 5,
            required_scope: None,
        })
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    /// Only run when the user asks for `scope`.
    pub fn with_required_scope(mut self, scope: Scope) -> Self {
        self.required_scope = Some(scope);
        self
    }
}

#[async_trait]
impl ContextCollector for RetrievalCollector {
    async fn generate_context(
        &self,
        _history: &[Message],
        scopes: &HashSet<Scope>,
        content: &str,
        _config: &ChatConfig,
    ) -> ChatResult<ChatContext> {
        if let Some(scope) = self.required_scope {
            if !scopes.contains(&scope) {
                return Ok(ChatContext::default());
            }
        }
        if content.trim().is_empty() || self.top_k == 0 {
            return Ok(ChatContext::default());
        }

        let embedding = self.embedder.embed(content).await?;
        let hits = self.store.search(&embedding, self.top_k).await?;
        tracing::debug!(
            "retrieved {} documents from {}",
            hits.len(),
            self.store.identifier()
        );

        let count = hits.len();
        let retrieved_content = hits
            .into_iter()
            .enumerate()
            .map(|(rank, (document, _distance))| {
                RetrievedContent::new(reference_for(document, rank), (count - rank) as i32)
            })
            .collect();
        Ok(ChatContext {
            retrieved_content,
            ..ChatContext::default()
        })
    }
}

fn reference_for(document: Document, rank: usize) -> Reference {
    let title = document
        .metadata
        .get("title")
        .or_else(|| document.metadata.get("path"))
        .cloned()
        .unwrap_or_else(|| format!("Document {rank}"));
    let uri = document
        .metadata
        .get("uri")
        .or_else(|| document.metadata.get("path"))
        .cloned();
    Reference {
        title,
        content: document.content,
        uri,
    }
}

/// Split, embed and store `documents`, replacing the store's contents.
/// Returns the number of chunks stored.
pub async fn index_documents(
    store: &DocumentStore,
    embedder: &dyn EmbeddingProvider,
    splitter: &TextSplitter,
    documents: &[Document],
) -> ChatResult<usize> {
    let chunks = splitter.split_documents(documents);
    let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
    let embeddings = embedder.embed_batch(&texts).await?;
    if embeddings.len() != chunks.len() {
        return Err(ChatError::Embedding(format!(
            "expected {} embeddings, got {}",
            chunks.len(),
            embeddings.len()
        )));
    }

    let records: Vec<EmbeddedDocument> = chunks
        .into_iter()
        .zip(embeddings)
        .map(|(document, embedding)| EmbeddedDocument::new(document, embedding))
        .collect();
    let count = records.len();
    store.set(records).await?;
    Ok(count)
}

/// Re-index the file `detector` tracks if its bytes moved since the last
/// index. Returns whether it re-indexed.
pub async fn reindex_if_changed(
    detector: &mut ChangeDetector,
    store: &DocumentStore,
    embedder: &dyn EmbeddingProvider,
    splitter: &TextSplitter,
) -> ChatResult<bool> {
    if !detector.check_changed().await {
        return Ok(false);
    }
    let bytes = tokio::fs::read(detector.path()).await?;
    let document = Document::new(String::from_utf8_lossy(&bytes))
        .with_metadata("path", detector.path().display().to_string());
    let chunks = index_documents(store, embedder, splitter, &[document]).await?;
    detector.adopt(&bytes);
    tracing::info!(
        "re-indexed {} ({chunks} chunks)",
        detector.path().display()
    );
    Ok(true)
}
