use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use super::index::{IndexConfig, IndexSnapshot, VectorIndex};
use crate::error::{ChatError, ChatResult};

/// A stored text with free-form metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A document and its embedding, ready to index
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedDocument {
    pub document: Document,
    pub embedding: Vec<f32>,
}

impl EmbeddedDocument {
    pub fn new(document: Document, embedding: Vec<f32>) -> Self {
        Self {
            document,
            embedding,
        }
    }
}

#[derive(Debug, Clone)]
struct State {
    index: VectorIndex,
    documents: HashMap<u64, Document>,
}

impl State {
    fn empty(config: IndexConfig) -> Self {
        Self {
            index: VectorIndex::new(config),
            documents: HashMap::new(),
        }
    }

    fn next_label(&self) -> u64 {
        self.documents.keys().max().map_or(0, |max| max + 1)
    }
}

/// On-disk form of the index. `generation` pairs it with its documents file.
#[derive(Serialize, Deserialize)]
struct IndexFile {
    generation: String,
    snapshot: IndexSnapshot,
}

/// On-disk form of the label → document mapping
#[derive(Serialize, Deserialize)]
struct DocumentsFile {
    generation: String,
    documents: Vec<(u64, Document)>,
}

/// A vector index paired with the documents its labels point at, persisted
/// under a caller-chosen identifier.
///
/// Mutations hold the write lock for their whole duration, so a search sees
/// either the state before a `set` or the state after it.
#[derive(Debug)]
pub struct DocumentStore {
    identifier: String,
    dimensions: usize,
    index_path: PathBuf,
    documents_path: PathBuf,
    state: RwLock<State>,
}

impl DocumentStore {
    /// Load the store for `identifier`, or start an empty one.
    pub async fn open(
        dir: impl AsRef<Path>,
        identifier: impl Into<String>,
        config: IndexConfig,
    ) -> ChatResult<Self> {
        let identifier = identifier.into();
        match Self::load(dir.as_ref(), identifier.clone()).await {
            Ok(store) => Ok(store),
            Err(ChatError::IndexNotFound { .. }) => {
                tracing::debug!("creating document store {identifier}");
                let (index_path, documents_path) = store_paths(dir.as_ref(), &identifier);
                Ok(Self {
                    identifier,
                    dimensions: config.dimensions,
                    index_path,
                    documents_path,
                    state: RwLock::new(State::empty(config)),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Load a persisted store. `IndexNotFound` if it was never written.
    pub async fn load(dir: impl AsRef<Path>, identifier: impl Into<String>) -> ChatResult<Self> {
        let identifier = identifier.into();
        let (index_path, documents_path) = store_paths(dir.as_ref(), &identifier);
        if !tokio::fs::try_exists(&index_path).await? || !tokio::fs::try_exists(&documents_path).await? {
            return Err(ChatError::IndexNotFound { identifier });
        }

        let index_file: IndexFile =
            serde_json::from_str(&tokio::fs::read_to_string(&index_path).await?)?;
        let file: DocumentsFile =
            serde_json::from_str(&tokio::fs::read_to_string(&documents_path).await?)?;
        if index_file.generation != file.generation {
            return Err(ChatError::IndexCorrupted {
                identifier,
                message: format!(
                    "index generation {} does not match documents generation {}",
                    index_file.generation, file.generation
                ),
            });
        }
        let index = VectorIndex::restore(index_file.snapshot)?;
        tracing::info!(
            "loaded document store {identifier} ({} records)",
            index.len()
        );

        Ok(Self {
            identifier,
            dimensions: index.dimensions(),
            index_path,
            documents_path,
            state: RwLock::new(State {
                index,
                documents: file.documents.into_iter().collect(),
            }),
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Length of every embedding the store accepts
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.documents.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Replace every record. Nothing changes if any embedding has the wrong
    /// dimensionality or the new state cannot be written.
    pub async fn set(&self, records: Vec<EmbeddedDocument>) -> ChatResult<()> {
        let mut state = self.state.write().await;

        let mut rebuilt = State::empty(state.index.config().clone());
        for record in &records {
            rebuilt.index.check_dimensions(&record.embedding)?;
        }
        for (label, record) in records.into_iter().enumerate() {
            let label = label as u64;
            rebuilt.index.add(label, &record.embedding)?;
            rebuilt.documents.insert(label, record.document);
        }

        self.persist(&rebuilt).await?;
        tracing::info!(
            "rebuilt document store {} ({} records)",
            self.identifier,
            rebuilt.documents.len()
        );
        *state = rebuilt;
        Ok(())
    }

    /// Append records after the current highest label.
    pub async fn add(&self, records: Vec<EmbeddedDocument>) -> ChatResult<()> {
        let mut state = self.state.write().await;
        for record in &records {
            state.index.check_dimensions(&record.embedding)?;
        }

        let mut next = state.clone();
        let first = next.next_label();
        for (offset, record) in records.into_iter().enumerate() {
            let label = first + offset as u64;
            next.index.add(label, &record.embedding)?;
            next.documents.insert(label, record.document);
        }
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    pub async fn clear(&self) -> ChatResult<()> {
        let mut state = self.state.write().await;
        let next = State::empty(state.index.config().clone());
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    /// The `k` nearest documents with their distances, closest first.
    pub async fn search(&self, embedding: &[f32], k: usize) -> ChatResult<Vec<(Document, f32)>> {
        let state = self.state.read().await;
        let hits = state.index.search(embedding, k)?;
        Ok(hits
            .into_iter()
            .filter_map(|(label, distance)| {
                state
                    .documents
                    .get(&label)
                    .map(|doc| (doc.clone(), distance))
            })
            .collect())
    }

    async fn persist(&self, state: &State) -> ChatResult<()> {
        let mut documents: Vec<(u64, Document)> = state
            .documents
            .iter()
            .map(|(label, doc)| (*label, doc.clone()))
            .collect();
        documents.sort_by_key(|(label, _)| *label);

        // a crash between the two renames leaves mismatched generations, which load rejects
        let generation = uuid::Uuid::new_v4().to_string();
        let index_file = IndexFile {
            generation: generation.clone(),
            snapshot: state.index.snapshot(),
        };
        let documents_file = DocumentsFile {
            generation,
            documents,
        };
        write_atomic(&self.index_path, &serde_json::to_vec(&index_file)?).await?;
        write_atomic(&self.documents_path, &serde_json::to_vec(&documents_file)?).await?;
        tracing::debug!("persisted document store {}", self.identifier);
        Ok(())
    }
}

fn store_paths(dir: &Path, identifier: &str) -> (PathBuf, PathBuf) {
    let hash = format!("{:x}", Sha256::digest(identifier.as_bytes()));
    (
        dir.join(format!("{hash}.index.json")),
        dir.join(format!("{hash}.documents.json")),
    )
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> ChatResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(text: &str, embedding: &[f32]) -> EmbeddedDocument {
        EmbeddedDocument::new(Document::new(text), embedding.to_vec())
    }

    #[tokio::test]
    async fn set_then_search() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), "project", IndexConfig::new(2))
            .await
            .unwrap();
        store
            .set(vec![record("a", &[0.0, 0.0]), record("b", &[1.0, 1.0])])
            .await
            .unwrap();

        let hits = store.search(&[1.0, 1.0], 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.content, "b");
        assert_eq!(hits[0].1, 0.0);
    }

    #[tokio::test]
    async fn set_replaces_previous_records() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), "p", IndexConfig::new(1))
            .await
            .unwrap();
        store.set(vec![record("old", &[0.0])]).await.unwrap();
        store.set(vec![record("new", &[5.0])]).await.unwrap();

        assert_eq!(store.len().await, 1);
        let hits = store.search(&[0.0], 5).await.unwrap();
        assert_eq!(hits[0].0.content, "new");
    }

    #[tokio::test]
    async fn add_appends_after_max_label() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), "p", IndexConfig::new(1))
            .await
            .unwrap();
        store
            .set(vec![record("a", &[0.0]), record("b", &[1.0])])
            .await
            .unwrap();
        store.add(vec![record("c", &[2.0])]).await.unwrap();

        assert_eq!(store.len().await, 3);
        let hits = store.search(&[2.0], 1).await.unwrap();
        assert_eq!(hits[0].0.content, "c");
    }

    #[tokio::test]
    async fn bad_dimension_applies_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), "p", IndexConfig::new(2))
            .await
            .unwrap();
        store.set(vec![record("keep", &[0.0, 0.0])]).await.unwrap();

        let err = store
            .add(vec![record("ok", &[1.0, 1.0]), record("bad", &[1.0])])
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::DimensionMismatch { .. }));
        assert_eq!(store.len().await, 1);

        assert!(store.set(vec![record("bad", &[1.0, 2.0, 3.0])]).await.is_err());
        assert_eq!(store.search(&[0.0, 0.0], 1).await.unwrap()[0].0.content, "keep");
    }

    #[tokio::test]
    async fn persisted_and_reloaded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DocumentStore::open(dir.path(), "repo", IndexConfig::new(2))
                .await
                .unwrap();
            store
                .set(vec![
                    EmbeddedDocument::new(Document::new("x").with_metadata("path", "x.rs"), vec![1.0, 0.0]),
                    record("y", &[0.0, 1.0]),
                ])
                .await
                .unwrap();
        }

        let store = DocumentStore::load(dir.path(), "repo").await.unwrap();
        assert_eq!(store.len().await, 2);
        assert_eq!(store.dimensions(), 2);
        let hits = store.search(&[1.0, 0.0], 1).await.unwrap();
        assert_eq!(hits[0].0.metadata["path"], "x.rs");
    }

    #[tokio::test]
    async fn mismatched_files_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), "repo", IndexConfig::new(1))
            .await
            .unwrap();
        store.set(vec![record("first", &[0.0])]).await.unwrap();
        let stale_index = tokio::fs::read(&store.index_path).await.unwrap();

        store
            .set(vec![record("second", &[1.0]), record("third", &[2.0])])
            .await
            .unwrap();
        // new documents next to the index from the earlier write
        tokio::fs::write(&store.index_path, stale_index).await.unwrap();

        let err = DocumentStore::load(dir.path(), "repo").await.unwrap_err();
        assert!(matches!(err, ChatError::IndexCorrupted { identifier, .. } if identifier == "repo"));
        assert!(DocumentStore::open(dir.path(), "repo", IndexConfig::new(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn failed_write_leaves_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), "p", IndexConfig::new(1))
            .await
            .unwrap();
        store.set(vec![record("keep", &[0.0])]).await.unwrap();

        // a directory in place of the documents file makes the rename fail
        tokio::fs::remove_file(&store.documents_path).await.unwrap();
        tokio::fs::create_dir(&store.documents_path).await.unwrap();

        assert!(store.add(vec![record("lost", &[1.0])]).await.is_err());
        assert!(store.clear().await.is_err());
        assert_eq!(store.len().await, 1);
        assert_eq!(store.search(&[1.0], 1).await.unwrap()[0].0.content, "keep");
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = DocumentStore::load(dir.path(), "nothing").await.unwrap_err();
        assert!(matches!(err, ChatError::IndexNotFound { identifier } if identifier == "nothing"));
    }

    #[tokio::test]
    async fn identifiers_hash_to_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let (a, _) = store_paths(dir.path(), "a/b");
        let (b, _) = store_paths(dir.path(), "a-b");
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_string_lossy().ends_with(".index.json"));
        assert_eq!(a.file_stem().unwrap().len(), 64 + ".index".len());
    }

    #[tokio::test]
    async fn clear_empties_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(dir.path(), "p", IndexConfig::new(1))
            .await
            .unwrap();
        store.set(vec![record("a", &[0.0])]).await.unwrap();
        store.clear().await.unwrap();
        assert!(store.is_empty().await);

        let reloaded = DocumentStore::load(dir.path(), "p").await.unwrap();
        assert!(reloaded.is_empty().await);
    }

    #[tokio::test]
    async fn searches_never_see_partial_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            DocumentStore::open(dir.path(), "p", IndexConfig::new(1))
                .await
                .unwrap(),
        );
        let batch = |tag: &str| -> Vec<EmbeddedDocument> {
            (0..50).map(|i| record(tag, &[i as f32])).collect()
        };
        store.set(batch("a")).await.unwrap();

        let writer = {
            let store = store.clone();
            let (a, b) = (batch("a"), batch("b"));
            tokio::spawn(async move {
                for i in 0..10 {
                    let next = if i % 2 == 0 { b.clone() } else { a.clone() };
                    store.set(next).await.unwrap();
                }
            })
        };
        for _ in 0..50 {
            let hits = store.search(&[10.0], 50).await.unwrap();
            assert_eq!(hits.len(), 50);
            assert!(hits.iter().all(|(d, _)| d.content == hits[0].0.content));
            tokio::task::yield_now().await;
        }
        writer.await.unwrap();
    }
}
