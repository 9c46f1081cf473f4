//! The indexed document set: ingestion, removal, and the local document map.
//!
//! Each collection has one lock. Writing to the index and updating the
//! document map happen while it is held, so concurrent ingestion and removal
//! never hand out the same point id or leave the map out of step with the index.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use ndarray::Array1;
use tokio::sync::Mutex;

use crate::chunker::{chunk_pages, chunk_unpaged, PageChunk};
use crate::config::{ChunkingConfig, CollectionNames};
use crate::doc_map::DocMap;
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::pdf::extract_pages;
use crate::utils::{document_source, remove_document_file, validate_document_name};
use crate::vector_db::{ChunkPayload, IndexEntry, PointId, VectorIndex};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub source: String,
    pub collection: String,
    pub chunks: usize,
    pub indexed: usize,
}

impl IngestReport {
    pub fn skipped(&self) -> usize {
        self.chunks - self.indexed
    }
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "✅ {} chunks de '{}' adicionados à coleção '{}'",
            self.indexed, self.source, self.collection
        )?;
        if self.skipped() > 0 {
            write!(f, " ({} ignorados por falha de embedding)", self.skipped())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub name: String,
    pub entries_removed: usize,
    pub file_removed: bool,
}

impl fmt::Display for DeleteReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file_removed {
            write!(
                f,
                "✅ PDF '{}' removido ({} chunks removidos do índice)",
                self.name, self.entries_removed
            )
        } else {
            write!(
                f,
                "❌ PDF '{}' não encontrado ({} chunks removidos do índice)",
                self.name, self.entries_removed
            )
        }
    }
}

pub struct KnowledgeBase {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    collections: CollectionNames,
    docs_dir: PathBuf,
    /// Mirror of the documents collection; its lock guards that collection.
    doc_map: Mutex<DocMap>,
    legislation_lock: Mutex<()>,
}

impl KnowledgeBase {
    /// Builds the knowledge base, rebuilding the document map from the index.
    pub async fn open(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        collections: CollectionNames,
        docs_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let doc_map = DocMap::rebuild(index.as_ref(), &collections.documents).await?;
        Ok(KnowledgeBase {
            embedder,
            index,
            collections,
            docs_dir: docs_dir.into(),
            doc_map: Mutex::new(doc_map),
            legislation_lock: Mutex::new(()),
        })
    }

    /// Polls the index until it answers, for services that start alongside it.
    pub async fn wait_for_index(
        index: &dyn VectorIndex,
        attempts: usize,
        delay: Duration,
    ) -> Result<Vec<String>> {
        let mut attempt = 1;
        loop {
            match index.list_collections().await {
                Ok(collections) => {
                    tracing::info!(?collections, "vector index is ready");
                    return Ok(collections);
                }
                Err(err) if err.is_retryable() && attempt < attempts => {
                    tracing::warn!(attempt, error = %err, "waiting for vector index");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub fn docs_dir(&self) -> &Path {
        &self.docs_dir
    }

    pub async fn doc_map_snapshot(&self) -> DocMap {
        self.doc_map.lock().await.clone()
    }

    /// Indexes a PDF that already sits in the documents directory.
    pub async fn add_pdf(&self, name: &str, chunking: &ChunkingConfig) -> Result<IngestReport> {
        let name = validate_document_name(name)?;
        let path = self.docs_dir.join(name);
        let task_path = path.clone();
        let pages = tokio::task::spawn_blocking(move || extract_pages(&task_path))
            .await
            .map_err(|err| RagError::Pdf {
                path,
                message: err.to_string(),
            })??;
        let source = document_source(&self.docs_dir, name);
        self.add_pages(&source, &pages, chunking).await
    }

    /// Indexes already-extracted page texts under `source`, with sequential ids.
    pub async fn add_pages(
        &self,
        source: &str,
        pages: &[String],
        chunking: &ChunkingConfig,
    ) -> Result<IngestReport> {
        let chunks = chunk_pages(pages, chunking);
        let total = chunks.len();
        let embedded = self.embed_chunks(source, chunks).await;
        let indexed = embedded.len();
        let collection = self.collections.documents.as_str();

        if !embedded.is_empty() {
            let mut doc_map = self.doc_map.lock().await;
            self.index
                .ensure_collection(collection, self.embedder.dimension())
                .await?;
            let mut entries = Vec::with_capacity(indexed);
            let mut mirrored = Vec::with_capacity(indexed);
            for (id, (chunk, vector)) in doc_map.reserve_ids(indexed).into_iter().zip(embedded) {
                let payload = ChunkPayload {
                    content: chunk.content,
                    source: source.to_string(),
                    page: chunk.page,
                    title: None,
                };
                mirrored.push((id, payload.clone()));
                entries.push(IndexEntry {
                    id: PointId::Num(id),
                    vector,
                    payload,
                });
            }
            self.index.upsert(collection, entries).await?;
            for (id, payload) in mirrored {
                doc_map.insert(id, payload);
            }
        }
        tracing::info!(source, collection, chunks = total, indexed, "document indexed");
        Ok(IngestReport {
            source: source.to_string(),
            collection: collection.to_string(),
            chunks: total,
            indexed,
        })
    }

    /// Indexes statute text into the legislation collection under random ids.
    pub async fn add_statute(
        &self,
        source_url: &str,
        title: Option<&str>,
        text: &str,
        chunking: &ChunkingConfig,
    ) -> Result<IngestReport> {
        let chunks = chunk_unpaged(text, chunking);
        let total = chunks.len();
        let embedded = self.embed_chunks(source_url, chunks).await;
        let indexed = embedded.len();
        let collection = self.collections.legislation.as_str();

        if !embedded.is_empty() {
            let entries: Vec<IndexEntry> = embedded
                .into_iter()
                .map(|(chunk, vector)| IndexEntry {
                    id: PointId::random(),
                    vector,
                    payload: ChunkPayload {
                        content: chunk.content,
                        source: source_url.to_string(),
                        page: chunk.page,
                        title: title.map(str::to_string),
                    },
                })
                .collect();
            let _guard = self.legislation_lock.lock().await;
            self.index
                .ensure_collection(collection, self.embedder.dimension())
                .await?;
            self.index.upsert(collection, entries).await?;
        }
        tracing::info!(source = source_url, collection, chunks = total, indexed, "statute indexed");
        Ok(IngestReport {
            source: source_url.to_string(),
            collection: collection.to_string(),
            chunks: total,
            indexed,
        })
    }

    /// Removes a PDF's chunks from the index and the document map, then its file.
    ///
    /// Removing a document that was never indexed is not an error.
    pub async fn delete_document(&self, name: &str) -> Result<DeleteReport> {
        let name = validate_document_name(name)?;
        let source = document_source(&self.docs_dir, name);
        let entries_removed = {
            let mut doc_map = self.doc_map.lock().await;
            self.index
                .delete_by_source(&self.collections.documents, &source)
                .await?;
            doc_map.remove_source(&source)
        };
        let file_removed = remove_document_file(&self.docs_dir, name)?;
        tracing::info!(document = name, entries_removed, file_removed, "document deleted");
        Ok(DeleteReport {
            name: name.to_string(),
            entries_removed,
            file_removed,
        })
    }

    /// Embeds each chunk, leaving out the ones the embedding service rejects.
    async fn embed_chunks(
        &self,
        source: &str,
        chunks: Vec<PageChunk>,
    ) -> Vec<(PageChunk, Array1<f32>)> {
        let mut embedded = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            match self.embedder.embed(&chunk.content).await {
                Ok(vector) => embedded.push((chunk, vector)),
                Err(err) => {
                    tracing::warn!(source, page = %chunk.page, error = %err, "skipping chunk that failed to embed");
                }
            }
        }
        embedded
    }
}
