use std::sync::Arc;

use crate::config::CollectionScope;
use crate::embedder::Embedder;
use crate::error::Result;
use crate::vector_db::{ChunkPayload, Page, VectorIndex};

/// A chunk handed to the model as context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedChunk {
    pub source: String,
    pub page: Page,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq)]
struct Candidate {
    collection: String,
    score: f32,
    payload: ChunkPayload,
}

pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    scope: CollectionScope,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        scope: CollectionScope,
    ) -> Self {
        Retriever {
            embedder,
            index,
            scope,
        }
    }

    /// Collections searched for every query, sorted by name.
    pub async fn collections(&self) -> Result<Vec<String>> {
        let mut names = match &self.scope {
            CollectionScope::All => self.index.list_collections().await?,
            CollectionScope::Only(names) => names.clone(),
        };
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Searches each collection for `top_k` hits and keeps the global best `top_k`.
    ///
    /// Failing to embed the query fails the whole retrieval. A collection whose
    /// search fails is skipped; the error surfaces only when no collection
    /// could be searched.
    pub async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<RetrievedChunk>> {
        if top_k == 0 || query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed(query).await?;

        let collections = self.collections().await?;
        let mut candidates = Vec::new();
        let mut searched = 0usize;
        let mut first_error = None;
        for collection in &collections {
            match self.index.search(collection, &vector, top_k).await {
                Ok(hits) => {
                    searched += 1;
                    tracing::debug!(collection = %collection, hits = hits.len(), "searched collection");
                    candidates.extend(hits.into_iter().map(|hit| Candidate {
                        collection: collection.clone(),
                        score: hit.score,
                        payload: hit.payload,
                    }));
                }
                Err(err) => {
                    tracing::warn!(collection = %collection, error = %err, "skipping collection that failed to search");
                    first_error.get_or_insert(err);
                }
            }
        }
        if searched == 0 {
            if let Some(err) = first_error {
                return Err(err);
            }
        }

        let ranked = rank(candidates, top_k);
        for candidate in &ranked {
            tracing::debug!(
                collection = %candidate.collection,
                source = %candidate.payload.source,
                page = %candidate.payload.page,
                score = candidate.score,
                "retrieved chunk"
            );
        }
        Ok(ranked
            .into_iter()
            .map(|candidate| RetrievedChunk {
                source: candidate.payload.source,
                page: candidate.payload.page,
                content: candidate.payload.content,
            })
            .collect())
    }
}

/// Orders candidates by descending score and keeps the first `top_k`.
///
/// The sort is stable, so equal scores keep their arrival order: collection
/// name, then the rank the index gave them.
fn rank(mut candidates: Vec<Candidate>, top_k: usize) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
    candidates.truncate(top_k);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EMBEDDING_DIM;
    use crate::embedder::testing::HashingEmbedder;
    use crate::vector_db::memory::MemoryIndex;
    use crate::error::{RagError, Service};
    use crate::vector_db::{IndexEntry, PointId, ScoredEntry, StoredEntry};
    use async_trait::async_trait;
    use ndarray::Array1;
    use reqwest::StatusCode;

    fn candidate(collection: &str, score: f32, content: &str) -> Candidate {
        Candidate {
            collection: collection.to_string(),
            score,
            payload: ChunkPayload {
                content: content.to_string(),
                source: format!("{collection}/{content}"),
                page: Page::Number(1),
                title: None,
            },
        }
    }

    #[test]
    fn test_rank_keeps_global_top_k() {
        let candidates = vec![
            candidate("docs", 0.91, "a"),
            candidate("docs", 0.72, "b"),
            candidate("docs", 0.40, "c"),
            candidate("legislacao_brasil", 0.95, "d"),
            candidate("legislacao_brasil", 0.80, "e"),
            candidate("legislacao_brasil", 0.10, "f"),
        ];
        let ranked = rank(candidates, 3);
        let contents: Vec<&str> = ranked.iter().map(|c| c.payload.content.as_str()).collect();
        assert_eq!(contents, vec!["d", "a", "e"]);
    }

    #[test]
    fn test_rank_ties_keep_arrival_order() {
        let candidates = vec![
            candidate("a_collection", 0.5, "first"),
            candidate("b_collection", 0.5, "second"),
            candidate("b_collection", 0.5, "third"),
        ];
        let ranked = rank(candidates, 2);
        assert_eq!(ranked[0].payload.content, "first");
        assert_eq!(ranked[1].payload.content, "second");
    }

    async fn seed(index: &MemoryIndex, embedder: &HashingEmbedder, collection: &str, texts: &[&str]) {
        index.ensure_collection(collection, EMBEDDING_DIM).await.unwrap();
        let mut entries = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            entries.push(IndexEntry {
                id: PointId::Num(i as u64),
                vector: embedder.embed(text).await.unwrap(),
                payload: ChunkPayload {
                    content: text.to_string(),
                    source: format!("{collection}.pdf"),
                    page: Page::Number(i as u32 + 1),
                    title: None,
                },
            });
        }
        index.upsert(collection, entries).await.unwrap();
    }

    #[tokio::test]
    async fn test_retrieve_merges_all_collections() {
        let index = Arc::new(MemoryIndex::new());
        let embedder = Arc::new(HashingEmbedder::new());
        seed(
            &index,
            &embedder,
            "docs",
            &["prazo prescricional trabalhista", "prazo de recurso", "aviso prévio"],
        )
        .await;
        seed(
            &index,
            &embedder,
            "legislacao_brasil",
            &["prazo prescricional", "férias", "prazo prescricional trabalhista dois anos"],
        )
        .await;

        let retriever = Retriever::new(embedder.clone(), index.clone(), CollectionScope::All);
        let results = retriever
            .retrieve("prazo prescricional trabalhista", 3)
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].content, "prazo prescricional trabalhista");
        let sources: Vec<&str> = results.iter().map(|r| r.source.as_str()).collect();
        assert!(sources.contains(&"legislacao_brasil.pdf"));

        let query = embedder.embed("prazo prescricional trabalhista").await.unwrap();
        let mut previous = f32::INFINITY;
        for result in &results {
            let score = crate::embedder::cosine_similarity(
                &embedder.embed(&result.content).await.unwrap(),
                &query,
            );
            assert!(score <= previous + 1e-6);
            previous = score;
        }
    }

    #[tokio::test]
    async fn test_retrieve_respects_collection_scope() {
        let index = Arc::new(MemoryIndex::new());
        let embedder = Arc::new(HashingEmbedder::new());
        seed(&index, &embedder, "docs", &["multa contratual"]).await;
        seed(&index, &embedder, "legislacao_brasil", &["multa contratual"]).await;

        let retriever = Retriever::new(
            embedder,
            index,
            CollectionScope::Only(vec!["docs".to_string(), "docs".to_string()]),
        );
        assert_eq!(retriever.collections().await.unwrap(), vec!["docs".to_string()]);
        let results = retriever.retrieve("multa contratual", 5).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "docs.pdf");
    }

    #[tokio::test]
    async fn test_query_embedding_failure_aborts() {
        let index = Arc::new(MemoryIndex::new());
        let embedder = Arc::new(HashingEmbedder::failing_on("falha"));
        let retriever = Retriever::new(embedder, index, CollectionScope::All);
        let err = retriever.retrieve("falha na consulta", 3).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_empty_index_returns_nothing() {
        let retriever = Retriever::new(
            Arc::new(HashingEmbedder::new()),
            Arc::new(MemoryIndex::new()),
            CollectionScope::Only(vec!["docs".to_string()]),
        );
        assert!(retriever.retrieve("qualquer coisa", 3).await.unwrap().is_empty());
        assert!(retriever.retrieve("   ", 3).await.unwrap().is_empty());
    }

    /// Delegates to a [`MemoryIndex`] but rejects searches of one collection.
    struct RejectingIndex {
        inner: MemoryIndex,
        rejected: &'static str,
    }

    #[async_trait]
    impl VectorIndex for RejectingIndex {
        async fn list_collections(&self) -> Result<Vec<String>> {
            let mut names = self.inner.list_collections().await?;
            names.push(self.rejected.to_string());
            Ok(names)
        }

        async fn ensure_collection(&self, collection: &str, dimension: usize) -> Result<()> {
            self.inner.ensure_collection(collection, dimension).await
        }

        async fn upsert(&self, collection: &str, entries: Vec<IndexEntry>) -> Result<()> {
            self.inner.upsert(collection, entries).await
        }

        async fn search(
            &self,
            collection: &str,
            vector: &Array1<f32>,
            limit: usize,
        ) -> Result<Vec<ScoredEntry>> {
            if collection == self.rejected {
                return Err(RagError::Service {
                    service: Service::VectorIndex,
                    status: StatusCode::BAD_REQUEST,
                    message: "Vector dimension error: expected dim: 768, got 1536".to_string(),
                });
            }
            self.inner.search(collection, vector, limit).await
        }

        async fn scroll(&self, collection: &str, page_size: usize) -> Result<Vec<StoredEntry>> {
            self.inner.scroll(collection, page_size).await
        }

        async fn delete_by_source(&self, collection: &str, source: &str) -> Result<()> {
            self.inner.delete_by_source(collection, source).await
        }
    }

    #[tokio::test]
    async fn test_failing_collection_is_skipped() {
        let embedder = Arc::new(HashingEmbedder::new());
        let inner = MemoryIndex::new();
        seed(&inner, &embedder, "docs", &["responsabilidade civil objetiva"]).await;
        let index = Arc::new(RejectingIndex {
            inner,
            rejected: "embeddings_768",
        });

        let retriever = Retriever::new(embedder, index, CollectionScope::All);
        let results = retriever
            .retrieve("responsabilidade civil", 3)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].source, "docs.pdf");
    }

    #[tokio::test]
    async fn test_error_when_no_collection_could_be_searched() {
        let index = Arc::new(RejectingIndex {
            inner: MemoryIndex::new(),
            rejected: "embeddings_768",
        });
        let retriever = Retriever::new(
            Arc::new(HashingEmbedder::new()),
            index,
            CollectionScope::All,
        );
        let err = retriever.retrieve("responsabilidade civil", 3).await.unwrap_err();
        assert!(matches!(
            err,
            RagError::Service {
                status: StatusCode::BAD_REQUEST,
                ..
            }
        ));
    }
}
