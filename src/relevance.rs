use std::collections::BTreeSet;

use crate::embedder::{cosine_similarity, Embedder};
use crate::error::Result;
use crate::retriever::RetrievedChunk;
use crate::vector_db::Page;

/// Keeps the `(source, page)` of every chunk whose embedding is at least
/// `threshold` similar to the answer's.
///
/// Used only to pick citations. A chunk that fails to embed is left out rather
/// than failing the turn; failing to embed the answer is an error.
pub async fn filter_relevant_sources(
    embedder: &dyn Embedder,
    answer: &str,
    chunks: &[RetrievedChunk],
    threshold: f32,
) -> Result<BTreeSet<(String, Page)>> {
    let mut relevant = BTreeSet::new();
    if chunks.is_empty() {
        return Ok(relevant);
    }
    let answer_embedding = embedder.embed(answer).await?;

    for chunk in chunks {
        let similarity = if chunk.content.trim() == answer.trim() {
            1.0
        } else {
            match embedder.embed(&chunk.content).await {
                Ok(embedding) => cosine_similarity(&answer_embedding, &embedding),
                Err(err) => {
                    tracing::warn!(source = %chunk.source, error = %err, "could not embed chunk for citation check");
                    continue;
                }
            }
        };
        tracing::debug!(source = %chunk.source, page = %chunk.page, similarity, "answer similarity");
        if similarity >= threshold {
            relevant.insert((chunk.source.clone(), chunk.page));
        }
    }
    tracing::info!(sources = relevant.len(), threshold, "relevant sources selected");
    Ok(relevant)
}

/// Citation lines shown under an answer.
pub fn render_sources(sources: &BTreeSet<(String, Page)>) -> String {
    sources
        .iter()
        .map(|(source, page)| format!("[Fonte: {source}, Página {page}]"))
        .collect::<Vec<_>>()
        .join("\n")
}
