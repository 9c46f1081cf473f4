use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::{RelevanceConfig, RetrievalConfig};
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::llm::{build_messages, ChatModel, Turn};
use crate::relevance::{filter_relevant_sources, render_sources};
use crate::retriever::{RetrievedChunk, Retriever};
use crate::vector_db::{Page, VectorIndex};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub answer: String,
    pub sources: BTreeSet<(String, Page)>,
}

impl ChatReply {
    /// Answer followed by its citation lines, if any.
    pub fn render(&self) -> String {
        if self.sources.is_empty() {
            self.answer.clone()
        } else {
            format!("{}\n\n{}", self.answer, render_sources(&self.sources))
        }
    }
}

/// One conversation: retrieval, prompt assembly, completion and citations.
pub struct ChatSession {
    retriever: Retriever,
    embedder: Arc<dyn Embedder>,
    llm: Arc<dyn ChatModel>,
    history: Vec<Turn>,
    top_k: usize,
    relevance: RelevanceConfig,
}

impl ChatSession {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        llm: Arc<dyn ChatModel>,
        retrieval: RetrievalConfig,
        relevance: RelevanceConfig,
    ) -> Self {
        ChatSession {
            retriever: Retriever::new(embedder.clone(), index, retrieval.scope),
            embedder,
            llm,
            history: Vec::new(),
            top_k: retrieval.top_k,
            relevance,
        }
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Answers one message. The turn is only added to the history on success.
    pub async fn ask(&mut self, message: &str) -> Result<ChatReply> {
        let message = message.trim();
        if message.is_empty() {
            return Err(RagError::config("message is empty"));
        }

        let chunks = self.retriever.retrieve(message, self.top_k).await?;
        let context = join_context(&chunks);
        let messages = build_messages(&context, &self.history, message);
        let answer = self.llm.complete(&messages).await?;

        let sources = match filter_relevant_sources(
            self.embedder.as_ref(),
            &answer,
            &chunks,
            self.relevance.threshold,
        )
        .await
        {
            Ok(sources) => sources,
            Err(err) => {
                tracing::warn!(error = %err, "citation check failed; answering without sources");
                BTreeSet::new()
            }
        };

        self.history.push(Turn {
            user: message.to_string(),
            assistant: answer.clone(),
        });
        Ok(ChatReply { answer, sources })
    }

    /// Like [`ChatSession::ask`], but renders failures as a chat message.
    pub async fn respond(&mut self, message: &str) -> String {
        match self.ask(message).await {
            Ok(reply) => reply.render(),
            Err(err) => {
                tracing::error!(error = %err, "chat turn failed");
                format!("❌ Erro: {err}")
            }
        }
    }
}

fn join_context(chunks: &[RetrievedChunk]) -> String {
    chunks
        .iter()
        .map(|chunk| chunk.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
