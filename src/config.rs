//! Command line and environment configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use crate::error::{RagError, Result};

/// Dimension of `text-embedding-ada-002` vectors.
pub const EMBEDDING_DIM: usize = 1536;

#[derive(Parser, Debug)]
#[command(
    name = "vitruvia",
    about = "Legal document assistant backed by retrieval over indexed PDFs"
)]
pub struct Cli {
    #[command(flatten)]
    pub services: ServiceArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct ServiceArgs {
    /// Base URL of the Qdrant REST API.
    #[arg(long, env = "QDRANT_URL", default_value = "http://localhost:6333")]
    pub qdrant_url: String,

    /// Optional Qdrant API key.
    #[arg(long, env = "QDRANT_API_KEY")]
    pub qdrant_api_key: Option<String>,

    /// API key for the OpenAI-compatible endpoints.
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub openai_api_key: Option<String>,

    /// Base URL for OpenAI-compatible endpoints.
    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    pub openai_base_url: String,

    #[arg(
        long,
        env = "VITRUVIA_EMBEDDING_MODEL",
        default_value = "text-embedding-ada-002"
    )]
    pub embedding_model: String,

    #[arg(long, env = "VITRUVIA_CHAT_MODEL", default_value = "gpt-4o")]
    pub chat_model: String,

    /// Directory holding the indexed PDF files.
    #[arg(long, env = "VITRUVIA_DOCS_DIR", default_value = "documents")]
    pub docs_dir: PathBuf,

    /// Collection mirrored by the local document map.
    #[arg(long, env = "VITRUVIA_COLLECTION", default_value = "docs")]
    pub collection: String,

    /// Collection receiving statute text, keyed by random ids.
    #[arg(
        long,
        env = "VITRUVIA_LEGISLATION_COLLECTION",
        default_value = "legislacao_brasil"
    )]
    pub legislation_collection: String,

    /// Seconds before any external request times out.
    #[arg(long, env = "VITRUVIA_TIMEOUT_SECS", default_value_t = 60)]
    pub timeout_secs: u64,
}

impl ServiceArgs {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    /// The OpenAI key, required by every command that embeds or completes.
    pub fn openai_key(&self) -> Result<&str> {
        self.openai_api_key
            .as_deref()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| RagError::config("OPENAI_API_KEY is not set"))
    }

    pub fn collections(&self) -> CollectionNames {
        CollectionNames {
            documents: self.collection.clone(),
            legislation: self.legislation_collection.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Interactive chat over the indexed documents.
    Chat {
        /// Chunks handed to the model per turn.
        #[arg(long, default_value_t = 3)]
        top_k: usize,

        /// Minimum answer/chunk similarity for a source to be cited.
        #[arg(long, default_value_t = 0.80)]
        threshold: f32,

        /// Restrict retrieval to these collections (repeatable); all collections when omitted.
        #[arg(long = "only-collection")]
        only_collections: Vec<String>,
    },
    /// Copy PDFs into the documents directory and index them.
    Ingest {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[command(flatten)]
        chunking: ChunkingArgs,
    },
    /// Remove a PDF from the index and from the documents directory.
    Delete { name: String },
    /// List PDFs in the documents directory.
    List,
    /// List distinct sources stored in the document collection.
    Sources,
    /// Fetch a statute page and index its text into the legislation collection.
    Statute {
        url: String,

        #[arg(long)]
        title: Option<String>,

        #[command(flatten)]
        chunking: ChunkingArgs,
    },
}

#[derive(Args, Debug, Clone, Copy)]
pub struct ChunkingArgs {
    #[arg(long, default_value_t = 1024)]
    pub chunk_size: usize,

    #[arg(long, default_value_t = 128)]
    pub overlap: usize,
}

impl ChunkingArgs {
    pub fn validated(self) -> Result<ChunkingConfig> {
        ChunkingConfig::new(self.chunk_size, self.overlap)
    }
}

#[derive(Debug, Clone)]
pub struct CollectionNames {
    pub documents: String,
    pub legislation: String,
}

impl Default for CollectionNames {
    fn default() -> Self {
        Self {
            documents: "docs".to_string(),
            legislation: "legislacao_brasil".to_string(),
        }
    }
}

/// Window sizing for the chunker, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkingConfig {
    chunk_size: usize,
    overlap: usize,
}

impl ChunkingConfig {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(RagError::config("chunk size must be greater than zero"));
        }
        if overlap >= chunk_size {
            return Err(RagError::config(format!(
                "overlap ({overlap}) must be smaller than chunk size ({chunk_size})"
            )));
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    /// Distance between the starts of two consecutive windows; never zero.
    pub fn stride(&self) -> usize {
        self.chunk_size - self.overlap
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024,
            overlap: 128,
        }
    }
}

/// Which collections a query is searched against.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CollectionScope {
    #[default]
    All,
    Only(Vec<String>),
}

impl CollectionScope {
    pub fn from_names(names: Vec<String>) -> Self {
        if names.is_empty() {
            Self::All
        } else {
            Self::Only(names)
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub scope: CollectionScope,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            scope: CollectionScope::All,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelevanceConfig {
    pub threshold: f32,
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self { threshold: 0.80 }
    }
}
