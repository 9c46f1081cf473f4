mod chat;
mod chunker;
mod config;
mod doc_map;
mod embedder;
mod error;
mod knowledge_base;
mod llm;
mod pdf;
mod relevance;
mod retriever;
mod utils;
mod vector_db;

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use chat::ChatSession;
use config::{
    ChunkingArgs, Cli, CollectionScope, Command, RelevanceConfig, RetrievalConfig, ServiceArgs,
    EMBEDDING_DIM,
};
use embedder::{Embedder, OpenAiEmbedder};
use knowledge_base::KnowledgeBase;
use llm::{LLMConfig, LLM};
use vector_db::{QdrantIndex, VectorIndex};

const INDEX_READY_ATTEMPTS: usize = 10;
const INDEX_READY_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let services = cli.services;
    match cli.command {
        Command::List => list_documents(&services),
        Command::Sources => {
            let kb = open_knowledge_base(&services).await?;
            let doc_map = kb.doc_map_snapshot().await;
            for source in doc_map.sources() {
                let chunks = doc_map.iter().filter(|(_, p)| p.source == source).count();
                println!("{source} ({chunks} chunks)");
            }
            println!("Total: {} chunks", doc_map.len());
            Ok(())
        }
        Command::Ingest { files, chunking } => ingest(&services, files, chunking).await,
        Command::Delete { name } => {
            let kb = open_knowledge_base(&services).await?;
            match kb.delete_document(&name).await {
                Ok(report) => println!("{report}"),
                Err(e) => println!("❌ Error: {e}"),
            }
            Ok(())
        }
        Command::Statute {
            url,
            title,
            chunking,
        } => ingest_statute(&services, &url, title.as_deref(), chunking).await,
        Command::Chat {
            top_k,
            threshold,
            only_collections,
        } => {
            let retrieval = RetrievalConfig {
                top_k,
                scope: CollectionScope::from_names(only_collections),
            };
            chat_loop(&services, retrieval, RelevanceConfig { threshold }).await
        }
    }
}

fn list_documents(services: &ServiceArgs) -> Result<()> {
    let names = utils::list_pdf_files(&services.docs_dir)
        .with_context(|| format!("failed to read {}", services.docs_dir.display()))?;
    if names.is_empty() {
        println!("Nenhum PDF em '{}'", services.docs_dir.display());
    }
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn connect_index(services: &ServiceArgs) -> Result<Arc<QdrantIndex>> {
    let index = QdrantIndex::new(
        &services.qdrant_url,
        services.qdrant_api_key.as_deref(),
        services.timeout(),
    )
    .context("failed to configure Qdrant client")?;
    Ok(Arc::new(index))
}

fn connect_embedder(services: &ServiceArgs) -> Result<Arc<OpenAiEmbedder>> {
    let embedder = OpenAiEmbedder::new(
        services.openai_key()?,
        &services.openai_base_url,
        &services.embedding_model,
        EMBEDDING_DIM,
        services.timeout(),
    )
    .context("failed to configure embedding client")?;
    Ok(Arc::new(embedder))
}

async fn open_knowledge_base(services: &ServiceArgs) -> Result<KnowledgeBase> {
    let index = connect_index(services)?;
    let embedder = connect_embedder(services)?;
    KnowledgeBase::wait_for_index(index.as_ref(), INDEX_READY_ATTEMPTS, INDEX_READY_DELAY)
        .await
        .with_context(|| format!("Qdrant at {} is not reachable", services.qdrant_url))?;
    let kb = KnowledgeBase::open(embedder, index, services.collections(), &services.docs_dir)
        .await
        .context("failed to rebuild the document map")?;
    Ok(kb)
}

async fn ingest(services: &ServiceArgs, files: Vec<PathBuf>, chunking: ChunkingArgs) -> Result<()> {
    let chunking = chunking.validated()?;
    let kb = open_knowledge_base(services).await?;
    for file in files {
        let result = match utils::import_document(kb.docs_dir(), &file) {
            Ok(name) => kb.add_pdf(&name, &chunking).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(report) => println!("{report}"),
            Err(e) => println!("❌ Error ({}): {e}", file.display()),
        }
    }
    Ok(())
}

async fn ingest_statute(
    services: &ServiceArgs,
    url: &str,
    title: Option<&str>,
    chunking: ChunkingArgs,
) -> Result<()> {
    let chunking = chunking.validated()?;
    let kb = open_knowledge_base(services).await?;
    let client = reqwest::Client::builder()
        .timeout(services.timeout())
        .build()
        .context("failed to build HTTP client")?;
    let text = utils::fetch_page_text(&client, url)
        .await
        .with_context(|| format!("failed to fetch {url}"))?;
    let report = kb
        .add_statute(url, title, &text, &chunking)
        .await
        .context("failed to index statute")?;
    println!("{report}");
    Ok(())
}

async fn chat_loop(
    services: &ServiceArgs,
    retrieval: RetrievalConfig,
    relevance: RelevanceConfig,
) -> Result<()> {
    let index = connect_index(services)?;
    let embedder = connect_embedder(services)?;
    let collections =
        KnowledgeBase::wait_for_index(index.as_ref(), INDEX_READY_ATTEMPTS, INDEX_READY_DELAY)
            .await
            .with_context(|| format!("Qdrant at {} is not reachable", services.qdrant_url))?;
    let llm = LLM::new(
        services.openai_key()?,
        &services.openai_base_url,
        LLMConfig {
            model: services.chat_model.clone(),
            ..LLMConfig::default()
        },
        services.timeout(),
    )
    .context("failed to configure chat client")?;

    let index: Arc<dyn VectorIndex> = index;
    let embedder: Arc<dyn Embedder> = embedder;
    let mut session = ChatSession::new(embedder, index, Arc::new(llm), retrieval, relevance);

    println!(
        "Vitruvia pronta ({} coleções). Digite sua pergunta, /limpar para reiniciar, Ctrl+D para sair.",
        collections.len()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let query = line.trim();
        if query.is_empty() {
            continue;
        }
        if query == "/limpar" {
            let turns = session.history().len();
            session.clear_history();
            println!("Histórico apagado ({turns} trocas).\n");
            continue;
        }

        println!("\n{}\n", session.respond(query).await);
    }

    Ok(())
}
