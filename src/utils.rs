use std::fs::{self, DirBuilder};
use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;
use reqwest::Client;
use scraper::{Html, Node};

use crate::error::{RagError, Result, Service};

/// Creates a directory if it doesn't exist
pub fn ensure_dir(path: impl AsRef<Path>) -> Result<()> {
    DirBuilder::new().recursive(true).create(path)?;
    Ok(())
}

/// Identifier stored as `source` for a PDF kept in the documents directory.
pub fn document_source(docs_dir: &Path, name: &str) -> String {
    docs_dir.join(name).to_string_lossy().into_owned()
}

/// Rejects names that would escape the documents directory.
pub fn validate_document_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    let file_name = Path::new(trimmed)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RagError::config(format!("invalid document name {name:?}")))?;
    if file_name != trimmed {
        return Err(RagError::config(format!(
            "document name {name:?} must not contain directories"
        )));
    }
    Ok(file_name)
}

/// Names of the PDF files in the documents directory, sorted.
pub fn list_pdf_files(docs_dir: impl AsRef<Path>) -> Result<Vec<String>> {
    let docs_dir = docs_dir.as_ref();
    if !docs_dir.exists() {
        return Ok(Vec::new());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(docs_dir)? {
        let path = entry?.path();
        if path.is_file() && is_pdf(&path) {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Copies a PDF into the documents directory, returning its file name.
pub fn import_document(docs_dir: &Path, file: &Path) -> Result<String> {
    if !file.is_file() {
        return Err(RagError::MissingDocument(file.to_path_buf()));
    }
    if !is_pdf(file) {
        return Err(RagError::config(format!(
            "{} is not a PDF file",
            file.display()
        )));
    }
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| RagError::config(format!("invalid file name {}", file.display())))?
        .to_string();

    ensure_dir(docs_dir)?;
    let destination: PathBuf = docs_dir.join(&name);
    if fs::canonicalize(file)? != fs::canonicalize(docs_dir)?.join(&name) {
        fs::copy(file, &destination)?;
    }
    tracing::info!(document = %name, path = %destination.display(), "document saved");
    Ok(name)
}

/// Deletes a PDF from the documents directory. Returns `false` when it was not there.
pub fn remove_document_file(docs_dir: &Path, name: &str) -> Result<bool> {
    let path = docs_dir.join(validate_document_name(name)?);
    if !path.exists() {
        tracing::info!(document = name, "document file not found");
        return Ok(false);
    }
    fs::remove_file(&path)?;
    tracing::info!(document = name, "document file removed");
    Ok(true)
}

lazy_static! {
    static ref SPACES: Regex = Regex::new(r"\s+").unwrap();
}

/// Elements whose start begins a new line of text.
const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "footer", "h1",
    "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "ol", "p", "pre", "section", "table",
    "td", "th", "title", "tr", "ul",
];

/// Elements whose text is never visible.
const HIDDEN_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// Flattens an HTML page to its visible text, one block element per line.
pub fn html_to_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let mut raw = String::new();
    for node in document.root_element().descendants() {
        match node.value() {
            Node::Element(element) if BLOCK_TAGS.contains(&element.name()) => raw.push('\n'),
            Node::Text(text) => {
                let hidden = node.ancestors().any(|ancestor| {
                    matches!(ancestor.value(), Node::Element(e) if HIDDEN_TAGS.contains(&e.name()))
                });
                if !hidden {
                    raw.extend(text.chars().map(|ch| if ch == '\n' { ' ' } else { ch }));
                }
            }
            _ => {}
        }
    }

    raw.lines()
        .map(|line| SPACES.replace_all(line, " ").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Downloads a web page and returns its visible text.
pub async fn fetch_page_text(client: &Client, url: &str) -> Result<String> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| RagError::from_reqwest(Service::StatuteSite, err))?;
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        return Err(RagError::from_status(Service::StatuteSite, status, body));
    }
    let html = response
        .text()
        .await
        .map_err(|err| RagError::from_reqwest(Service::StatuteSite, err))?;
    Ok(html_to_text(&html))
}
