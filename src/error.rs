//! Error types shared by the ingestion and retrieval pipeline.

use std::fmt;
use std::path::PathBuf;

use reqwest::StatusCode;

pub type Result<T> = std::result::Result<T, RagError>;

/// External collaborator a request was sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Embedding,
    VectorIndex,
    ChatCompletion,
    StatuteSite,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Service::Embedding => "embedding service",
            Service::VectorIndex => "vector index",
            Service::ChatCompletion => "chat completion service",
            Service::StatuteSite => "statute site",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RagError {
    /// Timeouts, refused connections, rate limits and 5xx responses.
    #[error("{service} is temporarily unavailable: {message}")]
    Transient { service: Service, message: String },

    #[error("{service} rejected the request ({status}): {message}")]
    Service {
        service: Service,
        status: StatusCode,
        message: String,
    },

    #[error("malformed response from {service}: {message}")]
    Malformed { service: Service, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("document not found: {}", .0.display())]
    MissingDocument(PathBuf),

    #[error("failed to read PDF {}: {message}", .path.display())]
    Pdf { path: PathBuf, message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl RagError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    pub fn malformed<S: Into<String>>(service: Service, message: S) -> Self {
        Self::Malformed {
            service,
            message: message.into(),
        }
    }

    /// Classifies a transport-level reqwest failure.
    pub fn from_reqwest(service: Service, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return Self::Transient {
                service,
                message: err.to_string(),
            };
        }
        if err.is_decode() {
            return Self::malformed(service, err.to_string());
        }
        match err.status() {
            Some(status) => Self::from_status(service, status, err.to_string()),
            None => Self::Transient {
                service,
                message: err.to_string(),
            },
        }
    }

    /// Classifies a non-success HTTP status.
    pub fn from_status(service: Service, status: StatusCode, body: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            Self::Transient {
                service,
                message: format!("{status}: {body}"),
            }
        } else {
            Self::Service {
                service,
                status,
                message: body,
            }
        }
    }

    /// Whether the same request could succeed if issued again later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
