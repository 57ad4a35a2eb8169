use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum IngestError {
    #[error("invalid feed url: {0}")]
    InvalidFeedUrl(String),

    #[error("invalid schema kind: {0}")]
    InvalidSchemaKind(String),

    #[error("missing config file atom-ingest.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("feed request failed: {0}")]
    FeedHttp(String),

    #[error("feed returned status {status}: {message}")]
    FeedStatus { status: u16, message: String },

    #[error("failed to read feed from {0}")]
    FeedRead(PathBuf),

    #[error("failed to parse feed {url}: {message}")]
    FeedParse { url: String, message: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("record store at {path} is corrupt: {message}")]
    StoreCorrupt { path: String, message: String },

    #[error("record store at {0} is in use by another process")]
    StoreLocked(String),

    #[error("no ingestion schema installed for {0}")]
    SchemaMissing(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("file retrieval failed: {0}")]
    Retrieval(String),
}
