use crate::models::OccurrenceId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("workbook parse error: {0}")]
    WorkbookParse(String),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("worker pool error: {0}")]
    WorkerPool(String),

    #[error("ingestion worker failed: {0}")]
    WorkerFailed(String),
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("catalog is empty: {0}")]
    Empty(String),

    #[error("duplicate entity type code: {0}")]
    DuplicateCode(String),

    #[error("entity types {first} and {second} share the same pattern")]
    DuplicatePattern { first: String, second: String },

    #[error("entity types {first} and {second} reference the same routine")]
    DuplicateRoutine { first: String, second: String },

    #[error("entity type {code} declares both a pattern and a routine")]
    AmbiguousRule { code: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("line number {0} does not fit the occurrence record")]
    LineOutOfRange(usize),

    #[error("occurrence {0:?} already has a context snippet")]
    ContextExists(OccurrenceId),
}

#[derive(Debug, Error)]
pub enum RoutineError {
    #[error("no extraction routine registered under {0}")]
    Missing(String),

    #[error("extraction routine {name} failed: {message}")]
    Failed { name: String, message: String },
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
