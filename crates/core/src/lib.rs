pub mod adapter;
pub mod catalog;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod routines;
pub mod store;
pub mod timestamp;

pub use adapter::{adapt_file, sniff_kind, DocumentKind, DocumentSection, SectionContent};
pub use catalog::{CatalogEntry, EntityType, EntityTypeCatalog, ResolvedRule};
pub use coordinator::{
    digest_file, discover_files, IngestionCoordinator, IngestionJob, IngestionOutcome,
    NullProgress, ProgressSink, QueuedFile, RateSample, RunHandle, RunState, SharedRunState,
    UNSUPPORTED_PREVIEW_CAP,
};
pub use dispatcher::ParserDispatcher;
pub use error::{CatalogError, IngestError, Result, RoutineError, StoreError};
pub use models::{
    ContextSnippet, DistinctEntity, DistinctEntityId, EntityTypeId, FileId, FileRecord,
    Occurrence, OccurrenceId, RawMatch, RawSpan,
};
pub use routines::{ExtractionRoutine, RoutineRegistry};
pub use store::{DedupStore, EntityCounter, FileScope};
pub use timestamp::TimestampResolver;
