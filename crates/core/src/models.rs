use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Index of an entity type inside the loaded catalog arena.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityTypeId(pub u32);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct FileId(pub u64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DistinctEntityId(pub u64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct OccurrenceId(pub u64);

/// One ingested source unit. A plain file maps to one record; a spreadsheet
/// workbook maps to one record per sheet, with the sheet name folded into
/// `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    pub path: PathBuf,
    pub mime_type: String,
    pub checksum: String,
}

/// The canonical, deduplicated record for one literal value under one
/// entity type. Identical values under different entity types are distinct
/// facts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistinctEntity {
    pub id: DistinctEntityId,
    pub value: String,
    pub entity_type: EntityTypeId,
}

/// One concrete sighting of a distinct entity at a specific file and line.
/// Line numbers are 1-based; for PDFs the line is the page number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: OccurrenceId,
    pub distinct_entity: DistinctEntityId,
    pub entity_type: EntityTypeId,
    pub file: FileId,
    pub line: u32,
    pub timestamp: Option<NaiveDateTime>,
}

/// Surrounding text captured at three granularities around an occurrence.
/// Created exactly once, atomically with its occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnippet {
    pub occurrence: OccurrenceId,
    pub small: String,
    pub medium: String,
    pub large: String,
}

/// A raw extraction hit before deduplication: the matched text and its byte
/// span in the section's searchable content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMatch {
    pub entity_type: EntityTypeId,
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// What an extraction routine returns: one matched span of the input text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSpan {
    pub text: String,
    pub start: usize,
    pub end: usize,
}
