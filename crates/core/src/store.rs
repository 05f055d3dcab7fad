use crate::adapter::SectionContent;
use crate::error::StoreError;
use crate::models::{
    ContextSnippet, DistinctEntity, DistinctEntityId, EntityTypeId, FileId, FileRecord,
    Occurrence, OccurrenceId,
};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

const MEDIUM_RADIUS: usize = 8;
const LARGE_RADIUS: usize = 15;

/// Shared thread-safe tally of entities found, bumped on occurrence
/// creation only. The coordinator reads it for throughput reporting.
#[derive(Clone, Default)]
pub struct EntityCounter(Arc<Mutex<u64>>);

impl EntityCounter {
    fn lock(&self) -> MutexGuard<'_, u64> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn increment(&self) {
        *self.lock() += 1;
    }

    pub fn get(&self) -> u64 {
        *self.lock()
    }
}

/// In-memory deduplicated fact store. All writes go through a
/// [`FileScope`]; the `&mut` borrow enforces the single-writer rule.
/// Rows are append-only for the lifetime of the store.
#[derive(Default)]
pub struct DedupStore {
    files: Vec<FileRecord>,
    file_index: HashMap<(PathBuf, String), FileId>,
    entities: Vec<DistinctEntity>,
    entity_index: HashMap<(String, EntityTypeId), DistinctEntityId>,
    occurrences: Vec<Occurrence>,
    occurrence_index: HashMap<(DistinctEntityId, FileId, u32), OccurrenceId>,
    contexts: HashMap<OccurrenceId, ContextSnippet>,
    counter: EntityCounter,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_counter(counter: EntityCounter) -> Self {
        Self {
            counter,
            ..Self::default()
        }
    }

    pub fn counter(&self) -> EntityCounter {
        self.counter.clone()
    }

    /// Opens the persistence scope for one file. Dropping the scope without
    /// committing rolls back every row it created.
    pub fn begin_file(&mut self) -> FileScope<'_> {
        FileScope {
            file_mark: self.files.len(),
            entity_mark: self.entities.len(),
            occurrence_mark: self.occurrences.len(),
            committed: false,
            store: self,
        }
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn distinct_count(&self) -> usize {
        self.entities.len()
    }

    pub fn occurrence_count(&self) -> usize {
        self.occurrences.len()
    }

    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }

    pub fn distinct_entities(&self) -> &[DistinctEntity] {
        &self.entities
    }

    pub fn occurrences(&self) -> &[Occurrence] {
        &self.occurrences
    }

    pub fn find_distinct(&self, value: &str, entity_type: EntityTypeId) -> Option<&DistinctEntity> {
        let id = self.entity_index.get(&(value.to_string(), entity_type))?;
        self.entities.get(id.0 as usize)
    }

    pub fn occurrences_of(&self, distinct: DistinctEntityId) -> Vec<&Occurrence> {
        self.occurrences
            .iter()
            .filter(|occurrence| occurrence.distinct_entity == distinct)
            .collect()
    }

    pub fn context(&self, occurrence: OccurrenceId) -> Option<&ContextSnippet> {
        self.contexts.get(&occurrence)
    }
}

/// Write scope covering exactly one file. Created rows are journaled by
/// position; rollback truncates to the marks and clears the index keys of
/// the removed rows.
pub struct FileScope<'a> {
    store: &'a mut DedupStore,
    file_mark: usize,
    entity_mark: usize,
    occurrence_mark: usize,
    committed: bool,
}

impl FileScope<'_> {
    /// Lookup-or-create on (path, name). On a hit only the MIME type is
    /// refreshed.
    pub fn ensure_file(
        &mut self,
        path: &Path,
        name: &str,
        mime_type: &str,
        checksum: &str,
    ) -> FileId {
        let key = (path.to_path_buf(), name.to_string());
        if let Some(existing) = self.store.file_index.get(&key) {
            let id = *existing;
            if let Some(record) = self.store.files.get_mut(id.0 as usize) {
                record.mime_type = mime_type.to_string();
            }
            return id;
        }

        let id = FileId(self.store.files.len() as u64);
        self.store.files.push(FileRecord {
            id,
            name: name.to_string(),
            path: path.to_path_buf(),
            mime_type: mime_type.to_string(),
            checksum: checksum.to_string(),
        });
        self.store.file_index.insert(key, id);
        id
    }

    /// Exact-value lookup-or-create. Identical value and type converge to
    /// one id regardless of which file produced the match; this is the
    /// cross-file correlation primitive.
    pub fn resolve_distinct(&mut self, value: &str, entity_type: EntityTypeId) -> DistinctEntityId {
        let key = (value.to_string(), entity_type);
        if let Some(existing) = self.store.entity_index.get(&key) {
            return *existing;
        }

        let id = DistinctEntityId(self.store.entities.len() as u64);
        self.store.entities.push(DistinctEntity {
            id,
            value: value.to_string(),
            entity_type,
        });
        self.store.entity_index.insert(key, id);
        id
    }

    /// Lookup-or-create keyed by (distinct entity, file, line). Returns
    /// `None` on an idempotent hit. On creation the three context snippets
    /// are captured from the section units and the shared counter is
    /// bumped.
    #[allow(clippy::too_many_arguments)]
    pub fn record_occurrence(
        &mut self,
        distinct: DistinctEntityId,
        file: FileId,
        entity_type: EntityTypeId,
        line: usize,
        timestamp: Option<NaiveDateTime>,
        content: &SectionContent,
        span: (usize, usize),
    ) -> Result<Option<OccurrenceId>, StoreError> {
        let line = u32::try_from(line).map_err(|_| StoreError::LineOutOfRange(line))?;

        let key = (distinct, file, line);
        if self.store.occurrence_index.contains_key(&key) {
            return Ok(None);
        }

        let id = OccurrenceId(self.store.occurrences.len() as u64);
        self.store.occurrences.push(Occurrence {
            id,
            distinct_entity: distinct,
            entity_type,
            file,
            line,
            timestamp,
        });
        self.store.occurrence_index.insert(key, id);

        let (start_unit, end_unit) = span;
        self.store.contexts.insert(
            id,
            ContextSnippet {
                occurrence: id,
                small: content.surrounding(start_unit, end_unit, 0),
                medium: content.surrounding(start_unit, end_unit, MEDIUM_RADIUS),
                large: content.surrounding(start_unit, end_unit, LARGE_RADIUS),
            },
        );

        self.store.counter.increment();
        Ok(Some(id))
    }

    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for FileScope<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        let rolled_back = (self.store.files.len() - self.file_mark)
            + (self.store.entities.len() - self.entity_mark)
            + (self.store.occurrences.len() - self.occurrence_mark);
        if rolled_back > 0 {
            debug!(rows = rolled_back, "rolling back file persistence scope");
        }

        while self.store.occurrences.len() > self.occurrence_mark {
            if let Some(occurrence) = self.store.occurrences.pop() {
                self.store.occurrence_index.remove(&(
                    occurrence.distinct_entity,
                    occurrence.file,
                    occurrence.line,
                ));
                self.store.contexts.remove(&occurrence.id);
            }
        }

        while self.store.entities.len() > self.entity_mark {
            if let Some(entity) = self.store.entities.pop() {
                self.store
                    .entity_index
                    .remove(&(entity.value, entity.entity_type));
            }
        }

        while self.store.files.len() > self.file_mark {
            if let Some(record) = self.store.files.pop() {
                self.store.file_index.remove(&(record.path, record.name));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DedupStore;
    use crate::adapter::SectionContent;
    use crate::models::EntityTypeId;
    use std::path::Path;

    fn content(lines: &[&str]) -> SectionContent {
        SectionContent::from_units(lines.iter().map(|l| l.to_string()).collect())
    }

    #[test]
    fn recording_the_same_occurrence_twice_is_idempotent() {
        let mut store = DedupStore::new();
        let section = content(&["a", "8.8.8.8", "b"]);
        let entity_type = EntityTypeId(0);

        let mut scope = store.begin_file();
        let file = scope.ensure_file(Path::new("/tmp/a.txt"), "a.txt", "text/plain", "ck");
        let distinct = scope.resolve_distinct("8.8.8.8", entity_type);

        let first = scope
            .record_occurrence(distinct, file, entity_type, 2, None, &section, (1, 1))
            .unwrap();
        let second = scope
            .record_occurrence(distinct, file, entity_type, 2, None, &section, (1, 1))
            .unwrap();
        scope.commit();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.occurrence_count(), 1);
        assert_eq!(store.counter().get(), 1);
    }

    #[test]
    fn same_value_in_two_files_correlates_to_one_distinct_entity() {
        let mut store = DedupStore::new();
        let section = content(&["8.8.8.8"]);
        let entity_type = EntityTypeId(3);

        for name in ["a.txt", "b.txt"] {
            let path = format!("/tmp/{name}");
            let mut scope = store.begin_file();
            let file = scope.ensure_file(Path::new(&path), name, "text/plain", "ck");
            let distinct = scope.resolve_distinct("8.8.8.8", entity_type);
            scope
                .record_occurrence(distinct, file, entity_type, 1, None, &section, (0, 0))
                .unwrap();
            scope.commit();
        }

        assert_eq!(store.distinct_count(), 1);
        assert_eq!(store.occurrence_count(), 2);

        let distinct = store.find_distinct("8.8.8.8", entity_type).unwrap();
        assert_eq!(store.occurrences_of(distinct.id).len(), 2);
    }

    #[test]
    fn same_value_under_different_types_stays_distinct() {
        let mut store = DedupStore::new();
        let section = content(&["10.0.0.1"]);

        let mut scope = store.begin_file();
        let file = scope.ensure_file(Path::new("/tmp/a.txt"), "a.txt", "text/plain", "ck");
        let first = scope.resolve_distinct("10.0.0.1", EntityTypeId(1));
        let second = scope.resolve_distinct("10.0.0.1", EntityTypeId(2));
        scope
            .record_occurrence(first, file, EntityTypeId(1), 1, None, &section, (0, 0))
            .unwrap();
        scope
            .record_occurrence(second, file, EntityTypeId(2), 1, None, &section, (0, 0))
            .unwrap();
        scope.commit();

        assert_ne!(first, second);
        assert_eq!(store.distinct_count(), 2);
    }

    #[test]
    fn context_snippets_are_created_with_the_occurrence_and_clamped() {
        let mut store = DedupStore::new();
        let units: Vec<String> = (0..30).map(|i| format!("line{i}")).collect();
        let section = SectionContent::from_units(units);
        let entity_type = EntityTypeId(0);

        let mut scope = store.begin_file();
        let file = scope.ensure_file(Path::new("/tmp/a.txt"), "a.txt", "text/plain", "ck");
        let distinct = scope.resolve_distinct("line2", entity_type);
        let id = scope
            .record_occurrence(distinct, file, entity_type, 3, None, &section, (2, 2))
            .unwrap()
            .unwrap();
        scope.commit();

        let snippet = store.context(id).unwrap();
        assert_eq!(snippet.small, "line2");
        assert!(snippet.medium.starts_with("line0"));
        assert!(snippet.medium.ends_with("line10"));
        assert_eq!(snippet.medium.lines().count(), 11);
        assert_eq!(snippet.large.lines().count(), 18);
    }

    #[test]
    fn dropping_an_uncommitted_scope_rolls_back_its_rows() {
        let mut store = DedupStore::new();
        let section = content(&["8.8.8.8"]);
        let entity_type = EntityTypeId(0);

        {
            let mut scope = store.begin_file();
            let file = scope.ensure_file(Path::new("/tmp/a.txt"), "a.txt", "text/plain", "ck");
            let distinct = scope.resolve_distinct("8.8.8.8", entity_type);
            scope
                .record_occurrence(distinct, file, entity_type, 1, None, &section, (0, 0))
                .unwrap();
            // no commit
        }

        assert_eq!(store.file_count(), 0);
        assert_eq!(store.distinct_count(), 0);
        assert_eq!(store.occurrence_count(), 0);
        assert!(store.find_distinct("8.8.8.8", entity_type).is_none());

        // The rolled-back keys are free again for the next scope.
        let mut scope = store.begin_file();
        let file = scope.ensure_file(Path::new("/tmp/a.txt"), "a.txt", "text/plain", "ck");
        let distinct = scope.resolve_distinct("8.8.8.8", entity_type);
        assert!(scope
            .record_occurrence(distinct, file, entity_type, 1, None, &section, (0, 0))
            .unwrap()
            .is_some());
        scope.commit();
        assert_eq!(store.occurrence_count(), 1);
    }

    #[test]
    fn ensure_file_refreshes_mime_type_on_hit() {
        let mut store = DedupStore::new();

        let mut scope = store.begin_file();
        let first = scope.ensure_file(Path::new("/tmp/a"), "a", "text/plain", "ck");
        scope.commit();

        let mut scope = store.begin_file();
        let second = scope.ensure_file(Path::new("/tmp/a"), "a", "application/pdf", "ck");
        scope.commit();

        assert_eq!(first, second);
        assert_eq!(store.file_count(), 1);
        assert_eq!(store.files()[0].mime_type, "application/pdf");
    }
}
