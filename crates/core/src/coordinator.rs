use crate::adapter::{adapt_file, sniff_kind};
use crate::catalog::EntityTypeCatalog;
use crate::dispatcher::ParserDispatcher;
use crate::error::IngestError;
use crate::routines::RoutineRegistry;
use crate::store::{DedupStore, EntityCounter};
use crate::timestamp::TimestampResolver;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

/// How many unsupported file entries are kept in the human-readable
/// preview; the full path list is retained separately for audit.
pub const UNSUPPORTED_PREVIEW_CAP: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct QueuedFile {
    pub path: PathBuf,
    pub bytes: u64,
}

/// The ordered file queue for one ingestion run, with byte sizes known up
/// front so the ETA can be derived from byte volume rather than file
/// count.
#[derive(Debug, Clone, Default)]
pub struct IngestionJob {
    files: Vec<QueuedFile>,
}

impl IngestionJob {
    pub fn new(files: Vec<QueuedFile>) -> Self {
        Self { files }
    }

    /// Builds a job from bare paths, reading sizes from file metadata.
    /// Files that cannot be stat'ed are queued with a zero size and fail
    /// later at sniffing.
    pub fn from_paths(paths: Vec<PathBuf>) -> Self {
        let files = paths
            .into_iter()
            .map(|path| {
                let bytes = fs::metadata(&path).map(|meta| meta.len()).unwrap_or(0);
                QueuedFile { path, bytes }
            })
            .collect();
        Self { files }
    }

    pub fn files(&self) -> &[QueuedFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|file| file.bytes).sum()
    }
}

/// Recursively collects every regular file under `folder`, sorted for a
/// stable queue order.
pub fn discover_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder).into_iter().filter_map(|item| item.ok()) {
        if entry.file_type().is_file() {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[derive(Debug)]
struct SharedInner {
    state: RunState,
    abort: bool,
    files_done: u64,
    bytes_done: u64,
    unsupported: u64,
    started_at: Option<Instant>,
}

/// Mutable run state shared between the worker, the abort requester, and
/// progress consumers. Every read and write goes through the mutex.
pub struct SharedRunState {
    inner: Mutex<SharedInner>,
}

impl SharedRunState {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SharedInner {
                state: RunState::Idle,
                abort: false,
                files_done: 0,
                bytes_done: 0,
                unsupported: 0,
                started_at: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cooperative cancellation: stops scheduling of new files and of
    /// further rule-result consumption; work already dispatched finishes.
    pub fn request_abort(&self) {
        self.lock().abort = true;
    }

    pub fn abort_requested(&self) -> bool {
        self.lock().abort
    }

    pub fn state(&self) -> RunState {
        self.lock().state
    }

    pub fn files_done(&self) -> u64 {
        self.lock().files_done
    }

    pub fn bytes_done(&self) -> u64 {
        self.lock().bytes_done
    }

    pub fn unsupported(&self) -> u64 {
        self.lock().unsupported
    }

    /// Resets the totals for a fresh run. A previously requested abort is
    /// deliberately left standing so an abort that races run startup still
    /// wins.
    fn begin(&self) {
        let mut inner = self.lock();
        inner.state = RunState::Running;
        inner.files_done = 0;
        inner.bytes_done = 0;
        inner.unsupported = 0;
        inner.started_at = Some(Instant::now());
    }

    fn finish(&self, state: RunState) {
        self.lock().state = state;
    }

    fn add_file(&self) {
        self.lock().files_done += 1;
    }

    fn add_bytes(&self, bytes: u64) {
        self.lock().bytes_done += bytes;
    }

    fn add_unsupported(&self) {
        self.lock().unsupported += 1;
    }

    fn elapsed_secs(&self) -> f64 {
        self.lock()
            .started_at
            .map(|start| start.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// One throughput observation: entity, file, and byte rates plus the ETA
/// derived from bytes processed versus total queued byte volume.
#[derive(Debug, Clone, PartialEq)]
pub struct RateSample {
    pub entities_per_sec: f64,
    pub total_entities: u64,
    pub files_per_sec: f64,
    pub files_processed: u64,
    pub bytes_per_sec: f64,
    pub eta_secs: Option<f64>,
}

/// Receives progress callbacks from the worker. Implementations must not
/// block: the worker calls these inline between files.
pub trait ProgressSink: Send + Sync {
    fn on_status(&self, _status: &str) {}
    fn on_file_complete(&self, _position: u64, _queued: usize) {}
    fn on_rate(&self, _sample: &RateSample) {}
}

/// Sink for callers that do not observe progress.
#[derive(Debug, Default)]
pub struct NullProgress;

impl ProgressSink for NullProgress {}

#[derive(Debug, Clone)]
pub struct IngestionOutcome {
    pub run_id: Uuid,
    pub state: RunState,
    pub files_queued: usize,
    pub files_processed: u64,
    pub entities_found: u64,
    pub unsupported_count: u64,
    pub unsupported_preview: Vec<String>,
    pub unsupported_paths: Vec<PathBuf>,
    pub status: String,
}

enum FileDisposition {
    Processed,
    Unsupported(String),
}

/// Drives one ingestion run: sequential files, parallel rules within each
/// file, single-writer persistence, cooperative abort, per-file failure
/// isolation.
pub struct IngestionCoordinator {
    catalog: Arc<EntityTypeCatalog>,
    registry: Arc<RoutineRegistry>,
    dispatcher: ParserDispatcher,
    resolver: TimestampResolver,
    shared: Arc<SharedRunState>,
}

impl IngestionCoordinator {
    pub fn new(
        catalog: Arc<EntityTypeCatalog>,
        registry: Arc<RoutineRegistry>,
    ) -> Result<Self, IngestError> {
        Ok(Self {
            catalog,
            registry,
            dispatcher: ParserDispatcher::new()?,
            resolver: TimestampResolver::default(),
            shared: Arc::new(SharedRunState::new()),
        })
    }

    /// Handle for observing state and requesting abort from outside the
    /// worker.
    pub fn shared(&self) -> Arc<SharedRunState> {
        Arc::clone(&self.shared)
    }

    /// Runs the queue to completion on the calling thread. Per-file
    /// failures are isolated; an error escaping this loop is terminal for
    /// the run and is returned to the caller.
    pub fn run(
        &self,
        job: &IngestionJob,
        store: &mut DedupStore,
        sink: &dyn ProgressSink,
    ) -> Result<IngestionOutcome, IngestError> {
        let run_id = Uuid::new_v4();
        self.shared.begin();

        let total_bytes = job.total_bytes();
        let counter = store.counter();
        let mut unsupported_preview = Vec::new();
        let mut unsupported_paths = Vec::new();
        let mut aborted = false;

        info!(%run_id, files = job.len(), total_bytes, "ingestion run started");

        for (position, queued) in job.files().iter().enumerate() {
            if self.shared.abort_requested() {
                aborted = true;
                break;
            }

            match self.process_file(queued, store, sink) {
                Ok(FileDisposition::Processed) => self.shared.add_file(),
                Ok(FileDisposition::Unsupported(reason)) => {
                    debug!(path = %queued.path.display(), reason, "skipping file");
                    self.shared.add_unsupported();
                    if unsupported_preview.len() < UNSUPPORTED_PREVIEW_CAP {
                        unsupported_preview
                            .push(format!("{} ({reason})", queued.path.display()));
                    }
                    unsupported_paths.push(queued.path.clone());
                }
                Err(failure) => {
                    error!(path = %queued.path.display(), %failure, "file processing failed, continuing with next file");
                    self.shared.add_unsupported();
                    if unsupported_preview.len() < UNSUPPORTED_PREVIEW_CAP {
                        unsupported_preview
                            .push(format!("{} ({failure})", queued.path.display()));
                    }
                    unsupported_paths.push(queued.path.clone());
                }
            }

            self.shared.add_bytes(queued.bytes);
            sink.on_file_complete(position as u64 + 1, job.len());
            sink.on_rate(&self.sample_rates(&counter, total_bytes));
        }

        let state = if aborted {
            RunState::Aborted
        } else {
            RunState::Completed
        };
        self.shared.finish(state);

        let files_processed = self.shared.files_done();
        let status = if aborted {
            "Processing aborted.".to_string()
        } else {
            format!(
                "Processing complete. {files_processed} of {} files processed.",
                job.len()
            )
        };
        sink.on_status(&status);
        info!(%run_id, ?state, files_processed, entities = counter.get(), "ingestion run finished");

        Ok(IngestionOutcome {
            run_id,
            state,
            files_queued: job.len(),
            files_processed,
            entities_found: counter.get(),
            unsupported_count: self.shared.unsupported(),
            unsupported_preview,
            unsupported_paths,
            status,
        })
    }

    /// Moves the run onto a dedicated background thread. The store travels
    /// with the worker and comes back through [`RunHandle::join`].
    pub fn spawn(
        self,
        job: IngestionJob,
        store: DedupStore,
        sink: Arc<dyn ProgressSink>,
    ) -> RunHandle {
        let shared = Arc::clone(&self.shared);
        let handle = thread::spawn(move || {
            let mut store = store;
            self.run(&job, &mut store, sink.as_ref())
                .map(|outcome| (store, outcome))
        });

        RunHandle { shared, handle }
    }

    fn process_file(
        &self,
        queued: &QueuedFile,
        store: &mut DedupStore,
        sink: &dyn ProgressSink,
    ) -> Result<FileDisposition, IngestError> {
        let kind = match sniff_kind(&queued.path) {
            Ok(Some(kind)) => kind,
            Ok(None) => return Ok(FileDisposition::Unsupported("no matching adapter".into())),
            Err(failure) => {
                warn!(path = %queued.path.display(), %failure, "could not sniff file type");
                return Ok(FileDisposition::Unsupported(failure.to_string()));
            }
        };

        let sections = match adapt_file(&queued.path, kind) {
            Ok(sections) => sections,
            Err(failure) => {
                warn!(path = %queued.path.display(), %failure, "adapter failed to read file");
                return Ok(FileDisposition::Unsupported(failure.to_string()));
            }
        };

        let checksum = digest_file(&queued.path)?;
        let mut scope = store.begin_file();

        for section in &sections {
            let matches = self.dispatcher.dispatch(
                &self.catalog,
                &self.registry,
                section.content.full_text(),
                || self.shared.abort_requested(),
            );

            let file_id =
                scope.ensure_file(&queued.path, &section.name, kind.mime_type(), &checksum);

            for raw in matches {
                let timestamp = self.resolver.resolve(section.content.full_text(), raw.start);
                let (start_unit, end_unit) = section.content.locate(raw.start, raw.end);
                let distinct = scope.resolve_distinct(&raw.text, raw.entity_type);
                scope.record_occurrence(
                    distinct,
                    file_id,
                    raw.entity_type,
                    start_unit + 1,
                    timestamp,
                    &section.content,
                    (start_unit, end_unit),
                )?;
            }

            sink.on_status(&format!("Finished processing {}", section.name));
        }

        scope.commit();
        Ok(FileDisposition::Processed)
    }

    fn sample_rates(&self, counter: &EntityCounter, total_bytes: u64) -> RateSample {
        let elapsed = self.shared.elapsed_secs();
        let total_entities = counter.get();
        let files_processed = self.shared.files_done();
        let bytes_done = self.shared.bytes_done();

        let per_sec = |count: u64| {
            if elapsed > 0.0 {
                count as f64 / elapsed
            } else {
                0.0
            }
        };

        let bytes_per_sec = per_sec(bytes_done);
        let eta_secs = if bytes_per_sec > 0.0 {
            Some(total_bytes.saturating_sub(bytes_done) as f64 / bytes_per_sec)
        } else {
            None
        };

        RateSample {
            entities_per_sec: per_sec(total_entities),
            total_entities,
            files_per_sec: per_sec(files_processed),
            files_processed,
            bytes_per_sec,
            eta_secs,
        }
    }
}

/// Join handle for a spawned ingestion run.
pub struct RunHandle {
    shared: Arc<SharedRunState>,
    handle: JoinHandle<Result<(DedupStore, IngestionOutcome), IngestError>>,
}

impl RunHandle {
    pub fn abort(&self) {
        self.shared.request_abort();
    }

    pub fn state(&self) -> RunState {
        self.shared.state()
    }

    pub fn join(self) -> Result<(DedupStore, IngestionOutcome), IngestError> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(IngestError::WorkerFailed(
                "ingestion worker panicked".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{discover_files, IngestionCoordinator, IngestionJob, NullProgress, RunState};
    use crate::catalog::{CatalogEntry, EntityTypeCatalog};
    use crate::routines::RoutineRegistry;
    use crate::store::DedupStore;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn entry(code: &str) -> CatalogEntry {
        CatalogEntry {
            code: code.to_string(),
            name: None,
            pattern: None,
            routine: None,
            parent: None,
        }
    }

    fn test_catalog(registry: &RoutineRegistry) -> Arc<EntityTypeCatalog> {
        Arc::new(
            EntityTypeCatalog::from_entries(
                vec![
                    CatalogEntry {
                        routine: Some("ipv4".into()),
                        ..entry("ip")
                    },
                    CatalogEntry {
                        pattern: Some(r"[a-z]+@[a-z]+\.[a-z]{2,}".into()),
                        ..entry("email")
                    },
                ],
                registry,
            )
            .unwrap(),
        )
    }

    fn coordinator_with(registry: Arc<RoutineRegistry>) -> IngestionCoordinator {
        let catalog = test_catalog(&registry);
        IngestionCoordinator::new(catalog, registry).unwrap()
    }

    #[test]
    fn ingests_text_file_with_timestamps_and_lines() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("events.log");
        fs::write(
            &path,
            "2023-06-15 08:30:00 session open\nlogin from 8.8.8.8\ncontact ops@example.com\n",
        )?;

        let registry = Arc::new(RoutineRegistry::with_builtins());
        let coordinator = coordinator_with(Arc::clone(&registry));
        let mut store = DedupStore::new();

        let job = IngestionJob::from_paths(vec![path]);
        let outcome = coordinator.run(&job, &mut store, &NullProgress)?;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.files_processed, 1);
        assert_eq!(store.file_count(), 1);
        assert_eq!(store.distinct_count(), 2);
        assert_eq!(store.occurrence_count(), 2);

        let catalog = test_catalog(&registry);
        let ip_type = catalog.resolve("ip").unwrap().id;
        let ip = store.find_distinct("8.8.8.8", ip_type).unwrap();
        let sightings = store.occurrences_of(ip.id);
        assert_eq!(sightings.len(), 1);
        assert_eq!(sightings[0].line, 2);
        assert_eq!(
            sightings[0].timestamp.map(|t| t.to_string()),
            Some("2023-06-15 08:30:00".to_string())
        );

        let snippet = store.context(sightings[0].id).unwrap();
        assert_eq!(snippet.small, "login from 8.8.8.8");

        Ok(())
    }

    #[test]
    fn reingesting_the_same_files_is_idempotent() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        fs::write(&path, "node 10.0.0.1 talked to 8.8.8.8\n")?;

        let registry = Arc::new(RoutineRegistry::with_builtins());
        let coordinator = coordinator_with(Arc::clone(&registry));
        let mut store = DedupStore::new();
        let job = IngestionJob::from_paths(vec![path]);

        coordinator.run(&job, &mut store, &NullProgress)?;
        let distinct_after_first = store.distinct_count();
        let occurrences_after_first = store.occurrence_count();

        let second = coordinator_with(Arc::clone(&registry));
        second.run(&job, &mut store, &NullProgress)?;

        assert_eq!(store.distinct_count(), distinct_after_first);
        assert_eq!(store.occurrence_count(), occurrences_after_first);
        assert_eq!(store.file_count(), 1);
        Ok(())
    }

    #[test]
    fn correlates_one_value_across_two_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let first = dir.path().join("a.txt");
        let second = dir.path().join("b.txt");
        fs::write(&first, "seen 8.8.8.8 here\n")?;
        fs::write(&second, "and 8.8.8.8 there\n")?;

        let registry = Arc::new(RoutineRegistry::with_builtins());
        let coordinator = coordinator_with(Arc::clone(&registry));
        let mut store = DedupStore::new();

        let job = IngestionJob::from_paths(vec![first, second]);
        coordinator.run(&job, &mut store, &NullProgress)?;

        assert_eq!(store.distinct_count(), 1);
        assert_eq!(store.occurrence_count(), 2);
        assert_eq!(store.file_count(), 2);
        Ok(())
    }

    #[test]
    fn unsupported_file_creates_no_records() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("blob.bin");
        fs::write(&path, [0x00u8, 0xff, 0x00, 0x13])?;

        let registry = Arc::new(RoutineRegistry::with_builtins());
        let coordinator = coordinator_with(Arc::clone(&registry));
        let mut store = DedupStore::new();

        let job = IngestionJob::from_paths(vec![path]);
        let outcome = coordinator.run(&job, &mut store, &NullProgress)?;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.files_processed, 0);
        assert_eq!(outcome.unsupported_count, 1);
        assert_eq!(outcome.unsupported_paths.len(), 1);
        assert_eq!(outcome.unsupported_preview.len(), 1);
        assert_eq!(store.file_count(), 0);
        assert_eq!(store.occurrence_count(), 0);
        Ok(())
    }

    #[test]
    fn corrupt_pdf_is_isolated_and_the_run_continues() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let broken = dir.path().join("broken.pdf");
        let healthy = dir.path().join("fine.txt");
        fs::write(&broken, b"%PDF-1.4\n%broken")?;
        fs::write(&healthy, "peer 8.8.8.8\n")?;

        let registry = Arc::new(RoutineRegistry::with_builtins());
        let coordinator = coordinator_with(Arc::clone(&registry));
        let mut store = DedupStore::new();

        let job = IngestionJob::from_paths(vec![broken, healthy]);
        let outcome = coordinator.run(&job, &mut store, &NullProgress)?;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(outcome.files_processed, 1);
        assert_eq!(outcome.unsupported_count, 1);
        assert_eq!(store.file_count(), 1);
        assert_eq!(store.occurrence_count(), 1);
        Ok(())
    }

    #[test]
    fn abort_requested_before_start_schedules_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        fs::write(&path, "peer 8.8.8.8\n")?;

        let registry = Arc::new(RoutineRegistry::with_builtins());
        let coordinator = coordinator_with(Arc::clone(&registry));
        coordinator.shared().request_abort();

        let mut store = DedupStore::new();
        let job = IngestionJob::from_paths(vec![path]);
        let outcome = coordinator.run(&job, &mut store, &NullProgress)?;

        assert_eq!(outcome.state, RunState::Aborted);
        assert_eq!(outcome.files_processed, 0);
        assert_eq!(store.occurrence_count(), 0);
        Ok(())
    }

    #[test]
    fn abort_mid_run_keeps_finished_files_and_skips_the_rest(
    ) -> Result<(), Box<dyn std::error::Error>> {
        use super::{ProgressSink, SharedRunState};

        struct AbortAfterFirstFile {
            shared: Arc<SharedRunState>,
        }

        impl ProgressSink for AbortAfterFirstFile {
            fn on_file_complete(&self, _position: u64, _queued: usize) {
                self.shared.request_abort();
            }
        }

        let dir = tempdir()?;
        let first = dir.path().join("a.txt");
        let second = dir.path().join("b.txt");
        fs::write(&first, "first 8.8.8.8\n")?;
        fs::write(&second, "second 1.1.1.1\n")?;

        let registry = Arc::new(RoutineRegistry::with_builtins());
        let coordinator = coordinator_with(Arc::clone(&registry));
        let sink = AbortAfterFirstFile {
            shared: coordinator.shared(),
        };

        let mut store = DedupStore::new();
        let job = IngestionJob::from_paths(vec![first, second]);
        let outcome = coordinator.run(&job, &mut store, &sink)?;

        assert_eq!(outcome.state, RunState::Aborted);
        assert_eq!(outcome.files_processed, 1);

        // The dispatched file persisted in full, snippets included.
        assert_eq!(store.file_count(), 1);
        assert_eq!(store.occurrence_count(), 1);
        let occurrence = &store.occurrences()[0];
        assert!(store.context(occurrence.id).is_some());

        let catalog = test_catalog(&registry);
        let ip_type = catalog.resolve("ip").unwrap().id;
        assert!(store.find_distinct("1.1.1.1", ip_type).is_none());
        Ok(())
    }

    #[test]
    fn spawned_run_returns_store_through_join() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("a.txt");
        fs::write(&path, "peer 8.8.8.8\n")?;

        let registry = Arc::new(RoutineRegistry::with_builtins());
        let coordinator = coordinator_with(registry);
        let job = IngestionJob::from_paths(vec![path]);

        let handle = coordinator.spawn(job, DedupStore::new(), Arc::new(NullProgress));
        let (store, outcome) = handle.join()?;

        assert_eq!(outcome.state, RunState::Completed);
        assert_eq!(store.occurrence_count(), 1);
        Ok(())
    }

    #[test]
    fn discover_files_walks_recursively_in_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        fs::create_dir(dir.path().join("nested"))?;
        fs::write(dir.path().join("b.txt"), "b")?;
        fs::write(dir.path().join("nested").join("a.txt"), "a")?;

        let files = discover_files(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with(Path::new("b.txt")));
        assert!(files[1].ends_with(Path::new("nested/a.txt")));
        Ok(())
    }

    #[test]
    fn job_tracks_total_queued_bytes() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "12345")?;
        fs::write(&b, "1234567890")?;

        let job = IngestionJob::from_paths(vec![a, b]);
        assert_eq!(job.total_bytes(), 15);
        assert_eq!(job.len(), 2);
        Ok(())
    }
}
