use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracesift_core::{
    discover_files, DedupStore, EntityTypeCatalog, IngestionCoordinator, IngestionJob,
    ProgressSink, RateSample, ResolvedRule, RoutineRegistry,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "tracesift", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Entity type catalog (YAML).
    #[arg(long, default_value = "data/entities.yaml", global = true)]
    catalog: PathBuf,

    /// Optional wordlist file, one word per line, registered as the
    /// `wordlist` routine.
    #[arg(long, global = true)]
    wordlist: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest every file under the given folders and report what was found.
    Ingest {
        /// Folders scanned recursively for input files.
        #[arg(long, required = true)]
        input: Vec<PathBuf>,

        /// Maximum number of distinct entities to print in the summary.
        #[arg(long, default_value = "10")]
        top: usize,
    },
    /// Validate the catalog and print the resolved entity type tree.
    Catalog,
}

struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn on_status(&self, status: &str) {
        info!("{status}");
    }

    fn on_file_complete(&self, position: u64, queued: usize) {
        info!("file {position} of {queued} done");
    }

    fn on_rate(&self, sample: &RateSample) {
        let eta = sample
            .eta_secs
            .map(|secs| format!("{secs:.0}s"))
            .unwrap_or_else(|| "unknown".to_string());
        info!(
            "{:.2} entities/s (total {}), {:.2} files/s (total {}), {:.0} bytes/s, eta {eta}",
            sample.entities_per_sec,
            sample.total_entities,
            sample.files_per_sec,
            sample.files_processed,
            sample.bytes_per_sec,
        );
    }
}

fn build_registry(wordlist: Option<&PathBuf>) -> anyhow::Result<RoutineRegistry> {
    let mut registry = RoutineRegistry::with_builtins();

    if let Some(path) = wordlist {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading wordlist {}", path.display()))?;
        let words: Vec<String> = raw.lines().map(str::to_string).collect();
        registry.register_wordlist("wordlist", words);
    }

    Ok(registry)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    let app_version = env!("CARGO_PKG_VERSION");
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "tracesift boot"
    );

    let registry = build_registry(cli.wordlist.as_ref())?;
    let catalog = EntityTypeCatalog::load(&cli.catalog, &registry)
        .with_context(|| format!("loading catalog {}", cli.catalog.display()))?;

    match cli.command {
        Command::Catalog => {
            print_catalog(&catalog);
        }
        Command::Ingest { input, top } => {
            let mut paths = Vec::new();
            for folder in &input {
                paths.extend(discover_files(folder));
            }
            if paths.is_empty() {
                anyhow::bail!("no files found under the given input folders");
            }

            let job = IngestionJob::from_paths(paths);
            info!(files = job.len(), bytes = job.total_bytes(), "queue built");

            let coordinator =
                IngestionCoordinator::new(Arc::new(catalog), Arc::new(registry))
                    .map_err(|error| anyhow::anyhow!(error.to_string()))?;
            let handle = coordinator.spawn(job, DedupStore::new(), Arc::new(ConsoleProgress));

            let (store, outcome) = handle
                .join()
                .map_err(|error| anyhow::anyhow!(error.to_string()))?;

            println!("{}", outcome.status);
            println!(
                "run {}: {} entities across {} distinct values in {} file records",
                outcome.run_id,
                store.occurrence_count(),
                store.distinct_count(),
                store.file_count()
            );

            if outcome.unsupported_count > 0 {
                warn!(
                    "{} unsupported or failed files (showing up to {})",
                    outcome.unsupported_count,
                    outcome.unsupported_preview.len()
                );
                for line in &outcome.unsupported_preview {
                    warn!("  {line}");
                }
            }

            print_top_entities(&store, top);
        }
    }

    Ok(())
}

fn print_catalog(catalog: &EntityTypeCatalog) {
    println!("{} entity types", catalog.len());
    for root in catalog.roots() {
        print_catalog_node(catalog, root, 0);
    }
}

fn print_catalog_node(
    catalog: &EntityTypeCatalog,
    entity_type: &tracesift_core::EntityType,
    depth: usize,
) {
    let rule = match &entity_type.rule {
        Some(ResolvedRule::Pattern(_)) => "pattern",
        Some(ResolvedRule::Routine(name)) => name.as_str(),
        None => "category",
    };
    println!(
        "{:indent$}{} [{rule}] {}",
        "",
        entity_type.code,
        entity_type.name,
        indent = depth * 2
    );

    for child in catalog.children(entity_type.id) {
        if let Some(node) = catalog.get(*child) {
            print_catalog_node(catalog, node, depth + 1);
        }
    }
}

fn print_top_entities(store: &DedupStore, top: usize) {
    if top == 0 {
        return;
    }

    let mut sightings: HashMap<_, usize> = HashMap::new();
    for occurrence in store.occurrences() {
        *sightings.entry(occurrence.distinct_entity).or_default() += 1;
    }

    let mut ranked: Vec<_> = store
        .distinct_entities()
        .iter()
        .map(|entity| (entity, sightings.get(&entity.id).copied().unwrap_or(0)))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.value.cmp(&b.0.value)));

    for (entity, count) in ranked.into_iter().take(top) {
        println!("  {count:>6}  {}", entity.value);
    }
}
