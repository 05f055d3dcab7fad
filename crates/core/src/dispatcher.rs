use crate::catalog::{EntityType, EntityTypeCatalog, ResolvedRule};
use crate::error::IngestError;
use crate::models::RawMatch;
use crate::routines::RoutineRegistry;
use rayon::ThreadPool;
use std::sync::mpsc;
use tracing::warn;

/// Evaluates every rule-bearing entity type against a section's content on
/// a worker pool sized to the available cores. Rule evaluations are
/// independent: one bad rule never suppresses the others.
pub struct ParserDispatcher {
    pool: ThreadPool,
}

impl ParserDispatcher {
    pub fn new() -> Result<Self, IngestError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .build()
            .map_err(|error| IngestError::WorkerPool(error.to_string()))?;
        Ok(Self { pool })
    }

    /// Runs all rules and merges their matches into one list. The abort
    /// flag is polled between joined results; evaluations already
    /// dispatched always run to completion.
    pub fn dispatch<F>(
        &self,
        catalog: &EntityTypeCatalog,
        registry: &RoutineRegistry,
        content: &str,
        abort: F,
    ) -> Vec<RawMatch>
    where
        F: Fn() -> bool + Send,
    {
        let (sender, receiver) = mpsc::channel();

        self.pool.scope(move |scope| {
            for entity_type in catalog.rule_bearing() {
                let sender = sender.clone();
                scope.spawn(move |_| {
                    let _ = sender.send(evaluate_rule(entity_type, registry, content));
                });
            }
            drop(sender);

            let mut matches = Vec::new();
            while let Ok(batch) = receiver.recv() {
                if abort() {
                    break;
                }
                matches.extend(batch);
            }
            matches
        })
    }
}

fn evaluate_rule(
    entity_type: &EntityType,
    registry: &RoutineRegistry,
    content: &str,
) -> Vec<RawMatch> {
    let Some(rule) = &entity_type.rule else {
        return Vec::new();
    };

    let spans: Vec<(String, usize, usize)> = match rule {
        ResolvedRule::Pattern(pattern) => pattern
            .find_iter(content)
            .map(|hit| (hit.as_str().to_string(), hit.start(), hit.end()))
            .collect(),
        ResolvedRule::Routine(name) => match registry.invoke(name, content) {
            Ok(spans) => spans
                .into_iter()
                .map(|span| (span.text, span.start, span.end))
                .collect(),
            Err(error) => {
                warn!(code = %entity_type.code, %error, "extraction routine failed, rule yields no matches");
                Vec::new()
            }
        },
    };

    spans
        .into_iter()
        .filter(|(text, _, _)| !text.trim().is_empty())
        .map(|(text, start, end)| RawMatch {
            entity_type: entity_type.id,
            text,
            start,
            end,
        })
        .collect()
}
