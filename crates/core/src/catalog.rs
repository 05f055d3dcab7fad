use crate::error::CatalogError;
use crate::models::EntityTypeId;
use crate::routines::RoutineRegistry;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

/// One entity type definition as written in the catalog file. Entries with
/// neither a pattern nor a routine are category nodes for the hierarchy.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    pub code: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub routine: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

/// A rule that survived resolution: a compiled pattern or a routine name
/// known to the registry.
#[derive(Debug, Clone)]
pub enum ResolvedRule {
    Pattern(Regex),
    Routine(String),
}

#[derive(Debug, Clone)]
pub struct EntityType {
    pub id: EntityTypeId,
    pub code: String,
    pub name: String,
    pub rule: Option<ResolvedRule>,
    pub parent: Option<EntityTypeId>,
}

/// The loaded entity type catalog: an arena of nodes with parent
/// back-references and a children index precomputed once at load. The
/// hierarchy is never re-derived during ingestion.
pub struct EntityTypeCatalog {
    types: Vec<EntityType>,
    by_code: HashMap<String, EntityTypeId>,
    children: Vec<Vec<EntityTypeId>>,
}

impl EntityTypeCatalog {
    pub fn load(path: &Path, registry: &RoutineRegistry) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path)?;
        let entries: Vec<CatalogEntry> = serde_yaml::from_str(&raw)?;
        if entries.is_empty() {
            return Err(CatalogError::Empty(path.display().to_string()));
        }
        Self::from_entries(entries, registry)
    }

    pub fn from_entries(
        entries: Vec<CatalogEntry>,
        registry: &RoutineRegistry,
    ) -> Result<Self, CatalogError> {
        reject_duplicates(&entries)?;

        let mut by_code = HashMap::new();
        for (index, entry) in entries.iter().enumerate() {
            by_code.insert(entry.code.clone(), EntityTypeId(index as u32));
        }

        let mut types = Vec::with_capacity(entries.len());
        for (index, entry) in entries.iter().enumerate() {
            let id = EntityTypeId(index as u32);
            let rule = resolve_rule(entry, registry)?;
            let parent = resolve_parent(entry, id, &by_code);

            types.push(EntityType {
                id,
                code: entry.code.clone(),
                name: entry.name.clone().unwrap_or_else(|| entry.code.clone()),
                rule,
                parent,
            });
        }

        let mut children = vec![Vec::new(); types.len()];
        for entity_type in &types {
            if let Some(parent) = entity_type.parent {
                children[parent.0 as usize].push(entity_type.id);
            }
        }

        Ok(Self {
            types,
            by_code,
            children,
        })
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn get(&self, id: EntityTypeId) -> Option<&EntityType> {
        self.types.get(id.0 as usize)
    }

    pub fn resolve(&self, code: &str) -> Option<&EntityType> {
        self.by_code.get(code).and_then(|id| self.get(*id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntityType> {
        self.types.iter()
    }

    /// Entity types that carry a resolved extraction rule, in catalog order.
    pub fn rule_bearing(&self) -> impl Iterator<Item = &EntityType> {
        self.types.iter().filter(|t| t.rule.is_some())
    }

    pub fn children(&self, id: EntityTypeId) -> &[EntityTypeId] {
        self.children
            .get(id.0 as usize)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn roots(&self) -> impl Iterator<Item = &EntityType> {
        self.types.iter().filter(|t| t.parent.is_none())
    }

    /// Walks parent back-references from `id` to the root, nearest first.
    pub fn ancestors(&self, id: EntityTypeId) -> Vec<EntityTypeId> {
        let mut chain = Vec::new();
        let mut cursor = self.get(id).and_then(|t| t.parent);

        while let Some(parent) = cursor {
            if chain.contains(&parent) || chain.len() > self.types.len() {
                warn!(code = ?self.get(id).map(|t| &t.code), "parent cycle in catalog, truncating walk");
                break;
            }
            chain.push(parent);
            cursor = self.get(parent).and_then(|t| t.parent);
        }

        chain
    }
}

fn reject_duplicates(entries: &[CatalogEntry]) -> Result<(), CatalogError> {
    let mut seen_codes: HashSet<&str> = HashSet::new();
    let mut seen_patterns: HashMap<&str, &str> = HashMap::new();
    let mut seen_routines: HashMap<&str, &str> = HashMap::new();

    for entry in entries {
        if !seen_codes.insert(entry.code.as_str()) {
            return Err(CatalogError::DuplicateCode(entry.code.clone()));
        }

        if entry.pattern.is_some() && entry.routine.is_some() {
            return Err(CatalogError::AmbiguousRule {
                code: entry.code.clone(),
            });
        }

        if let Some(pattern) = entry.pattern.as_deref().filter(|p| !p.trim().is_empty()) {
            if let Some(first) = seen_patterns.insert(pattern, entry.code.as_str()) {
                return Err(CatalogError::DuplicatePattern {
                    first: first.to_string(),
                    second: entry.code.clone(),
                });
            }
        }

        if let Some(routine) = entry.routine.as_deref().filter(|r| !r.trim().is_empty()) {
            if let Some(first) = seen_routines.insert(routine, entry.code.as_str()) {
                return Err(CatalogError::DuplicateRoutine {
                    first: first.to_string(),
                    second: entry.code.clone(),
                });
            }
        }
    }

    Ok(())
}

fn resolve_rule(
    entry: &CatalogEntry,
    registry: &RoutineRegistry,
) -> Result<Option<ResolvedRule>, CatalogError> {
    if let Some(pattern) = entry.pattern.as_deref().filter(|p| !p.trim().is_empty()) {
        return match Regex::new(pattern) {
            Ok(compiled) => Ok(Some(ResolvedRule::Pattern(compiled))),
            Err(error) => {
                warn!(code = %entry.code, %error, "invalid pattern, entity type will yield no matches");
                Ok(None)
            }
        };
    }

    if let Some(routine) = entry.routine.as_deref().filter(|r| !r.trim().is_empty()) {
        if registry.contains(routine) {
            return Ok(Some(ResolvedRule::Routine(routine.to_string())));
        }
        warn!(code = %entry.code, routine, "unresolved routine reference, entity type will yield no matches");
        return Ok(None);
    }

    Ok(None)
}

fn resolve_parent(
    entry: &CatalogEntry,
    id: EntityTypeId,
    by_code: &HashMap<String, EntityTypeId>,
) -> Option<EntityTypeId> {
    let parent_code = entry.parent.as_deref()?.trim();
    if parent_code.is_empty() {
        return None;
    }

    match by_code.get(parent_code) {
        Some(parent) if *parent != id => Some(*parent),
        Some(_) => {
            warn!(code = %entry.code, "entity type cannot be its own parent");
            None
        }
        None => {
            warn!(code = %entry.code, parent = parent_code, "unknown parent, attaching to root");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CatalogEntry, EntityTypeCatalog, ResolvedRule};
    use crate::error::CatalogError;
    use crate::models::EntityTypeId;
    use crate::routines::RoutineRegistry;

    fn entry(code: &str) -> CatalogEntry {
        CatalogEntry {
            code: code.to_string(),
            name: None,
            pattern: None,
            routine: None,
            parent: None,
        }
    }

    #[test]
    fn builds_hierarchy_with_children_index() {
        let registry = RoutineRegistry::with_builtins();
        let entries = vec![
            entry("network"),
            CatalogEntry {
                routine: Some("ipv4-public".into()),
                parent: Some("network".into()),
                ..entry("ipv4-public")
            },
            CatalogEntry {
                pattern: Some(r"[a-z]+@[a-z]+\.[a-z]{2,}".into()),
                parent: Some("network".into()),
                ..entry("email")
            },
        ];

        let catalog = EntityTypeCatalog::from_entries(entries, &registry).unwrap();

        assert_eq!(catalog.len(), 3);
        let network = catalog.resolve("network").unwrap();
        assert!(network.rule.is_none());
        assert_eq!(catalog.children(network.id).len(), 2);

        let email = catalog.resolve("email").unwrap();
        assert_eq!(catalog.ancestors(email.id), vec![network.id]);
        assert!(matches!(email.rule, Some(ResolvedRule::Pattern(_))));
        assert_eq!(catalog.rule_bearing().count(), 2);
    }

    #[test]
    fn duplicate_codes_are_rejected() {
        let registry = RoutineRegistry::empty();
        let entries = vec![entry("a"), entry("a")];

        match EntityTypeCatalog::from_entries(entries, &registry) {
            Err(CatalogError::DuplicateCode(code)) => assert_eq!(code, "a"),
            other => panic!("unexpected result: {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    fn duplicate_patterns_are_rejected() {
        let registry = RoutineRegistry::empty();
        let entries = vec![
            CatalogEntry {
                pattern: Some(r"\d+".into()),
                ..entry("a")
            },
            CatalogEntry {
                pattern: Some(r"\d+".into()),
                ..entry("b")
            },
        ];

        assert!(matches!(
            EntityTypeCatalog::from_entries(entries, &registry),
            Err(CatalogError::DuplicatePattern { .. })
        ));
    }

    #[test]
    fn unresolved_routine_degrades_to_no_rule() {
        let registry = RoutineRegistry::empty();
        let entries = vec![CatalogEntry {
            routine: Some("does-not-exist".into()),
            ..entry("ghost")
        }];

        let catalog = EntityTypeCatalog::from_entries(entries, &registry).unwrap();
        assert!(catalog.resolve("ghost").unwrap().rule.is_none());
        assert_eq!(catalog.rule_bearing().count(), 0);
    }

    #[test]
    fn invalid_pattern_degrades_to_no_rule() {
        let registry = RoutineRegistry::empty();
        let entries = vec![CatalogEntry {
            pattern: Some(r"([unclosed".into()),
            ..entry("broken")
        }];

        let catalog = EntityTypeCatalog::from_entries(entries, &registry).unwrap();
        assert!(catalog.resolve("broken").unwrap().rule.is_none());
    }

    #[test]
    fn unknown_parent_attaches_to_root() {
        let registry = RoutineRegistry::empty();
        let entries = vec![CatalogEntry {
            parent: Some("missing".into()),
            ..entry("orphan")
        }];

        let catalog = EntityTypeCatalog::from_entries(entries, &registry).unwrap();
        assert_eq!(catalog.resolve("orphan").unwrap().parent, None);
        assert_eq!(catalog.roots().count(), 1);
        assert_eq!(catalog.children(EntityTypeId(0)), &[]);
    }
}
