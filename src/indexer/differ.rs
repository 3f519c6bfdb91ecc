use crate::model::{Classification, EntityKind, StoredEntity};
use std::collections::{HashMap, HashSet};

/// A freshly extracted tracked entity, as seen by the differ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub key: String,
    pub kind: EntityKind,
    pub fingerprint: String,
}

impl Candidate {
    pub fn new(key: &str, kind: EntityKind, fingerprint: &str) -> Self {
        Self {
            key: key.to_string(),
            kind,
            fingerprint: fingerprint.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub key: String,
    pub kind: EntityKind,
    pub classification: Classification,
}

/// Result of comparing stored tracked entities (database) against the
/// candidates just extracted from one unit.
#[derive(Debug, Default, Clone)]
pub struct EntityDiff {
    /// Keys not present in the store
    pub added: Vec<DiffEntry>,
    /// Keys present with a different fingerprint
    pub changed: Vec<DiffEntry>,
    /// Keys present with the same fingerprint (no store write)
    pub unchanged: Vec<DiffEntry>,
    /// Keys stored for this unit's file that no candidate claims
    pub removed: Vec<DiffEntry>,
}

impl EntityDiff {
    pub fn is_noop(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }

    /// Every entry in candidate order, removals last.
    pub fn entries(&self) -> impl Iterator<Item = &DiffEntry> {
        self.added
            .iter()
            .chain(self.changed.iter())
            .chain(self.unchanged.iter())
            .chain(self.removed.iter())
    }

    pub fn needs_write(&self, key: &str) -> bool {
        self.added.iter().chain(self.changed.iter()).any(|e| e.key == key)
    }
}

/// Classify candidates against what the store holds.
///
/// `stored` holds the tracked entities recorded for `path` plus any entity
/// found by key elsewhere (a module moving between `a.py` and
/// `a/__init__.py` keeps its key). Such an entity is classified as changed
/// so the write moves it to `path`. Only entities recorded for `path` can be
/// classified as removed.
pub fn compute_entity_diff(
    path: &str,
    stored: Vec<StoredEntity>,
    candidates: &[Candidate],
) -> EntityDiff {
    let stored_map: HashMap<String, StoredEntity> = stored
        .into_iter()
        .filter(|entity| entity.kind.is_tracked())
        .map(|entity| (entity.key.clone(), entity))
        .collect();

    let mut diff = EntityDiff::default();
    let mut seen: HashSet<&str> = HashSet::new();

    for candidate in candidates {
        if !seen.insert(candidate.key.as_str()) {
            continue;
        }
        let classification = match stored_map.get(&candidate.key) {
            None => Classification::New,
            Some(old)
                if old.file_path == path
                    && old.fingerprint.as_deref() == Some(candidate.fingerprint.as_str()) =>
            {
                Classification::Unchanged
            }
            Some(_) => Classification::Changed,
        };
        let entry = DiffEntry {
            key: candidate.key.clone(),
            kind: candidate.kind,
            classification,
        };
        match classification {
            Classification::New => diff.added.push(entry),
            Classification::Changed => diff.changed.push(entry),
            _ => diff.unchanged.push(entry),
        }
    }

    let mut removed: Vec<DiffEntry> = stored_map
        .values()
        .filter(|entity| entity.file_path == path && !seen.contains(entity.key.as_str()))
        .map(|entity| DiffEntry {
            key: entity.key.clone(),
            kind: entity.kind,
            classification: Classification::Removed,
        })
        .collect();
    removed.sort_by(|a, b| a.key.cmp(&b.key));
    diff.removed = removed;

    diff
}

/// Everything stored for a file that no longer exists.
pub fn removed_file_diff(stored: Vec<StoredEntity>) -> EntityDiff {
    let mut removed: Vec<DiffEntry> = stored
        .into_iter()
        .filter(|entity| entity.kind.is_tracked())
        .map(|entity| DiffEntry {
            key: entity.key,
            kind: entity.kind,
            classification: Classification::Removed,
        })
        .collect();
    removed.sort_by(|a, b| a.key.cmp(&b.key));
    EntityDiff {
        removed,
        ..EntityDiff::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stored(key: &str, kind: EntityKind, fingerprint: &str, path: &str) -> StoredEntity {
        StoredEntity {
            key: key.to_string(),
            kind,
            name: key.rsplit('.').next().unwrap_or(key).to_string(),
            module: "m".to_string(),
            file_path: path.to_string(),
            parent_key: None,
            owner_key: None,
            fingerprint: Some(fingerprint.to_string()),
            attributes: json!({}),
            enrichment: None,
            enriched_fingerprint: None,
        }
    }

    #[test]
    fn test_all_entities_added() {
        let candidates = vec![
            Candidate::new("m", EntityKind::Module, "aa"),
            Candidate::new("m.f", EntityKind::Function, "bb"),
        ];
        let diff = compute_entity_diff("m.py", Vec::new(), &candidates);
        assert_eq!(diff.added.len(), 2);
        assert!(diff.changed.is_empty() && diff.unchanged.is_empty() && diff.removed.is_empty());
        assert_eq!(diff.added[0].key, "m");
    }

    #[test]
    fn test_mixed_changes() {
        let old = vec![
            stored("m", EntityKind::Module, "m1", "m.py"),
            stored("m.A", EntityKind::Class, "a1", "m.py"),
            stored("m.A.run", EntityKind::Method, "r1", "m.py"),
            stored("m.gone", EntityKind::Function, "g1", "m.py"),
        ];
        let candidates = vec![
            Candidate::new("m", EntityKind::Module, "m2"),
            Candidate::new("m.A", EntityKind::Class, "a2"),
            Candidate::new("m.A.run", EntityKind::Method, "r1"),
            Candidate::new("m.fresh", EntityKind::Function, "f1"),
        ];
        let diff = compute_entity_diff("m.py", old, &candidates);
        let keys = |entries: &[DiffEntry]| entries.iter().map(|e| e.key.clone()).collect::<Vec<_>>();
        assert_eq!(keys(&diff.changed), vec!["m", "m.A"]);
        assert_eq!(keys(&diff.unchanged), vec!["m.A.run"]);
        assert_eq!(keys(&diff.added), vec!["m.fresh"]);
        assert_eq!(keys(&diff.removed), vec!["m.gone"]);
        assert!(diff.needs_write("m.A"));
        assert!(!diff.needs_write("m.A.run"));
    }

    #[test]
    fn test_unchanged_unit_is_noop() {
        let old = vec![stored("m", EntityKind::Module, "m1", "m.py")];
        let candidates = vec![Candidate::new("m", EntityKind::Module, "m1")];
        let diff = compute_entity_diff("m.py", old, &candidates);
        assert!(diff.is_noop());
        assert_eq!(diff.unchanged.len(), 1);
    }

    #[test]
    fn test_entity_from_other_file_is_not_removed() {
        let old = vec![stored("pkg", EntityKind::Module, "x", "pkg.py")];
        let candidates = vec![Candidate::new("pkg", EntityKind::Module, "y")];
        let diff = compute_entity_diff("pkg/__init__.py", old, &candidates);
        assert_eq!(diff.changed.len(), 1);
        assert!(diff.removed.is_empty());
    }

    #[test]
    fn test_moved_entity_with_same_fingerprint_is_changed() {
        let old = vec![stored("pkg", EntityKind::Module, "x", "pkg.py")];
        let candidates = vec![Candidate::new("pkg", EntityKind::Module, "x")];
        let diff = compute_entity_diff("pkg/__init__.py", old, &candidates);
        assert_eq!(diff.changed.len(), 1);
        assert!(diff.unchanged.is_empty());
    }

    #[test]
    fn test_removed_file_diff() {
        let old = vec![
            stored("m.f", EntityKind::Function, "f", "m.py"),
            stored("m", EntityKind::Module, "m", "m.py"),
            stored("m.f.x", EntityKind::Parameter, "", "m.py"),
        ];
        let diff = removed_file_diff(old);
        let keys: Vec<&str> = diff.removed.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["m", "m.f"]);
    }
}
