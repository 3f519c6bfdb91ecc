use crate::enrich::SemanticAnnotation;
use crate::error::StoreError;
use std::collections::HashMap;
use std::sync::Mutex;

/// Fingerprint-keyed store of semantic annotations.
///
/// Entries are written once per fingerprint and only removed by `clear`.
/// Failed enrichments are never stored.
pub trait EnrichmentCache: Send + Sync {
    fn get(&self, fingerprint: &str) -> Result<Option<SemanticAnnotation>, StoreError>;

    /// Insert unless an entry already exists for `fingerprint`.
    fn put(&self, fingerprint: &str, annotation: &SemanticAnnotation) -> Result<(), StoreError>;

    fn clear(&self) -> Result<usize, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;
}

/// In-process cache, used when no persistent store backs the run.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, SemanticAnnotation>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EnrichmentCache for MemoryCache {
    fn get(&self, fingerprint: &str) -> Result<Option<SemanticAnnotation>, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.get(fingerprint).cloned())
    }

    fn put(&self, fingerprint: &str, annotation: &SemanticAnnotation) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        entries
            .entry(fingerprint.to_string())
            .or_insert_with(|| annotation.clone());
        Ok(())
    }

    fn clear(&self) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let count = entries.len();
        entries.clear();
        Ok(count)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let entries = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrich::AnnotationDetail;

    fn annotation(purpose: &str) -> SemanticAnnotation {
        SemanticAnnotation {
            purpose: purpose.to_string(),
            summary: String::new(),
            design_patterns: Vec::new(),
            domain_concepts: Vec::new(),
            detail: AnnotationDetail::Class {
                role: crate::enrich::ClassRole::Model,
                key_methods: Vec::new(),
                collaborators: Vec::new(),
            },
        }
    }

    #[test]
    fn put_keeps_first_entry() {
        let cache = MemoryCache::new();
        cache.put("fp1", &annotation("first")).unwrap();
        cache.put("fp1", &annotation("second")).unwrap();
        assert_eq!(cache.get("fp1").unwrap().unwrap().purpose, "first");
        assert_eq!(cache.len().unwrap(), 1);
        assert!(cache.get("fp2").unwrap().is_none());
    }

    #[test]
    fn clear_reports_removed_entries() {
        let cache = MemoryCache::new();
        cache.put("a", &annotation("a")).unwrap();
        cache.put("b", &annotation("b")).unwrap();
        assert_eq!(cache.clear().unwrap(), 2);
        assert_eq!(cache.len().unwrap(), 0);
    }
}
