use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Upper bound on examples kept per failure class in a run report.
pub const MAX_REPORT_EXAMPLES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Module,
    Class,
    Function,
    Method,
    Parameter,
    Attribute,
    Decorator,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Module => "module",
            EntityKind::Class => "class",
            EntityKind::Function => "function",
            EntityKind::Method => "method",
            EntityKind::Parameter => "parameter",
            EntityKind::Attribute => "attribute",
            EntityKind::Decorator => "decorator",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "module" => Some(EntityKind::Module),
            "class" => Some(EntityKind::Class),
            "function" => Some(EntityKind::Function),
            "method" => Some(EntityKind::Method),
            "parameter" => Some(EntityKind::Parameter),
            "attribute" => Some(EntityKind::Attribute),
            "decorator" => Some(EntityKind::Decorator),
            _ => None,
        }
    }

    /// Tracked entities carry a fingerprint and are diffed by the updater;
    /// the rest are owned by a tracked entity and replaced with it.
    pub fn is_tracked(&self) -> bool {
        matches!(
            self,
            EntityKind::Module | EntityKind::Class | EntityKind::Function | EntityKind::Method
        )
    }

    pub fn is_enrichable(&self) -> bool {
        matches!(
            self,
            EntityKind::Class | EntityKind::Function | EntityKind::Method
        )
    }

    pub fn tracked() -> &'static [EntityKind] {
        &[
            EntityKind::Module,
            EntityKind::Class,
            EntityKind::Function,
            EntityKind::Method,
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeKind {
    Imports,
    Calls,
    InheritsFrom,
    DecoratedBy,
    ImplementsPattern,
    RelatesToConcept,
    CollaboratesWith,
    DataFlowsTo,
}

impl EdgeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Imports => "IMPORTS",
            EdgeKind::Calls => "CALLS",
            EdgeKind::InheritsFrom => "INHERITS_FROM",
            EdgeKind::DecoratedBy => "DECORATED_BY",
            EdgeKind::ImplementsPattern => "IMPLEMENTS_PATTERN",
            EdgeKind::RelatesToConcept => "RELATES_TO_CONCEPT",
            EdgeKind::CollaboratesWith => "COLLABORATES_WITH",
            EdgeKind::DataFlowsTo => "DATA_FLOWS_TO",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "IMPORTS" => Some(EdgeKind::Imports),
            "CALLS" => Some(EdgeKind::Calls),
            "INHERITS_FROM" => Some(EdgeKind::InheritsFrom),
            "DECORATED_BY" => Some(EdgeKind::DecoratedBy),
            "IMPLEMENTS_PATTERN" => Some(EdgeKind::ImplementsPattern),
            "RELATES_TO_CONCEPT" => Some(EdgeKind::RelatesToConcept),
            "COLLABORATES_WITH" => Some(EdgeKind::CollaboratesWith),
            "DATA_FLOWS_TO" => Some(EdgeKind::DataFlowsTo),
            _ => None,
        }
    }

    /// Edges derived from an enrichment payload rather than from source.
    pub fn is_semantic(&self) -> bool {
        matches!(
            self,
            EdgeKind::ImplementsPattern
                | EdgeKind::RelatesToConcept
                | EdgeKind::CollaboratesWith
                | EdgeKind::DataFlowsTo
        )
    }

    pub fn semantic() -> &'static [EdgeKind] {
        &[
            EdgeKind::ImplementsPattern,
            EdgeKind::RelatesToConcept,
            EdgeKind::CollaboratesWith,
            EdgeKind::DataFlowsTo,
        ]
    }
}

/// Target of a call or inheritance edge. Dynamic targets such as
/// `self.method()` stay `Unresolved` instead of being guessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EdgeTarget {
    Resolved { key: String },
    Unresolved { name: String },
}

impl EdgeTarget {
    pub fn unresolved(name: impl Into<String>) -> Self {
        EdgeTarget::Unresolved { name: name.into() }
    }

    pub fn resolved_key(&self) -> Option<&str> {
        match self {
            EdgeTarget::Resolved { key } => Some(key),
            EdgeTarget::Unresolved { .. } => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, EdgeTarget::Resolved { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeRecord {
    pub kind: EdgeKind,
    pub source_key: String,
    pub target: EdgeTarget,
    /// Name as written in source; kept even when the target resolves.
    pub target_name: String,
    pub position: i64,
    pub detail: Option<Value>,
}

/// Write-side shape of an entity handed to the graph store. Owned children
/// and outgoing edges are replaced together with the entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityRecord {
    pub key: String,
    pub kind: EntityKind,
    pub name: String,
    pub module: String,
    pub file_path: String,
    pub parent_key: Option<String>,
    pub fingerprint: Option<String>,
    pub attributes: Value,
    pub edges: Vec<EdgeRecord>,
    pub children: Vec<EntityRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEntity {
    pub key: String,
    pub kind: EntityKind,
    pub name: String,
    pub module: String,
    pub file_path: String,
    pub parent_key: Option<String>,
    pub owner_key: Option<String>,
    pub fingerprint: Option<String>,
    pub attributes: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<Value>,
    /// Fingerprint the attached enrichment was produced for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enriched_fingerprint: Option<String>,
}

impl StoredEntity {
    /// Whether the attached enrichment describes the current source.
    pub fn has_current_enrichment(&self) -> bool {
        self.enrichment.is_some()
            && self.enriched_fingerprint.is_some()
            && self.enriched_fingerprint == self.fingerprint
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredEdge {
    pub id: i64,
    pub kind: EdgeKind,
    pub owner_key: String,
    pub source_key: String,
    pub target_key: Option<String>,
    pub target_name: String,
    pub position: i64,
    pub detail: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileRecord {
    pub path: String,
    pub hash: String,
    pub module: String,
    pub revision: Option<String>,
    pub indexed_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    New,
    Unchanged,
    Changed,
    Removed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassificationCounts {
    pub new: usize,
    pub unchanged: usize,
    pub changed: usize,
    pub removed: usize,
}

impl ClassificationCounts {
    fn bump(&mut self, classification: Classification) {
        match classification {
            Classification::New => self.new += 1,
            Classification::Unchanged => self.unchanged += 1,
            Classification::Changed => self.changed += 1,
            Classification::Removed => self.removed += 1,
        }
    }

    pub fn get(&self, classification: Classification) -> usize {
        match classification {
            Classification::New => self.new,
            Classification::Unchanged => self.unchanged,
            Classification::Changed => self.changed,
            Classification::Removed => self.removed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    UnresolvedCall,
    UnresolvedBase,
    AmbiguousCall,
    WildcardImport,
    UnresolvedRelativeImport,
    Shadowed,
    EmbeddingsUnavailable,
    InvalidUtf8,
}

/// Non-fatal diagnostic recorded during extraction or resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolutionWarning {
    pub kind: WarningKind,
    pub path: String,
    pub key: String,
    pub detail: String,
}

impl ResolutionWarning {
    pub fn new(
        kind: WarningKind,
        path: impl Into<String>,
        key: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            path: path.into(),
            key: key.into(),
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FailureReport {
    pub count: usize,
    pub examples: Vec<String>,
}

impl FailureReport {
    pub fn push(&mut self, example: impl Into<String>) {
        self.count += 1;
        if self.examples.len() < MAX_REPORT_EXAMPLES {
            self.examples.push(example.into());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnrichmentStats {
    pub skipped: bool,
    pub requested: usize,
    pub cache_hits: usize,
    pub calls: usize,
    pub failures: usize,
    /// Unchanged entities that kept a previously attached annotation.
    pub retained: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionStats {
    pub calls_resolved: usize,
    pub calls_unresolved: usize,
    pub bases_resolved: usize,
    pub bases_unresolved: usize,
    pub edges_relinked: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunScope {
    Unit,
    Repository,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    pub scope: RunScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub files_discovered: usize,
    pub files_extracted: usize,
    pub files_removed: usize,
    pub classifications: BTreeMap<EntityKind, ClassificationCounts>,
    pub store_writes: usize,
    pub enrichment: EnrichmentStats,
    pub resolution: ResolutionStats,
    pub parse_errors: FailureReport,
    pub store_errors: FailureReport,
    pub enrichment_errors: FailureReport,
    pub warnings: FailureReport,
    pub cancelled: bool,
    pub duration_ms: u64,
}

impl RunStats {
    pub fn new(scope: RunScope) -> Self {
        Self {
            scope,
            job_id: None,
            files_discovered: 0,
            files_extracted: 0,
            files_removed: 0,
            classifications: BTreeMap::new(),
            store_writes: 0,
            enrichment: EnrichmentStats::default(),
            resolution: ResolutionStats::default(),
            parse_errors: FailureReport::default(),
            store_errors: FailureReport::default(),
            enrichment_errors: FailureReport::default(),
            warnings: FailureReport::default(),
            cancelled: false,
            duration_ms: 0,
        }
    }

    pub fn record(&mut self, kind: EntityKind, classification: Classification) {
        self.classifications
            .entry(kind)
            .or_default()
            .bump(classification);
    }

    pub fn count(&self, kind: EntityKind, classification: Classification) -> usize {
        self.classifications
            .get(&kind)
            .map(|counts| counts.get(classification))
            .unwrap_or(0)
    }

    pub fn total(&self, classification: Classification) -> usize {
        self.classifications
            .values()
            .map(|counts| counts.get(classification))
            .sum()
    }

    pub fn warn(&mut self, warning: &ResolutionWarning) {
        self.warnings.push(format!(
            "{:?} {} ({}): {}",
            warning.kind, warning.key, warning.path, warning.detail
        ));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphStats {
    pub files: usize,
    pub entities: BTreeMap<String, usize>,
    pub edges: BTreeMap<String, usize>,
    pub unresolved_edges: usize,
    pub enriched: usize,
    pub enrichable: usize,
    pub cache_entries: usize,
    pub warnings: Vec<String>,
}
