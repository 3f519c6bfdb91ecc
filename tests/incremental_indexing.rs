use codegraph::config::UpdateStrategy;
use codegraph::db::{Db, GraphStore, StructuralQuery};
use codegraph::enrich::{
    AnnotationDetail, ClassRole, Complexity, EnrichmentCache, EnrichmentRequest,
    EnrichmentSettings, Enricher, SemanticAnnotation,
};
use codegraph::error::{EnrichmentError, IndexError, StoreError};
use codegraph::indexer::scan::ScanOptions;
use codegraph::indexer::{Indexer, IndexerOptions, RepositoryOptions};
use codegraph::indexer::hasher;
use codegraph::jobs::{CancelToken, RunPhase};
use codegraph::model::{
    Classification, EntityKind, EntityRecord, FileRecord, StoredEdge, StoredEntity,
};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

struct CountingEnricher {
    calls: AtomicUsize,
    slow: HashSet<String>,
}

impl CountingEnricher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            slow: HashSet::new(),
        })
    }

    fn with_slow(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            slow: names.iter().map(|name| name.to_string()).collect(),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Enricher for CountingEnricher {
    fn enrich(&self, request: &EnrichmentRequest) -> Result<SemanticAnnotation, EnrichmentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.slow.contains(&request.name) {
            std::thread::sleep(Duration::from_secs(3));
        }
        let detail = match request.kind {
            EntityKind::Class => AnnotationDetail::Class {
                role: ClassRole::Model,
                key_methods: Vec::new(),
                collaborators: Vec::new(),
            },
            _ => AnnotationDetail::Function {
                complexity: Complexity::Low,
                side_effects: Vec::new(),
                parameters_explained: Vec::new(),
                data_flows_to: Vec::new(),
            },
        };
        Ok(SemanticAnnotation {
            purpose: format!("{} does its job", request.name),
            summary: String::new(),
            design_patterns: Vec::new(),
            domain_concepts: Vec::new(),
            detail,
        })
    }
}

struct Fixture {
    _temp: TempDir,
    repo: PathBuf,
    db_path: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let repo = temp.path().join("repo");
        std::fs::create_dir_all(&repo).unwrap();
        let db_path = temp.path().join("graph.sqlite");
        Self {
            _temp: temp,
            repo,
            db_path,
        }
    }

    fn write(&self, rel_path: &str, content: &str) {
        let path = self.repo.join(rel_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn remove(&self, rel_path: &str) {
        std::fs::remove_file(self.repo.join(rel_path)).unwrap();
    }

    fn indexer(&self, strategy: UpdateStrategy, enricher: Arc<CountingEnricher>) -> Indexer {
        Indexer::new(self.repo.clone(), self.db_path.clone())
            .unwrap()
            .with_options(options(strategy))
            .with_enricher(enricher)
    }
}

fn options(strategy: UpdateStrategy) -> IndexerOptions {
    IndexerOptions {
        workers: 2,
        update_strategy: strategy,
        store_retries: 3,
        store_backoff: Duration::from_millis(1),
        scan: ScanOptions::default(),
        enrichment: EnrichmentSettings {
            concurrency: 4,
            batch_size: 8,
            timeout: Duration::from_secs(1),
            retries: 1,
            backoff: Duration::from_millis(1),
        },
    }
}

fn db(indexer: &Indexer) -> &Db {
    indexer.db().unwrap()
}

const MODELS: &str = r#"from dataclasses import dataclass

@dataclass
class Foo:
    x: int = 0

    def bar(self):
        return self.x
"#;

#[test]
fn reindexing_unchanged_repository_is_idempotent() {
    let fx = Fixture::new();
    fx.write("app/models.py", MODELS);
    fx.write("app/service.py", "from app.models import Foo\n\ndef make():\n    return Foo()\n");
    let enricher = CountingEnricher::new();
    let indexer = fx.indexer(UpdateStrategy::FineGrained, enricher.clone());

    let first = indexer.index_repository(&RepositoryOptions::default()).unwrap();
    assert_eq!(first.files_extracted, 2);
    assert_eq!(first.count(EntityKind::Module, Classification::New), 2);
    assert_eq!(first.count(EntityKind::Class, Classification::New), 1);
    let digest = db(&indexer).digest().unwrap();
    let calls = enricher.calls();

    let second = indexer.index_repository(&RepositoryOptions::default()).unwrap();
    assert_eq!(second.total(Classification::New), 0);
    assert_eq!(second.total(Classification::Changed), 0);
    assert_eq!(second.total(Classification::Unchanged), first.total(Classification::New));
    assert_eq!(second.store_writes, 0);
    assert_eq!(enricher.calls(), calls);
    assert_eq!(db(&indexer).digest().unwrap(), digest);
}

#[test]
fn frozen_dataclass_reenriches_only_the_class() {
    let fx = Fixture::new();
    fx.write("models.py", MODELS);
    let enricher = CountingEnricher::new();
    let indexer = fx.indexer(UpdateStrategy::FineGrained, enricher.clone());
    indexer.index_repository(&RepositoryOptions::default()).unwrap();
    assert_eq!(enricher.calls(), 2);

    fx.write(
        "models.py",
        &MODELS.replace("@dataclass\n", "@dataclass(frozen=True)\n"),
    );
    let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();
    assert_eq!(stats.count(EntityKind::Class, Classification::Changed), 1);
    assert_eq!(stats.count(EntityKind::Method, Classification::Unchanged), 1);
    assert_eq!(stats.count(EntityKind::Module, Classification::Changed), 1);
    assert_eq!(enricher.calls(), 3);
    assert_eq!(stats.enrichment.calls, 1);
    assert_eq!(stats.enrichment.retained, 1);

    let foo = db(&indexer).find_by_key("models.Foo").unwrap().unwrap();
    assert!(foo.enrichment.is_some());
    let bar = db(&indexer).find_by_key("models.Foo.bar").unwrap().unwrap();
    assert!(bar.enrichment.is_some());
}

#[test]
fn identical_bodies_cost_one_enrichment_call() {
    let fx = Fixture::new();
    let body = "def helper(x):\n    return x + 1\n";
    for name in ["a", "b", "c", "d"] {
        fx.write(&format!("{name}.py"), body);
    }
    let enricher = CountingEnricher::new();
    let indexer = fx.indexer(UpdateStrategy::FineGrained, enricher.clone());
    let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();

    assert_eq!(enricher.calls(), 1);
    assert_eq!(stats.enrichment.requested, 4);
    assert_eq!(stats.enrichment.calls, 1);
    assert_eq!(stats.enrichment.cache_hits, 3);
    for name in ["a", "b", "c", "d"] {
        let entity = db(&indexer)
            .find_by_key(&format!("{name}.helper"))
            .unwrap()
            .unwrap();
        assert!(entity.enrichment.is_some(), "{name}.helper not enriched");
    }
    assert_eq!(EnrichmentCache::len(db(&indexer)).unwrap(), 1);
}

#[test]
fn recreate_strategy_matches_fine_grained() {
    let edit = |fx: &Fixture| {
        fx.write(
            "shop.py",
            "import os\n\nclass Cart:\n    def add(self, item):\n        return item\n\ndef total(cart):\n    return len(cart)\n",
        );
        fx.write("util.py", "def slug(text):\n    return text.lower()\n");
    };

    let mut reports = Vec::new();
    let mut digests = Vec::new();
    for strategy in [UpdateStrategy::FineGrained, UpdateStrategy::Recreate] {
        let fx = Fixture::new();
        edit(&fx);
        let enricher = CountingEnricher::new();
        let indexer = fx.indexer(strategy, enricher.clone());
        indexer.index_repository(&RepositoryOptions::default()).unwrap();

        fx.write(
            "shop.py",
            "import os\n\nclass Cart:\n    def add(self, item):\n        return item\n\ndef total(cart):\n    return sum(cart)\n",
        );
        let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();
        // only `total` needs a fresh annotation; recreate serves the rest from cache
        assert_eq!(stats.enrichment.calls, 1, "{strategy:?}");
        reports.push(stats.classifications.clone());
        digests.push(db(&indexer).digest().unwrap());
    }
    assert_eq!(reports[0], reports[1]);
    assert_eq!(digests[0], digests[1]);
}

#[test]
fn removed_entities_and_files_are_deleted() {
    let fx = Fixture::new();
    fx.write("m.py", "def keep():\n    return 1\n\ndef drop():\n    return 2\n");
    fx.write("other.py", "def solo():\n    return keep()\n");
    let indexer = fx.indexer(UpdateStrategy::FineGrained, CountingEnricher::new());
    indexer.index_repository(&RepositoryOptions::default()).unwrap();

    fx.write("m.py", "def keep():\n    return 1\n");
    let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();
    assert_eq!(stats.count(EntityKind::Function, Classification::Removed), 1);
    assert_eq!(stats.count(EntityKind::Function, Classification::Unchanged), 2);
    assert!(db(&indexer).find_by_key("m.drop").unwrap().is_none());
    assert!(db(&indexer).find_by_key("m.keep").unwrap().is_some());

    fx.remove("m.py");
    let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();
    assert_eq!(stats.files_removed, 1);
    assert_eq!(stats.count(EntityKind::Module, Classification::Removed), 1);
    assert!(db(&indexer).find_by_key("m").unwrap().is_none());
    assert!(db(&indexer).get_file("m.py").unwrap().is_none());

    // the caller in other.py keeps its edge, now unresolved
    let edges = db(&indexer).edges_from("other.solo").unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0].target_name, "keep");
    assert_eq!(edges[0].target_key, None);
}

#[test]
fn parse_error_leaves_previous_entities_in_place() {
    let fx = Fixture::new();
    fx.write("good.py", "def ok():\n    return 1\n");
    fx.write("fragile.py", "def before():\n    return 1\n");
    let indexer = fx.indexer(UpdateStrategy::FineGrained, CountingEnricher::new());
    indexer.index_repository(&RepositoryOptions::default()).unwrap();

    fx.write("fragile.py", "def before(:\n    return 1\n");
    fx.write("good.py", "def ok():\n    return 1\n\ndef added():\n    return 2\n");
    let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();

    assert_eq!(stats.parse_errors.count, 1);
    assert!(stats.parse_errors.examples[0].contains("fragile.py"));
    assert_eq!(stats.count(EntityKind::Function, Classification::New), 1);
    assert_eq!(stats.files_removed, 0);
    assert!(db(&indexer).find_by_key("fragile.before").unwrap().is_some());
    assert!(db(&indexer).find_by_key("good.added").unwrap().is_some());
}

#[test]
fn identity_collision_aborts_before_any_write() {
    let fx = Fixture::new();
    fx.write("pkg.py", "def util():\n    pass\n");
    fx.write("pkg/util.py", "VALUE = 1\n");
    let indexer = fx.indexer(UpdateStrategy::FineGrained, CountingEnricher::new());

    let err = indexer
        .index_repository(&RepositoryOptions::default())
        .unwrap_err();
    match err {
        IndexError::IdentityCollision(collision) => {
            assert_eq!(collision.key, "pkg.util");
            assert_eq!(collision.first_path, "pkg.py");
            assert_eq!(collision.second_path, "pkg/util.py");
        }
        other => panic!("unexpected error: {other}"),
    }
    let stored = db(&indexer)
        .query_structural(&StructuralQuery::default())
        .unwrap();
    assert!(stored.is_empty());
    assert!(db(&indexer).list_files().unwrap().is_empty());
}

#[test]
fn cancelled_job_reconciles_nothing() {
    let fx = Fixture::new();
    fx.write("m.py", "def f():\n    return 1\n");
    let indexer = fx.indexer(UpdateStrategy::FineGrained, CountingEnricher::new());

    let job = indexer.jobs().create();
    assert!(indexer.jobs().cancel(job.job_id()));
    let stats = indexer
        .index_repository_job(&RepositoryOptions::default(), &job)
        .unwrap();
    assert!(stats.cancelled);
    assert_eq!(stats.store_writes, 0);
    assert!(db(&indexer).find_by_key("m.f").unwrap().is_none());

    let status = indexer.get_status(job.job_id()).unwrap();
    assert_eq!(status.phase, RunPhase::Cancelled);
    assert!(!indexer.jobs().cancel(job.job_id()));
}

#[test]
fn job_status_reports_completion() {
    let fx = Fixture::new();
    fx.write("a.py", "def a():\n    return 1\n");
    fx.write("b.py", "def b():\n    return a()\n");
    let indexer = fx.indexer(UpdateStrategy::FineGrained, CountingEnricher::new());
    let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();

    let status = indexer.get_status(stats.job_id.as_deref().unwrap()).unwrap();
    assert_eq!(status.phase, RunPhase::Committed);
    assert_eq!(status.total_files, 2);
    assert_eq!(status.files_processed, 2);
    assert_eq!(status.percent_complete, 100.0);
    assert!(indexer.get_status("job-404").is_none());
}

#[test]
fn enrichment_timeout_degrades_only_that_entity() {
    let fx = Fixture::new();
    fx.write("m.py", "def quick():\n    return 1\n\ndef sluggish():\n    return 2\n");
    let enricher = CountingEnricher::with_slow(&["sluggish"]);
    let indexer = fx.indexer(UpdateStrategy::FineGrained, enricher.clone());
    let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();

    assert_eq!(stats.enrichment.failures, 1);
    assert_eq!(stats.enrichment_errors.count, 1);
    assert!(stats.enrichment_errors.examples[0].contains("m.sluggish"));
    let quick = db(&indexer).find_by_key("m.quick").unwrap().unwrap();
    let sluggish = db(&indexer).find_by_key("m.sluggish").unwrap().unwrap();
    assert!(quick.enrichment.is_some());
    assert!(sluggish.enrichment.is_none());
    // the structural record is written regardless
    assert!(sluggish.fingerprint.is_some());
    assert_eq!(EnrichmentCache::len(db(&indexer)).unwrap(), 1);
}

#[test]
fn skipped_enrichment_leaves_entities_unannotated() {
    let fx = Fixture::new();
    fx.write("m.py", "class A:\n    pass\n");
    let enricher = CountingEnricher::new();
    let indexer = fx.indexer(UpdateStrategy::FineGrained, enricher.clone());
    let stats = indexer
        .index_repository(&RepositoryOptions {
            run_enrichment: false,
            create_embeddings: true,
            ..RepositoryOptions::default()
        })
        .unwrap();
    assert!(stats.enrichment.skipped);
    assert_eq!(enricher.calls(), 0);
    assert_eq!(stats.warnings.count, 1);
    assert!(db(&indexer).find_by_key("m.A").unwrap().unwrap().enrichment.is_none());
}

#[test]
fn clear_first_keeps_the_enrichment_cache() {
    let fx = Fixture::new();
    fx.write("m.py", "def f():\n    return 1\n");
    let enricher = CountingEnricher::new();
    let indexer = fx.indexer(UpdateStrategy::FineGrained, enricher.clone());
    indexer.index_repository(&RepositoryOptions::default()).unwrap();

    let stats = indexer
        .index_repository(&RepositoryOptions {
            clear_first: true,
            ..RepositoryOptions::default()
        })
        .unwrap();
    assert_eq!(stats.count(EntityKind::Function, Classification::New), 1);
    assert_eq!(stats.enrichment.cache_hits, 1);
    assert_eq!(enricher.calls(), 1);
}

#[test]
fn unit_runs_link_calls_once_the_callee_appears() {
    let fx = Fixture::new();
    fx.write("a.py", "from b import helper\n\ndef run():\n    return helper()\n");
    let indexer = fx.indexer(UpdateStrategy::FineGrained, CountingEnricher::new());
    let stats = indexer.index_unit(Path::new("a.py")).unwrap();
    assert_eq!(stats.files_extracted, 1);
    let edges = db(&indexer).edges_from("a.run").unwrap();
    assert_eq!(edges[0].target_key, None);

    fx.write("b.py", "def helper():\n    return 1\n");
    let stats = indexer.index_unit(Path::new("b.py")).unwrap();
    assert!(stats.resolution.edges_relinked >= 1);
    let edges = db(&indexer).edges_from("a.run").unwrap();
    assert_eq!(edges[0].target_key.as_deref(), Some("b.helper"));
    let imports: Vec<StoredEdge> = db(&indexer)
        .edges_from("a")
        .unwrap()
        .into_iter()
        .filter(|edge| edge.target_name == "b")
        .collect();
    assert_eq!(imports[0].target_key.as_deref(), Some("b"));

    fx.remove("b.py");
    let stats = indexer.index_unit(Path::new("b.py")).unwrap();
    assert_eq!(stats.files_removed, 1);
    let edges = db(&indexer).edges_from("a.run").unwrap();
    assert_eq!(edges[0].target_key, None);
}

#[test]
fn unit_run_on_unknown_path_is_an_error() {
    let fx = Fixture::new();
    let indexer = fx.indexer(UpdateStrategy::FineGrained, CountingEnricher::new());
    let err = indexer.index_unit(Path::new("missing.py")).unwrap_err();
    assert!(matches!(err, IndexError::Io { .. }));
}

/// Store wrapper that fails upserts on demand, and can cancel a job once a
/// given key has been written.
struct FlakyStore {
    inner: Arc<Db>,
    transient: usize,
    always_fail: HashSet<String>,
    attempts: Mutex<HashMap<String, usize>>,
    cancel_on: Mutex<Option<(String, CancelToken)>>,
}

impl FlakyStore {
    fn cancel_after(&self, key: &str, token: CancelToken) {
        *self.cancel_on.lock().unwrap() = Some((key.to_string(), token));
    }
}

impl GraphStore for FlakyStore {
    fn upsert_entity(&self, record: &EntityRecord) -> Result<(), StoreError> {
        if self.always_fail.contains(&record.key) {
            return Err(StoreError::Invalid("injected failure".into()));
        }
        let mut attempts = self.attempts.lock().unwrap();
        let seen = attempts.entry(record.key.clone()).or_insert(0);
        *seen += 1;
        if *seen <= self.transient {
            return Err(StoreError::Invalid("transient failure".into()));
        }
        drop(attempts);
        self.inner.upsert_entity(record)?;
        if let Some((key, token)) = self.cancel_on.lock().unwrap().as_ref() {
            if *key == record.key {
                token.cancel();
            }
        }
        Ok(())
    }

    fn delete_entity(&self, key: &str) -> Result<bool, StoreError> {
        self.inner.delete_entity(key)
    }

    fn find_by_key(&self, key: &str) -> Result<Option<StoredEntity>, StoreError> {
        self.inner.find_by_key(key)
    }

    fn query_structural(&self, query: &StructuralQuery) -> Result<Vec<StoredEntity>, StoreError> {
        self.inner.query_structural(query)
    }

    fn attach_enrichment(
        &self,
        key: &str,
        fingerprint: &str,
        annotation: &SemanticAnnotation,
    ) -> Result<bool, StoreError> {
        self.inner.attach_enrichment(key, fingerprint, annotation)
    }

    fn edges_from(&self, key: &str) -> Result<Vec<StoredEdge>, StoreError> {
        self.inner.edges_from(key)
    }

    fn edges_to(&self, key: &str) -> Result<Vec<StoredEdge>, StoreError> {
        self.inner.edges_to(key)
    }

    fn record_file(&self, file: &FileRecord) -> Result<(), StoreError> {
        self.inner.record_file(file)
    }

    fn get_file(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        self.inner.get_file(path)
    }

    fn remove_file(&self, path: &str) -> Result<(), StoreError> {
        self.inner.remove_file(path)
    }

    fn list_files(&self) -> Result<Vec<FileRecord>, StoreError> {
        self.inner.list_files()
    }

    fn relink_edges(&self) -> Result<usize, StoreError> {
        self.inner.relink_edges()
    }

    fn clear(&self) -> Result<(), StoreError> {
        GraphStore::clear(self.inner.as_ref())
    }
}

fn flaky_indexer(
    fx: &Fixture,
    transient: usize,
    always_fail: &[&str],
) -> (Indexer, Arc<Db>, Arc<FlakyStore>) {
    let db = Arc::new(Db::new(&fx.db_path).unwrap());
    let store = Arc::new(FlakyStore {
        inner: db.clone(),
        transient,
        always_fail: always_fail.iter().map(|key| key.to_string()).collect(),
        attempts: Mutex::new(HashMap::new()),
        cancel_on: Mutex::new(None),
    });
    let indexer = Indexer::with_store(fx.repo.clone(), store.clone(), db.clone())
        .with_options(options(UpdateStrategy::FineGrained));
    (indexer, db, store)
}

#[test]
fn transient_store_failures_are_retried() {
    let fx = Fixture::new();
    fx.write("m.py", "def a():\n    return 1\n\ndef b():\n    return 2\n");
    let (indexer, db, _) = flaky_indexer(&fx, 2, &[]);
    let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();

    assert!(stats.store_errors.is_empty());
    assert_eq!(stats.store_writes, 3);
    assert!(db.find_by_key("m.b").unwrap().is_some());
    assert!(db.get_file("m.py").unwrap().is_some());
}

#[test]
fn persistent_store_failure_is_reported_per_entity() {
    let fx = Fixture::new();
    fx.write("m.py", "def good():\n    return 1\n\ndef bad():\n    return 2\n");
    let (indexer, db, _) = flaky_indexer(&fx, 0, &["m.bad"]);
    let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();

    assert_eq!(stats.store_errors.count, 1);
    assert!(stats.store_errors.examples[0].contains("m.bad"));
    assert!(db.find_by_key("m.good").unwrap().is_some());
    assert!(db.find_by_key("m.bad").unwrap().is_none());
    // the file is not marked as indexed while one of its entities is missing
    assert!(db.get_file("m.py").unwrap().is_none());
}

#[test]
fn cancelled_mid_run_units_are_enriched_on_the_next_run() {
    let fx = Fixture::new();
    fx.write("a.py", "def f():\n    return 1\n");
    fx.write("b.py", "def g():\n    return 2\n");
    let (indexer, db, store) = flaky_indexer(&fx, 0, &[]);
    let enricher = CountingEnricher::new();
    let indexer = indexer.with_enricher(enricher.clone());

    let job = indexer.jobs().create();
    store.cancel_after("a.f", job.cancel_token().clone());
    let stats = indexer
        .index_repository_job(&RepositoryOptions::default(), &job)
        .unwrap();
    assert!(stats.cancelled);
    assert_eq!(indexer.get_status(job.job_id()).unwrap().phase, RunPhase::Cancelled);
    assert!(db.find_by_key("a.f").unwrap().is_some());
    assert!(db.find_by_key("b.g").unwrap().is_none());
    assert_eq!(enricher.calls(), 0);

    let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();
    assert!(!stats.cancelled);
    assert_eq!(stats.count(EntityKind::Function, Classification::Unchanged), 1);
    assert_eq!(stats.count(EntityKind::Function, Classification::New), 1);
    assert_eq!(stats.enrichment.requested, 2);
    assert_eq!(enricher.calls(), 2);
    for key in ["a.f", "b.g"] {
        let entity = db.find_by_key(key).unwrap().unwrap();
        assert!(entity.has_current_enrichment(), "{key} not enriched");
    }
}

#[test]
fn failed_enrichment_is_retried_on_the_next_run() {
    let fx = Fixture::new();
    fx.write("m.py", "def quick():\n    return 1\n\ndef sluggish():\n    return 2\n");
    let first = fx.indexer(UpdateStrategy::FineGrained, CountingEnricher::with_slow(&["sluggish"]));
    let stats = first.index_repository(&RepositoryOptions::default()).unwrap();
    assert_eq!(stats.enrichment.failures, 1);

    let healthy = CountingEnricher::new();
    let second = fx.indexer(UpdateStrategy::FineGrained, healthy.clone());
    let stats = second.index_repository(&RepositoryOptions::default()).unwrap();
    assert_eq!(stats.total(Classification::Changed), 0);
    assert_eq!(stats.store_writes, 0);
    assert_eq!(stats.enrichment.retained, 1);
    assert_eq!(stats.enrichment.requested, 1);
    assert_eq!(healthy.calls(), 1);
    let sluggish = db(&second).find_by_key("m.sluggish").unwrap().unwrap();
    assert!(sluggish.has_current_enrichment());

    // nothing is left to backfill
    let stats = second.index_repository(&RepositoryOptions::default()).unwrap();
    assert_eq!(stats.enrichment.requested, 0);
    assert_eq!(stats.enrichment.retained, 2);
    assert_eq!(healthy.calls(), 1);
}

#[test]
fn entities_from_a_run_without_enrichment_are_enriched_later() {
    let fx = Fixture::new();
    fx.write("n.py", "def g():\n    return 2\n");
    let enricher = CountingEnricher::new();
    let indexer = fx.indexer(UpdateStrategy::FineGrained, enricher.clone());
    indexer
        .index_repository(&RepositoryOptions {
            run_enrichment: false,
            ..RepositoryOptions::default()
        })
        .unwrap();
    assert!(db(&indexer).find_by_key("n.g").unwrap().unwrap().enrichment.is_none());

    let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();
    assert_eq!(stats.enrichment.calls, 1);
    assert_eq!(enricher.calls(), 1);
    let entity = db(&indexer).find_by_key("n.g").unwrap().unwrap();
    assert!(entity.has_current_enrichment());
}

#[test]
fn noop_rerun_leaves_file_records_untouched() {
    let fx = Fixture::new();
    fx.write("m.py", "def f():\n    return 1\n");
    let indexer = fx.indexer(UpdateStrategy::FineGrained, CountingEnricher::new());
    indexer.index_repository(&RepositoryOptions::default()).unwrap();

    let mut record = db(&indexer).get_file("m.py").unwrap().unwrap();
    record.indexed_at = 0;
    record.revision = Some("pinned".into());
    db(&indexer).record_file(&record).unwrap();

    indexer.index_repository(&RepositoryOptions::default()).unwrap();
    let kept = db(&indexer).get_file("m.py").unwrap().unwrap();
    assert_eq!(kept.indexed_at, 0);
    assert_eq!(kept.revision.as_deref(), Some("pinned"));

    fx.write("m.py", "def f():\n    return 2\n");
    indexer.index_repository(&RepositoryOptions::default()).unwrap();
    let updated = db(&indexer).get_file("m.py").unwrap().unwrap();
    assert!(updated.indexed_at > 0);
    assert_ne!(updated.revision.as_deref(), Some("pinned"));
}

#[test]
fn invalid_utf8_is_hashed_raw_and_reported() {
    let fx = Fixture::new();
    let bytes: &[u8] = b"def f():\n    return '\xff'\n";
    std::fs::write(fx.repo.join("m.py"), bytes).unwrap();
    let indexer = fx.indexer(UpdateStrategy::FineGrained, CountingEnricher::new());
    let stats = indexer.index_repository(&RepositoryOptions::default()).unwrap();

    assert!(db(&indexer).find_by_key("m.f").unwrap().is_some());
    let file = db(&indexer).get_file("m.py").unwrap().unwrap();
    assert_eq!(file.hash, hasher::hash_bytes(bytes));
    assert!(
        stats
            .warnings
            .examples
            .iter()
            .any(|warning| warning.starts_with("InvalidUtf8") && warning.contains("m.py"))
    );
}
