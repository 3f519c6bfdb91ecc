use crate::config::{Config, UpdateStrategy};
use crate::db::{Db, GraphStore, StructuralQuery};
use crate::enrich::{
    CallLimit, EnrichmentCache, EnrichmentRequest, EnrichmentRunner, EnrichmentSettings, Enricher,
};
use crate::error::{IndexError, IndexResult, StoreError};
use crate::jobs::{JobHandle, JobRegistry, JobStatus, RunPhase};
use crate::model::{
    FileRecord, ResolutionWarning, RunScope, RunStats, StoredEntity, WarningKind,
};
use crate::util;
use differ::Candidate;
use extract::ExtractedUnit;
use identity::IdentityIndex;
use rayon::prelude::*;
use resolve::SymbolTable;
use scan::{ScanOptions, ScannedFile};
use std::borrow::Cow;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub mod differ;
pub mod extract;
pub mod hasher;
pub mod identity;
pub mod python;
pub mod records;
pub mod resolve;
pub mod scan;

pub use python::extract_source;

#[derive(Debug, Clone)]
pub struct IndexerOptions {
    pub workers: usize,
    pub update_strategy: UpdateStrategy,
    pub store_retries: usize,
    pub store_backoff: Duration,
    pub scan: ScanOptions,
    pub enrichment: EnrichmentSettings,
}

impl IndexerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.workers,
            update_strategy: config.update_strategy,
            store_retries: config.store_retries,
            store_backoff: Duration::from_millis(100),
            scan: ScanOptions {
                no_ignore: false,
                exclude: config.exclude.clone(),
                max_file_bytes: config.max_file_bytes,
            },
            enrichment: EnrichmentSettings {
                concurrency: config.enrich_concurrency,
                batch_size: config.enrich_batch_size,
                timeout: config.enrich_timeout(),
                retries: config.enrich_retries,
                ..EnrichmentSettings::default()
            },
        }
    }
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self::from_config(Config::get())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RepositoryOptions {
    /// Wipe the graph (not the enrichment cache) before indexing.
    pub clear_first: bool,
    pub run_enrichment: bool,
    /// Accepted for interface compatibility; embeddings are produced elsewhere.
    pub create_embeddings: bool,
}

impl Default for RepositoryOptions {
    fn default() -> Self {
        Self {
            clear_first: false,
            run_enrichment: true,
            create_embeddings: false,
        }
    }
}

pub struct Indexer {
    repo_root: PathBuf,
    db: Option<Arc<Db>>,
    store: Arc<dyn GraphStore>,
    cache: Arc<dyn EnrichmentCache>,
    enricher: Option<Arc<dyn Enricher>>,
    options: IndexerOptions,
    /// Shared by every run so calls abandoned after a timeout keep counting.
    call_limit: Arc<CallLimit>,
    jobs: JobRegistry,
}

impl Indexer {
    /// Indexer backed by the SQLite store at `db_path`, which also holds the
    /// enrichment cache.
    pub fn new(repo_root: PathBuf, db_path: PathBuf) -> IndexResult<Self> {
        let repo_root = std::fs::canonicalize(&repo_root).unwrap_or(repo_root);
        let options = IndexerOptions::default();
        let db = Arc::new(
            Db::new(&db_path).map_err(|err| IndexError::Setup(format!("{err:#}")))?,
        );
        Ok(Self {
            repo_root,
            store: db.clone(),
            cache: db.clone(),
            db: Some(db),
            enricher: None,
            call_limit: CallLimit::new(options.enrichment.concurrency),
            options,
            jobs: JobRegistry::new(),
        })
    }

    /// Indexer over an arbitrary store and cache.
    pub fn with_store(
        repo_root: PathBuf,
        store: Arc<dyn GraphStore>,
        cache: Arc<dyn EnrichmentCache>,
    ) -> Self {
        let repo_root = std::fs::canonicalize(&repo_root).unwrap_or(repo_root);
        let options = IndexerOptions::default();
        Self {
            repo_root,
            db: None,
            store,
            cache,
            enricher: None,
            call_limit: CallLimit::new(options.enrichment.concurrency),
            options,
            jobs: JobRegistry::new(),
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn EnrichmentCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_options(mut self, options: IndexerOptions) -> Self {
        self.call_limit = CallLimit::new(options.enrichment.concurrency);
        self.options = options;
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    pub fn db(&self) -> Option<&Db> {
        self.db.as_deref()
    }

    pub fn store(&self) -> &dyn GraphStore {
        self.store.as_ref()
    }

    pub fn options(&self) -> &IndexerOptions {
        &self.options
    }

    pub fn jobs(&self) -> &JobRegistry {
        &self.jobs
    }

    pub fn get_status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs.get_status(job_id)
    }

    /// Extract and resolve one file without touching the store.
    pub fn extract_file(&self, path: &Path) -> IndexResult<ExtractedUnit> {
        let abs_path = self.absolute(path);
        let rel_path = util::normalize_rel_path(&self.repo_root, &abs_path)
            .map_err(|err| IndexError::Setup(format!("{err:#}")))?;
        let mut unit = read_and_extract(&abs_path, &rel_path)?;
        let mut table = SymbolTable::new();
        table.add_unit(&unit);
        table.resolve_unit(&mut unit);
        Ok(unit)
    }

    /// Bring the graph in line with a single file. A file that no longer
    /// exists has its stored entities removed.
    pub fn index_unit(&self, path: &Path) -> IndexResult<RunStats> {
        let job = self.jobs.create();
        let started = Instant::now();
        let mut stats = RunStats::new(RunScope::Unit);
        stats.job_id = Some(job.job_id().to_string());

        match self.run_unit(path, &job, &mut stats) {
            Ok(()) => Ok(self.finish(stats, &job, started)),
            Err(err) => {
                tracing::error!("indexing {} failed: {err}", path.display());
                job.fail(&err.to_string());
                Err(err)
            }
        }
    }

    pub fn index_repository(&self, options: &RepositoryOptions) -> IndexResult<RunStats> {
        let job = self.jobs.create();
        self.index_repository_job(options, &job)
    }

    /// Whole-repository run reporting progress through `job`. Cancelling the
    /// job stops the run between units.
    pub fn index_repository_job(
        &self,
        options: &RepositoryOptions,
        job: &JobHandle,
    ) -> IndexResult<RunStats> {
        let started = Instant::now();
        let mut stats = RunStats::new(RunScope::Repository);
        stats.job_id = Some(job.job_id().to_string());
        tracing::info!(
            "indexing {} ({})",
            self.repo_root.display(),
            job.job_id()
        );

        match self.run_repository(options, job, &mut stats) {
            Ok(()) => Ok(self.finish(stats, job, started)),
            Err(err) => {
                tracing::error!("indexing {} failed: {err}", self.repo_root.display());
                job.fail(&err.to_string());
                Err(err)
            }
        }
    }

    fn run_unit(&self, path: &Path, job: &JobHandle, stats: &mut RunStats) -> IndexResult<()> {
        job.set_phase(RunPhase::Discovering);
        let abs_path = self.absolute(path);
        let rel_path = util::normalize_rel_path(&self.repo_root, &abs_path)
            .map_err(|err| IndexError::Setup(format!("{err:#}")))?;
        job.set_total(1);

        let scanned = scan::scan_path(&self.repo_root, &abs_path).map_err(|err| {
            IndexError::Setup(format!("{}: {err:#}", abs_path.display()))
        })?;
        let Some(file) = scanned else {
            let known = self.store.get_file(&rel_path)?.is_some()
                || !self
                    .store
                    .query_structural(&StructuralQuery::file(&rel_path).tracked())?
                    .is_empty();
            if !known {
                return Err(IndexError::Io {
                    path: abs_path,
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "not an indexable python file",
                    ),
                });
            }
            job.set_phase(RunPhase::Reconciling);
            self.remove_unit(&rel_path, stats)?;
            job.inc_processed();
            stats.resolution.edges_relinked = self.store.relink_edges()?;
            return Ok(());
        };
        stats.files_discovered = 1;

        job.set_phase(RunPhase::Extracting);
        let mut unit = match read_and_extract(&file.abs_path, &file.rel_path) {
            Ok(unit) => unit,
            Err(err) => {
                tracing::warn!("skipping {}: {err}", file.rel_path);
                stats.parse_errors.push(err.to_string());
                job.inc_processed();
                return Ok(());
            }
        };
        stats.files_extracted = 1;

        job.set_phase(RunPhase::Diffing);
        self.check_unit_identity(&unit)?;
        let stored = self
            .store
            .query_structural(&StructuralQuery::default().tracked())?;
        let mut table = SymbolTable::from_stored(&stored, &unit.path);
        table.add_unit(&unit);
        self.resolve(&table, &mut unit, stats);

        job.set_phase(RunPhase::Reconciling);
        let revision = self.revision();
        let requests = self.reconcile_unit(&unit, &revision, stats)?;
        job.inc_processed();
        stats.resolution.edges_relinked = self.store.relink_edges()?;

        self.enrich(requests, true, job, stats)
    }

    fn run_repository(
        &self,
        options: &RepositoryOptions,
        job: &JobHandle,
        stats: &mut RunStats,
    ) -> IndexResult<()> {
        let cancel = job.cancel_token().clone();
        if options.create_embeddings {
            stats.warn(&ResolutionWarning::new(
                WarningKind::EmbeddingsUnavailable,
                "",
                "",
                "embedding generation is not available in this build; request ignored",
            ));
        }

        job.set_phase(RunPhase::Discovering);
        if cancel.is_cancelled() {
            stats.cancelled = true;
            return Ok(());
        }
        if options.clear_first {
            tracing::info!("clearing graph before indexing");
            self.store.clear()?;
        }
        let files = scan::scan_repo_with_options(&self.repo_root, &self.options.scan)
            .map_err(|err| IndexError::Setup(format!("scan {}: {err:#}", self.repo_root.display())))?;
        stats.files_discovered = files.len();
        let present: HashSet<&str> = files.iter().map(|file| file.rel_path.as_str()).collect();
        let stored_files: BTreeSet<String> = self
            .store
            .list_files()?
            .into_iter()
            .map(|file| file.path)
            .chain(
                self.store
                    .query_structural(&StructuralQuery::default().tracked())?
                    .into_iter()
                    .map(|entity| entity.file_path),
            )
            .collect();
        let removed: Vec<String> = stored_files
            .into_iter()
            .filter(|path| !present.contains(path.as_str()))
            .collect();
        job.set_total(files.len() + removed.len());
        tracing::info!(
            "discovered {} files, {} removed since last run",
            files.len(),
            removed.len()
        );

        job.set_phase(RunPhase::Extracting);
        let extracted = self.extract_all(&files, job);
        if cancel.is_cancelled() {
            stats.cancelled = true;
            return Ok(());
        }

        let mut units: Vec<ExtractedUnit> = Vec::new();
        let mut failed_paths: HashSet<String> = HashSet::new();
        for (rel_path, result) in extracted {
            match result {
                Ok(unit) => units.push(unit),
                Err(IndexError::Cancelled) => stats.cancelled = true,
                Err(err) => {
                    tracing::warn!("skipping {rel_path}: {err}");
                    stats.parse_errors.push(err.to_string());
                    failed_paths.insert(rel_path);
                    job.inc_processed();
                }
            }
        }
        if stats.cancelled {
            return Ok(());
        }
        units.sort_by(|a, b| a.path.cmp(&b.path));
        stats.files_extracted = units.len();

        job.set_phase(RunPhase::Diffing);
        // Entities of units that failed to parse stay in place and keep
        // their keys.
        let retained: Vec<StoredEntity> = self
            .store
            .query_structural(&StructuralQuery::default().tracked())?
            .into_iter()
            .filter(|entity| failed_paths.contains(&entity.file_path))
            .collect();
        let mut identities = IdentityIndex::new();
        for entity in &retained {
            identities.claim(&entity.key, entity.kind, &entity.file_path)?;
        }
        for unit in &units {
            for (key, kind) in unit.claimed_keys() {
                identities.claim(key, kind, &unit.path)?;
            }
        }
        tracing::debug!("{} identity keys claimed", identities.len());

        let mut table = SymbolTable::from_stored(&retained, "");
        for unit in &units {
            table.add_unit(unit);
        }
        for unit in units.iter_mut() {
            self.resolve(&table, unit, stats);
        }

        job.set_phase(RunPhase::Reconciling);
        for path in &removed {
            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            self.remove_unit(path, stats)?;
            job.inc_processed();
        }

        let revision = self.revision();
        let mut requests = Vec::new();
        for unit in &units {
            if stats.cancelled || cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            requests.extend(self.reconcile_unit(unit, &revision, stats)?);
            job.inc_processed();
        }
        stats.resolution.edges_relinked = self.store.relink_edges()?;

        if stats.cancelled {
            return Ok(());
        }
        self.enrich(requests, options.run_enrichment, job, stats)
    }

    fn extract_all(
        &self,
        files: &[ScannedFile],
        job: &JobHandle,
    ) -> Vec<(String, IndexResult<ExtractedUnit>)> {
        let cancel = job.cancel_token();
        let extract_one = |file: &ScannedFile| {
            let result = if cancel.is_cancelled() {
                Err(IndexError::Cancelled)
            } else {
                read_and_extract(&file.abs_path, &file.rel_path)
            };
            (file.rel_path.clone(), result)
        };

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers.max(1))
            .build();
        match pool {
            Ok(pool) => pool.install(|| files.par_iter().map(extract_one).collect()),
            Err(err) => {
                tracing::warn!("extraction pool unavailable, running sequentially: {err}");
                files.iter().map(extract_one).collect()
            }
        }
    }

    fn resolve(&self, table: &SymbolTable, unit: &mut ExtractedUnit, stats: &mut RunStats) {
        let resolution = table.resolve_unit(unit);
        stats.resolution.calls_resolved += resolution.calls_resolved;
        stats.resolution.calls_unresolved += resolution.calls_unresolved;
        stats.resolution.bases_resolved += resolution.bases_resolved;
        stats.resolution.bases_unresolved += resolution.bases_unresolved;
        for warning in &unit.warnings {
            stats.warn(warning);
        }
    }

    /// A key already stored for another file that still exists is a
    /// collision; a key left behind by a file that is gone has moved.
    fn check_unit_identity(&self, unit: &ExtractedUnit) -> IndexResult<()> {
        let mut identities = IdentityIndex::new();
        for (key, kind) in unit.claimed_keys() {
            identities.claim(key, kind, &unit.path)?;
        }
        for (key, _, _) in unit.tracked() {
            let Some(existing) = self.store.find_by_key(key)? else {
                continue;
            };
            if existing.file_path != unit.path
                && self.repo_root.join(&existing.file_path).is_file()
            {
                identities.claim(key, existing.kind, &existing.file_path)?;
            }
        }
        Ok(())
    }

    /// Diff one unit against the store and apply the writes. Returns the
    /// enrichment requests for entities that were written.
    fn reconcile_unit(
        &self,
        unit: &ExtractedUnit,
        revision: &str,
        stats: &mut RunStats,
    ) -> IndexResult<Vec<EnrichmentRequest>> {
        let path = unit.path.as_str();
        let mut stored = self
            .store
            .query_structural(&StructuralQuery::file(path).tracked())?;
        let known: HashSet<String> = stored.iter().map(|entity| entity.key.clone()).collect();
        for (key, _, _) in unit.tracked() {
            if known.contains(key) {
                continue;
            }
            if let Some(entity) = self.store.find_by_key(key)? {
                if entity.kind.is_tracked() {
                    stored.push(entity);
                }
            }
        }
        let enriched: HashSet<String> = stored
            .iter()
            .filter(|entity| entity.file_path == path && entity.has_current_enrichment())
            .map(|entity| entity.key.clone())
            .collect();

        let candidates: Vec<Candidate> = unit
            .tracked()
            .into_iter()
            .map(|(key, kind, fingerprint)| Candidate::new(key, kind, fingerprint))
            .collect();
        let diff = differ::compute_entity_diff(path, stored, &candidates);
        for entry in diff.entries() {
            stats.record(entry.kind, entry.classification);
        }

        let recreate = self.options.update_strategy == UpdateStrategy::Recreate && !diff.is_noop();
        // Unchanged entities that never got an annotation for their current
        // fingerprint (failed, timed out, skipped or cancelled runs).
        let mut backfill: HashSet<&str> = HashSet::new();
        if !recreate {
            for entry in diff.unchanged.iter().filter(|entry| entry.kind.is_enrichable()) {
                if enriched.contains(&entry.key) {
                    stats.enrichment.retained += 1;
                } else {
                    backfill.insert(entry.key.as_str());
                }
            }
        }

        let mut failed = false;
        for entry in &diff.removed {
            let key = entry.key.as_str();
            let result = self.write_with_retry(key, || self.store.delete_entity(key).map(|_| ()));
            self.note_write(result, stats, &mut failed)?;
        }

        let mut requests = Vec::new();
        for record in records::unit_records(unit) {
            if !recreate && !diff.needs_write(&record.key) {
                if backfill.contains(record.key.as_str()) {
                    requests.extend(records::enrichment_request(unit, &record.key));
                }
                continue;
            }
            let result = self.write_with_retry(&record.key, || self.store.upsert_entity(&record));
            if !self.note_write(result, stats, &mut failed)? {
                continue;
            }
            if record.kind.is_enrichable() {
                if let Some(request) = records::enrichment_request(unit, &record.key) {
                    requests.push(request);
                }
            }
        }

        let file_current = diff.is_noop()
            && self
                .store
                .get_file(path)?
                .is_some_and(|file| file.hash == unit.file_hash);
        if failed {
            tracing::warn!("{path}: some entities were not written, file record left stale");
        } else if file_current {
            tracing::debug!("{path}: unchanged, file record kept");
        } else {
            self.store.record_file(&FileRecord {
                path: unit.path.clone(),
                hash: unit.file_hash.clone(),
                module: unit.module.key.clone(),
                revision: Some(revision.to_string()),
                indexed_at: util::now_epoch_secs(),
            })?;
        }
        Ok(requests)
    }

    fn remove_unit(&self, path: &str, stats: &mut RunStats) -> IndexResult<()> {
        let stored = self
            .store
            .query_structural(&StructuralQuery::file(path).tracked())?;
        let diff = differ::removed_file_diff(stored);
        let mut failed = false;
        for entry in &diff.removed {
            stats.record(entry.kind, entry.classification);
            let key = entry.key.as_str();
            let result = self.write_with_retry(key, || self.store.delete_entity(key).map(|_| ()));
            self.note_write(result, stats, &mut failed)?;
        }
        if !failed {
            self.store.remove_file(path)?;
        }
        stats.files_removed += 1;
        tracing::debug!("{path}: removed {} entities", diff.removed.len());
        Ok(())
    }

    /// Count a write outcome. Connectivity loss is returned as fatal; any
    /// other failure is recorded and the run goes on.
    fn note_write(
        &self,
        result: IndexResult<()>,
        stats: &mut RunStats,
        failed: &mut bool,
    ) -> IndexResult<bool> {
        match result {
            Ok(()) => {
                stats.store_writes += 1;
                Ok(true)
            }
            Err(err @ IndexError::Store(_)) => Err(err),
            Err(err) => {
                tracing::warn!("{err}");
                stats.store_errors.push(err.to_string());
                *failed = true;
                Ok(false)
            }
        }
    }

    fn write_with_retry<F>(&self, key: &str, mut op: F) -> IndexResult<()>
    where
        F: FnMut() -> Result<(), StoreError>,
    {
        let attempts = self.options.store_retries.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Ok(()) => return Ok(()),
                Err(err) if err.is_connectivity() => return Err(IndexError::Store(err)),
                Err(err) if attempt >= attempts => {
                    return Err(IndexError::StoreWrite {
                        key: key.to_string(),
                        attempts,
                        source: err,
                    });
                }
                Err(err) => {
                    tracing::debug!("write {key} attempt {attempt}/{attempts} failed: {err}");
                    thread::sleep(self.options.store_backoff * attempt as u32);
                    attempt += 1;
                }
            }
        }
    }

    fn enrich(
        &self,
        requests: Vec<EnrichmentRequest>,
        run_enrichment: bool,
        job: &JobHandle,
        stats: &mut RunStats,
    ) -> IndexResult<()> {
        let enricher = match (&self.enricher, run_enrichment) {
            (Some(enricher), true) => enricher.clone(),
            _ => {
                stats.enrichment.skipped = true;
                return Ok(());
            }
        };
        if requests.is_empty() {
            return Ok(());
        }

        job.set_phase(RunPhase::Enriching);
        tracing::info!("enriching {} entities", requests.len());
        let runner = EnrichmentRunner::new(
            enricher,
            self.cache.clone(),
            self.options.enrichment.clone(),
        )
        .with_limit(self.call_limit.clone());
        let run = runner.run(requests, job.cancel_token());
        let retained = stats.enrichment.retained;
        stats.enrichment = run.stats;
        stats.enrichment.retained = retained;
        stats.cancelled |= run.cancelled;

        for outcome in run.outcomes {
            match outcome.result {
                Ok(annotation) => {
                    match self
                        .store
                        .attach_enrichment(&outcome.key, &outcome.fingerprint, &annotation)
                    {
                        Ok(true) => {}
                        Ok(false) => tracing::debug!(
                            "{}: fingerprint moved on, annotation not attached",
                            outcome.key
                        ),
                        Err(err) if err.is_connectivity() => return Err(IndexError::Store(err)),
                        Err(err) => stats.store_errors.push(format!("{}: {err}", outcome.key)),
                    }
                }
                Err(source) => {
                    let err = IndexError::Enrichment {
                        key: outcome.key,
                        source,
                    };
                    stats.enrichment_errors.push(err.to_string());
                }
            }
        }
        Ok(())
    }

    fn finish(&self, mut stats: RunStats, job: &JobHandle, started: Instant) -> RunStats {
        stats.duration_ms = started.elapsed().as_millis() as u64;
        if stats.cancelled {
            job.set_phase(RunPhase::Cancelled);
            tracing::info!("{}: cancelled", job.job_id());
        } else {
            job.set_phase(RunPhase::Committed);
            tracing::info!(
                "{}: {} files, {} writes, {} parse errors, {} store errors in {}ms",
                job.job_id(),
                stats.files_extracted,
                stats.store_writes,
                stats.parse_errors.count,
                stats.store_errors.count,
                stats.duration_ms
            );
        }
        stats
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.repo_root.join(path)
        }
    }

    /// Revision marker for file records: the git HEAD when there is one,
    /// else the run timestamp.
    fn revision(&self) -> String {
        util::git_head_sha(&self.repo_root).unwrap_or_else(|| util::now_epoch_secs().to_string())
    }
}

fn read_and_extract(abs_path: &Path, rel_path: &str) -> IndexResult<ExtractedUnit> {
    let bytes = std::fs::read(abs_path).map_err(|source| IndexError::Io {
        path: abs_path.to_path_buf(),
        source,
    })?;
    let source = String::from_utf8_lossy(&bytes);
    let mut unit = extract_source(rel_path, &source)?;
    unit.file_hash = hasher::hash_bytes(&bytes);
    if let Cow::Owned(_) = source {
        unit.warnings.push(ResolutionWarning::new(
            WarningKind::InvalidUtf8,
            rel_path,
            unit.module.key.clone(),
            "source is not valid UTF-8; invalid bytes were replaced",
        ));
    }
    Ok(unit)
}
