//! Semantic enrichment of classes, functions and methods.
//!
//! The enricher itself (typically an LLM call) is external; this module
//! defines its contract, the annotation payload, the fingerprint-keyed cache
//! and the runner that fans requests out with bounded concurrency, a per-call
//! timeout and bounded retries.

pub mod cache;
pub mod limit;

pub use cache::{EnrichmentCache, MemoryCache};
pub use limit::CallLimit;

use crate::error::EnrichmentError;
use crate::jobs::CancelToken;
use crate::model::{EdgeKind, EdgeRecord, EdgeTarget, EnrichmentStats, EntityKind};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Everything the enricher is told about one entity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentRequest {
    pub key: String,
    pub kind: EntityKind,
    pub name: String,
    pub source: String,
    pub docstring: Option<String>,
    pub parameters: Vec<String>,
    pub parent: Option<String>,
    pub callees: Vec<String>,
    pub bases: Vec<String>,
    pub decorators: Vec<String>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassRole {
    Controller,
    Model,
    Service,
    Utility,
    BaseClass,
    Mixin,
    Protocol,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterExplanation {
    pub name: String,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnnotationDetail {
    Function {
        complexity: Complexity,
        #[serde(default)]
        side_effects: Vec<String>,
        #[serde(default)]
        parameters_explained: Vec<ParameterExplanation>,
        #[serde(default)]
        data_flows_to: Vec<String>,
    },
    Class {
        role: ClassRole,
        #[serde(default)]
        key_methods: Vec<String>,
        #[serde(default)]
        collaborators: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticAnnotation {
    pub purpose: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub design_patterns: Vec<String>,
    #[serde(default)]
    pub domain_concepts: Vec<String>,
    #[serde(flatten)]
    pub detail: AnnotationDetail,
}

impl SemanticAnnotation {
    /// Reject payloads whose shape does not match the entity kind.
    pub fn validate(&self, kind: EntityKind) -> Result<(), EnrichmentError> {
        if self.purpose.trim().is_empty() {
            return Err(EnrichmentError::InvalidPayload("empty purpose".into()));
        }
        match (&self.detail, kind) {
            (AnnotationDetail::Class { .. }, EntityKind::Class) => Ok(()),
            (AnnotationDetail::Function { .. }, EntityKind::Function | EntityKind::Method) => {
                Ok(())
            }
            (_, kind) => Err(EnrichmentError::InvalidPayload(format!(
                "annotation shape does not match {}",
                kind.as_str()
            ))),
        }
    }

    /// Edges implied by the annotation, sourced at `key`.
    pub fn semantic_edges(&self, key: &str) -> Vec<EdgeRecord> {
        let mut edges = Vec::new();
        let mut push = |kind: EdgeKind, names: &[String]| {
            for (position, name) in names.iter().enumerate() {
                edges.push(EdgeRecord {
                    kind,
                    source_key: key.to_string(),
                    target: EdgeTarget::unresolved(name.clone()),
                    target_name: name.clone(),
                    position: position as i64,
                    detail: None,
                });
            }
        };
        push(EdgeKind::ImplementsPattern, &self.design_patterns);
        push(EdgeKind::RelatesToConcept, &self.domain_concepts);
        match &self.detail {
            AnnotationDetail::Function { data_flows_to, .. } => {
                push(EdgeKind::DataFlowsTo, data_flows_to)
            }
            AnnotationDetail::Class { collaborators, .. } => {
                push(EdgeKind::CollaboratesWith, collaborators)
            }
        }
        edges
    }
}

/// External semantic enricher. Implementations must be callable from many
/// threads at once.
pub trait Enricher: Send + Sync {
    fn enrich(&self, request: &EnrichmentRequest) -> Result<SemanticAnnotation, EnrichmentError>;
}

#[derive(Debug, Clone)]
pub struct EnrichmentSettings {
    pub concurrency: usize,
    pub batch_size: usize,
    pub timeout: Duration,
    pub retries: usize,
    pub backoff: Duration,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            concurrency: 10,
            batch_size: 30,
            timeout: Duration::from_secs(60),
            retries: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentOutcome {
    pub key: String,
    pub fingerprint: String,
    pub cache_hit: bool,
    pub result: Result<SemanticAnnotation, EnrichmentError>,
}

#[derive(Debug, Default)]
pub struct EnrichmentRun {
    pub outcomes: Vec<EnrichmentOutcome>,
    pub stats: EnrichmentStats,
    pub cancelled: bool,
}

type CallResult = Result<SemanticAnnotation, EnrichmentError>;

pub struct EnrichmentRunner {
    enricher: Arc<dyn Enricher>,
    cache: Arc<dyn EnrichmentCache>,
    settings: EnrichmentSettings,
    limit: Arc<CallLimit>,
}

impl EnrichmentRunner {
    pub fn new(
        enricher: Arc<dyn Enricher>,
        cache: Arc<dyn EnrichmentCache>,
        settings: EnrichmentSettings,
    ) -> Self {
        let limit = CallLimit::new(settings.concurrency);
        Self {
            enricher,
            cache,
            settings,
            limit,
        }
    }

    /// Share a call limit across runners, so calls left running by an
    /// earlier run still count.
    pub fn with_limit(mut self, limit: Arc<CallLimit>) -> Self {
        self.limit = limit;
        self
    }

    /// Resolve every request from the cache or the enricher.
    ///
    /// Requests sharing a fingerprint cost at most one call. Failures are
    /// reported per entity and never cached.
    pub fn run(&self, requests: Vec<EnrichmentRequest>, cancel: &CancelToken) -> EnrichmentRun {
        let mut run = EnrichmentRun::default();
        run.stats.requested = requests.len();

        let mut misses: Vec<EnrichmentRequest> = Vec::new();
        let mut waiting: HashMap<String, Vec<String>> = HashMap::new();
        for request in requests {
            match self.cache.get(&request.fingerprint) {
                Ok(Some(annotation)) => {
                    run.stats.cache_hits += 1;
                    run.outcomes.push(EnrichmentOutcome {
                        key: request.key,
                        fingerprint: request.fingerprint,
                        cache_hit: true,
                        result: Ok(annotation),
                    });
                    continue;
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(
                    "enrichment cache lookup failed for {}: {err}",
                    request.key
                ),
            }
            match waiting.get_mut(&request.fingerprint) {
                Some(keys) => keys.push(request.key),
                None => {
                    waiting.insert(request.fingerprint.clone(), Vec::new());
                    misses.push(request);
                }
            }
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.concurrency.max(1))
            .build();

        for chunk in misses.chunks(self.settings.batch_size.max(1)) {
            if cancel.is_cancelled() {
                run.cancelled = true;
                break;
            }
            let results: Vec<Result<SemanticAnnotation, EnrichmentError>> = match &pool {
                Ok(pool) => pool.install(|| {
                    chunk
                        .par_iter()
                        .map(|request| self.call_with_retry(request))
                        .collect()
                }),
                Err(_) => chunk
                    .iter()
                    .map(|request| self.call_with_retry(request))
                    .collect(),
            };

            for (request, result) in chunk.iter().zip(results) {
                run.stats.calls += 1;
                match &result {
                    Ok(annotation) => {
                        if let Err(err) = self.cache.put(&request.fingerprint, annotation) {
                            tracing::warn!(
                                "enrichment cache write failed for {}: {err}",
                                request.key
                            );
                        }
                    }
                    Err(err) => {
                        run.stats.failures += 1;
                        tracing::warn!("enrichment failed for {}: {err}", request.key);
                    }
                }
                let sharers = waiting.remove(&request.fingerprint).unwrap_or_default();
                for key in sharers {
                    match &result {
                        Ok(_) => run.stats.cache_hits += 1,
                        Err(_) => run.stats.failures += 1,
                    }
                    run.outcomes.push(EnrichmentOutcome {
                        key,
                        fingerprint: request.fingerprint.clone(),
                        cache_hit: result.is_ok(),
                        result: result.clone(),
                    });
                }
                run.outcomes.push(EnrichmentOutcome {
                    key: request.key.clone(),
                    fingerprint: request.fingerprint.clone(),
                    cache_hit: false,
                    result,
                });
            }
        }
        run
    }

    /// Call the enricher with bounded attempts. An attempt that times out
    /// leaves its call running; the next attempt waits on that same call
    /// instead of starting a second one.
    fn call_with_retry(
        &self,
        request: &EnrichmentRequest,
    ) -> Result<SemanticAnnotation, EnrichmentError> {
        let attempts = self.settings.retries.max(1);
        let mut last_err = EnrichmentError::Disconnected;
        let mut pending: Option<mpsc::Receiver<CallResult>> = None;
        for attempt in 1..=attempts {
            let result = match pending.take().map_or_else(|| self.spawn_call(request), Ok) {
                Ok(rx) => match rx.recv_timeout(self.settings.timeout) {
                    Ok(result) => result
                        .and_then(|annotation| annotation.validate(request.kind).map(|_| annotation)),
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        pending = Some(rx);
                        Err(EnrichmentError::Timeout(self.settings.timeout))
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => Err(EnrichmentError::Disconnected),
                },
                Err(err) => Err(err),
            };
            match result {
                Ok(annotation) => return Ok(annotation),
                Err(err) => {
                    tracing::debug!(
                        "enrichment attempt {attempt}/{attempts} for {} failed: {err}",
                        request.key
                    );
                    last_err = err;
                }
            }
            if attempt < attempts {
                thread::sleep(self.settings.backoff * attempt as u32);
            }
        }
        Err(last_err)
    }

    /// Start one call on its own thread once a slot is free. The thread
    /// holds the slot until the enricher returns, even if nobody is waiting
    /// for the result any more.
    fn spawn_call(
        &self,
        request: &EnrichmentRequest,
    ) -> Result<mpsc::Receiver<CallResult>, EnrichmentError> {
        let permit = self
            .limit
            .acquire(self.settings.timeout)
            .ok_or(EnrichmentError::Saturated(self.limit.capacity()))?;
        let (tx, rx) = mpsc::channel();
        let enricher = Arc::clone(&self.enricher);
        let owned = request.clone();
        thread::spawn(move || {
            let result = enricher.enrich(&owned);
            drop(permit);
            let _ = tx.send(result);
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(key: &str, fingerprint: &str) -> EnrichmentRequest {
        EnrichmentRequest {
            key: key.to_string(),
            kind: EntityKind::Function,
            name: key.rsplit('.').next().unwrap_or(key).to_string(),
            source: format!("def {key}(): pass"),
            docstring: None,
            parameters: Vec::new(),
            parent: None,
            callees: Vec::new(),
            bases: Vec::new(),
            decorators: Vec::new(),
            fingerprint: fingerprint.to_string(),
        }
    }

    fn function_annotation(purpose: &str) -> SemanticAnnotation {
        SemanticAnnotation {
            purpose: purpose.to_string(),
            summary: "summary".into(),
            design_patterns: vec!["factory".into()],
            domain_concepts: vec!["billing".into()],
            detail: AnnotationDetail::Function {
                complexity: Complexity::Low,
                side_effects: Vec::new(),
                parameters_explained: Vec::new(),
                data_flows_to: vec!["ledger".into()],
            },
        }
    }

    struct Counting {
        calls: AtomicUsize,
        fail_first: usize,
        delay: Duration,
    }

    impl Counting {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: 0,
                delay: Duration::ZERO,
            }
        }
    }

    impl Enricher for Counting {
        fn enrich(&self, request: &EnrichmentRequest) -> Result<SemanticAnnotation, EnrichmentError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            if n < self.fail_first {
                return Err(EnrichmentError::Failed("flaky".into()));
            }
            Ok(function_annotation(&request.name))
        }
    }

    fn settings() -> EnrichmentSettings {
        EnrichmentSettings {
            concurrency: 2,
            batch_size: 2,
            timeout: Duration::from_secs(5),
            retries: 3,
            backoff: Duration::from_millis(1),
        }
    }

    #[test]
    fn annotation_json_is_flat_and_tagged() {
        let json = serde_json::to_value(function_annotation("p")).unwrap();
        assert_eq!(json["type"], "function");
        assert_eq!(json["complexity"], "low");
        let back: SemanticAnnotation = serde_json::from_value(json).unwrap();
        assert_eq!(back.purpose, "p");
    }

    #[test]
    fn validate_rejects_mismatched_shape() {
        let annotation = function_annotation("p");
        assert!(annotation.validate(EntityKind::Method).is_ok());
        assert!(matches!(
            annotation.validate(EntityKind::Class),
            Err(EnrichmentError::InvalidPayload(_))
        ));
    }

    #[test]
    fn semantic_edges_cover_patterns_concepts_and_flows() {
        let edges = function_annotation("p").semantic_edges("m.f");
        let kinds: Vec<EdgeKind> = edges.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                EdgeKind::ImplementsPattern,
                EdgeKind::RelatesToConcept,
                EdgeKind::DataFlowsTo
            ]
        );
        assert!(edges.iter().all(|e| e.source_key == "m.f"));
    }

    #[test]
    fn shared_fingerprints_cost_one_call() {
        let enricher = Arc::new(Counting::new());
        let cache = Arc::new(MemoryCache::new());
        let runner = EnrichmentRunner::new(enricher.clone(), cache.clone(), settings());
        let run = runner.run(
            vec![request("m.a", "fp"), request("m.b", "fp"), request("m.c", "other")],
            &CancelToken::new(),
        );
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(run.stats.calls, 2);
        assert_eq!(run.stats.cache_hits, 1);
        assert_eq!(run.outcomes.len(), 3);
        assert_eq!(cache.len().unwrap(), 2);

        let again = runner.run(vec![request("m.d", "fp")], &CancelToken::new());
        assert_eq!(again.stats.cache_hits, 1);
        assert_eq!(again.stats.calls, 0);
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn transient_failures_are_retried() {
        let enricher = Arc::new(Counting {
            fail_first: 2,
            ..Counting::new()
        });
        let runner = EnrichmentRunner::new(enricher.clone(), Arc::new(MemoryCache::new()), settings());
        let run = runner.run(vec![request("m.a", "fp")], &CancelToken::new());
        assert!(run.outcomes[0].result.is_ok());
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 3);
        assert_eq!(run.stats.failures, 0);
    }

    #[test]
    fn timeouts_degrade_without_caching() {
        let enricher = Arc::new(Counting {
            delay: Duration::from_millis(300),
            ..Counting::new()
        });
        let cache = Arc::new(MemoryCache::new());
        let runner = EnrichmentRunner::new(
            enricher,
            cache.clone(),
            EnrichmentSettings {
                timeout: Duration::from_millis(20),
                retries: 1,
                ..settings()
            },
        );
        let run = runner.run(vec![request("m.slow", "fp")], &CancelToken::new());
        assert!(matches!(
            run.outcomes[0].result,
            Err(EnrichmentError::Timeout(_))
        ));
        assert_eq!(run.stats.failures, 1);
        assert_eq!(cache.len().unwrap(), 0);
    }

    struct InFlight {
        calls: AtomicUsize,
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl InFlight {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }
    }

    impl Enricher for InFlight {
        fn enrich(&self, request: &EnrichmentRequest) -> Result<SemanticAnnotation, EnrichmentError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(function_annotation(&request.name))
        }
    }

    #[test]
    fn timed_out_calls_still_count_against_concurrency() {
        let enricher = Arc::new(InFlight::new(Duration::from_millis(400)));
        let runner = EnrichmentRunner::new(
            enricher.clone(),
            Arc::new(MemoryCache::new()),
            EnrichmentSettings {
                concurrency: 1,
                batch_size: 2,
                timeout: Duration::from_millis(30),
                retries: 3,
                backoff: Duration::from_millis(1),
            },
        );
        let run = runner.run(
            vec![request("m.a", "fp-a"), request("m.b", "fp-b")],
            &CancelToken::new(),
        );
        assert_eq!(run.stats.failures, 2);
        assert_eq!(enricher.peak.load(Ordering::SeqCst), 1);
        assert!(enricher.calls.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn slow_call_is_awaited_instead_of_duplicated() {
        let enricher = Arc::new(InFlight::new(Duration::from_millis(80)));
        let runner = EnrichmentRunner::new(
            enricher.clone(),
            Arc::new(MemoryCache::new()),
            EnrichmentSettings {
                timeout: Duration::from_millis(50),
                retries: 4,
                ..settings()
            },
        );
        let run = runner.run(vec![request("m.slow", "fp")], &CancelToken::new());
        assert!(run.outcomes[0].result.is_ok());
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn shared_limit_carries_over_between_runners() {
        let limit = CallLimit::new(1);
        let held = limit.acquire(Duration::ZERO).unwrap();
        let enricher = Arc::new(Counting::new());
        let runner = EnrichmentRunner::new(
            enricher.clone(),
            Arc::new(MemoryCache::new()),
            EnrichmentSettings {
                timeout: Duration::from_millis(20),
                retries: 1,
                ..settings()
            },
        )
        .with_limit(limit.clone());
        let run = runner.run(vec![request("m.a", "fp")], &CancelToken::new());
        assert!(matches!(
            run.outcomes[0].result,
            Err(EnrichmentError::Saturated(1))
        ));
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 0);

        drop(held);
        let run = runner.run(vec![request("m.a", "fp")], &CancelToken::new());
        assert!(run.outcomes[0].result.is_ok());
    }

    #[test]
    fn cancelled_run_makes_no_calls() {
        let enricher = Arc::new(Counting::new());
        let runner = EnrichmentRunner::new(enricher.clone(), Arc::new(MemoryCache::new()), settings());
        let cancel = CancelToken::new();
        cancel.cancel();
        let run = runner.run(vec![request("m.a", "fp")], &cancel);
        assert!(run.cancelled);
        assert_eq!(enricher.calls.load(Ordering::SeqCst), 0);
    }
}
