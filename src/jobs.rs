use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Discovering,
    Extracting,
    Diffing,
    Reconciling,
    Enriching,
    Committed,
    Failed,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::Committed | RunPhase::Failed | RunPhase::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub phase: RunPhase,
    pub files_processed: usize,
    pub total_files: usize,
    pub percent_complete: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Cooperative cancellation flag shared between a run and its caller.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Finished jobs kept for status queries; older ones are dropped.
pub const DEFAULT_FINISHED_RETENTION: usize = 64;

#[derive(Debug)]
struct JobState {
    seq: u64,
    status: JobStatus,
    cancel: CancelToken,
}

/// Registry of indexing runs, keyed by job id.
#[derive(Debug, Clone)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<String, JobState>>>,
    next_id: Arc<AtomicU64>,
    retain_finished: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self {
            jobs: Arc::default(),
            next_id: Arc::default(),
            retain_finished: DEFAULT_FINISHED_RETENTION,
        }
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(retain_finished: usize) -> Self {
        Self {
            retain_finished,
            ..Self::default()
        }
    }

    /// Number of jobs currently tracked, finished ones included.
    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn create(&self) -> JobHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job_id = format!("job-{id}");
        let cancel = CancelToken::new();
        let state = JobState {
            seq: id,
            status: JobStatus {
                job_id: job_id.clone(),
                phase: RunPhase::Pending,
                files_processed: 0,
                total_files: 0,
                percent_complete: 0.0,
                error: None,
            },
            cancel: cancel.clone(),
        };
        if let Ok(mut jobs) = self.jobs.lock() {
            prune_finished(&mut jobs, self.retain_finished);
            jobs.insert(job_id.clone(), state);
        }
        JobHandle {
            job_id,
            cancel,
            registry: self.clone(),
        }
    }

    pub fn get_status(&self, job_id: &str) -> Option<JobStatus> {
        let jobs = self.jobs.lock().ok()?;
        jobs.get(job_id).map(|state| state.status.clone())
    }

    /// Request cancellation. Returns `false` for unknown or finished jobs.
    pub fn cancel(&self, job_id: &str) -> bool {
        let Ok(jobs) = self.jobs.lock() else {
            return false;
        };
        match jobs.get(job_id) {
            Some(state) if !state.status.phase.is_terminal() => {
                state.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn update<F>(&self, job_id: &str, apply: F)
    where
        F: FnOnce(&mut JobStatus),
    {
        if let Ok(mut jobs) = self.jobs.lock() {
            if let Some(state) = jobs.get_mut(job_id) {
                apply(&mut state.status);
                let status = &mut state.status;
                status.percent_complete = if status.phase == RunPhase::Committed {
                    100.0
                } else if status.total_files == 0 {
                    0.0
                } else {
                    (status.files_processed as f64 / status.total_files as f64 * 100.0).min(100.0)
                };
            }
        }
    }
}

/// Drop the oldest finished jobs beyond `keep`. Running jobs are never
/// dropped.
fn prune_finished(jobs: &mut HashMap<String, JobState>, keep: usize) {
    let mut finished: Vec<(u64, String)> = jobs
        .iter()
        .filter(|(_, state)| state.status.phase.is_terminal())
        .map(|(id, state)| (state.seq, id.clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort_unstable();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
}

/// Write side of one job, held by the running indexer.
#[derive(Debug, Clone)]
pub struct JobHandle {
    job_id: String,
    cancel: CancelToken,
    registry: JobRegistry,
}

impl JobHandle {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn set_phase(&self, phase: RunPhase) {
        tracing::debug!("{}: phase {:?}", self.job_id, phase);
        self.registry.update(&self.job_id, |status| status.phase = phase);
    }

    pub fn set_total(&self, total: usize) {
        self.registry
            .update(&self.job_id, |status| status.total_files = total);
    }

    pub fn inc_processed(&self) {
        self.registry
            .update(&self.job_id, |status| status.files_processed += 1);
    }

    pub fn fail(&self, error: &str) {
        self.registry.update(&self.job_id, |status| {
            status.phase = RunPhase::Failed;
            status.error = Some(error.to_string());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_tracks_progress() {
        let registry = JobRegistry::new();
        let job = registry.create();
        assert_eq!(job.job_id(), "job-1");
        job.set_phase(RunPhase::Extracting);
        job.set_total(4);
        job.inc_processed();
        let status = registry.get_status("job-1").unwrap();
        assert_eq!(status.phase, RunPhase::Extracting);
        assert_eq!(status.files_processed, 1);
        assert!((status.percent_complete - 25.0).abs() < f64::EPSILON);

        job.set_phase(RunPhase::Committed);
        let status = registry.get_status("job-1").unwrap();
        assert_eq!(status.percent_complete, 100.0);
        assert!(registry.get_status("job-9").is_none());
    }

    #[test]
    fn cancel_reaches_the_handle() {
        let registry = JobRegistry::new();
        let job = registry.create();
        assert!(!job.cancel_token().is_cancelled());
        assert!(registry.cancel(job.job_id()));
        assert!(job.cancel_token().is_cancelled());

        job.set_phase(RunPhase::Cancelled);
        assert!(!registry.cancel(job.job_id()));
    }

    #[test]
    fn finished_jobs_are_pruned_beyond_retention() {
        let registry = JobRegistry::with_retention(2);
        let running = registry.create();
        running.set_phase(RunPhase::Extracting);
        for _ in 0..5 {
            registry.create().set_phase(RunPhase::Committed);
        }
        let latest = registry.create();
        // the running job, two finished ones, and the one just created
        assert_eq!(registry.len(), 4);
        assert!(registry.get_status(running.job_id()).is_some());
        assert!(registry.get_status("job-2").is_none());
        assert!(registry.get_status("job-6").is_some());
        assert_eq!(latest.job_id(), "job-7");
    }

    #[test]
    fn failure_is_recorded() {
        let registry = JobRegistry::new();
        let job = registry.create();
        job.fail("identity collision");
        let status = registry.get_status(job.job_id()).unwrap();
        assert_eq!(status.phase, RunPhase::Failed);
        assert_eq!(status.error.as_deref(), Some("identity collision"));
    }
}
