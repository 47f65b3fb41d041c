use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::{
    backend::JobStore, DispatchError, DispatchResult, Job, JobId, RankKey, WorkerId, WorkerState,
    WorkerStatus,
};

/// Ranked set with an id index so removal by id is O(log n)
#[derive(Debug, Default)]
struct RankedSet {
    by_key: BTreeMap<RankKey, JobId>,
    by_id: HashMap<JobId, RankKey>,
}

impl RankedSet {
    fn insert(&mut self, job_id: JobId, key: RankKey) {
        if let Some(old) = self.by_id.insert(job_id.clone(), key) {
            self.by_key.remove(&old);
        }
        self.by_key.insert(key, job_id);
    }

    fn remove(&mut self, job_id: &JobId) -> bool {
        match self.by_id.remove(job_id) {
            Some(key) => {
                self.by_key.remove(&key);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Default)]
struct DelayedSet {
    by_time: BTreeSet<(DateTime<Utc>, JobId)>,
    by_id: HashMap<JobId, DateTime<Utc>>,
}

impl DelayedSet {
    fn insert(&mut self, job_id: JobId, until: DateTime<Utc>) {
        if let Some(old) = self.by_id.insert(job_id.clone(), until) {
            self.by_time.remove(&(old, job_id.clone()));
        }
        self.by_time.insert((until, job_id));
    }

    fn remove(&mut self, job_id: &JobId) -> bool {
        match self.by_id.remove(job_id) {
            Some(until) => {
                self.by_time.remove(&(until, job_id.clone()));
                true
            }
            None => false,
        }
    }

    fn take_due(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut due = Vec::new();
        while let Some((until, _)) = self.by_time.first() {
            if *until > now {
                break;
            }
            if let Some((_, job_id)) = self.by_time.pop_first() {
                self.by_id.remove(&job_id);
                due.push(job_id);
            }
        }
        due
    }
}

/// Worker record with its liveness deadline
#[derive(Debug, Clone)]
struct WorkerEntry {
    state: WorkerState,
    expires_at: DateTime<Utc>,
}

/// In-memory store for testing and single-process deployments
pub struct MemoryStore {
    /// Store-wide enqueue sequence
    pub(crate) sequence: AtomicU64,

    /// Job records indexed by job_id
    pub(crate) jobs: Arc<RwLock<HashMap<JobId, Job>>>,

    /// queue_name -> ranked set of ready jobs
    ranked: Arc<RwLock<HashMap<String, RankedSet>>>,

    /// queue_name -> jobs held back until their delay elapses
    delayed: Arc<RwLock<HashMap<String, DelayedSet>>>,

    /// queue_name -> jobs currently claimed by a worker
    processing: Arc<RwLock<HashMap<String, HashSet<JobId>>>>,

    /// Worker records with TTL
    workers: Arc<RwLock<HashMap<WorkerId, WorkerEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU64::new(0),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            ranked: Arc::new(RwLock::new(HashMap::new())),
            delayed: Arc::new(RwLock::new(HashMap::new())),
            processing: Arc::new(RwLock::new(HashMap::new())),
            workers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Number of job records held, any status
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn ttl_to_chrono(ttl: Duration) -> DispatchResult<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| DispatchError::Validation(format!("Invalid worker TTL: {}", e)))
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn next_sequence(&self) -> DispatchResult<u64> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst))
    }

    async fn insert_job(&self, mut job: Job) -> DispatchResult<Job> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&job.id) {
            return Err(DispatchError::Storage(format!("Job {} already exists", job.id)));
        }
        job.version = 1;
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    async fn get_job(&self, job_id: &JobId) -> DispatchResult<Option<Job>> {
        Ok(self.jobs.read().get(job_id).cloned())
    }

    async fn swap_job(&self, expected_version: u64, mut job: Job) -> DispatchResult<Job> {
        let mut jobs = self.jobs.write();
        let stored = jobs
            .get_mut(&job.id)
            .ok_or_else(|| DispatchError::JobNotFound(job.id.to_string()))?;

        if stored.version != expected_version {
            return Err(DispatchError::Conflict {
                job_id: job.id.to_string(),
                expected: expected_version,
                found: stored.version,
            });
        }

        job.version = expected_version + 1;
        *stored = job.clone();
        Ok(job)
    }

    async fn delete_job(&self, job_id: &JobId) -> DispatchResult<bool> {
        Ok(self.jobs.write().remove(job_id).is_some())
    }

    async fn list_jobs(&self, queue: &str) -> DispatchResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .values()
            .filter(|job| job.queue_name == queue)
            .cloned()
            .collect())
    }

    async fn queue_names(&self) -> DispatchResult<Vec<String>> {
        let jobs = self.jobs.read();
        let mut names: Vec<String> = jobs
            .values()
            .map(|job| job.queue_name.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn rank_insert(&self, queue: &str, job_id: &JobId, key: RankKey) -> DispatchResult<()> {
        self.ranked
            .write()
            .entry(queue.to_string())
            .or_default()
            .insert(job_id.clone(), key);
        Ok(())
    }

    async fn rank_remove(&self, queue: &str, job_id: &JobId) -> DispatchResult<bool> {
        Ok(self
            .ranked
            .write()
            .get_mut(queue)
            .map_or(false, |set| set.remove(job_id)))
    }

    async fn rank_head(&self, queue: &str, limit: usize) -> DispatchResult<Vec<(JobId, RankKey)>> {
        let ranked = self.ranked.read();
        Ok(ranked
            .get(queue)
            .map(|set| {
                set.by_key
                    .iter()
                    .take(limit)
                    .map(|(key, id)| (id.clone(), *key))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn rank_len(&self, queue: &str) -> DispatchResult<usize> {
        Ok(self.ranked.read().get(queue).map_or(0, |set| set.by_id.len()))
    }

    async fn delay_insert(&self, queue: &str, job_id: &JobId, until: DateTime<Utc>) -> DispatchResult<()> {
        self.delayed
            .write()
            .entry(queue.to_string())
            .or_default()
            .insert(job_id.clone(), until);
        Ok(())
    }

    async fn delay_take_due(&self, queue: &str, now: DateTime<Utc>) -> DispatchResult<Vec<JobId>> {
        Ok(self
            .delayed
            .write()
            .get_mut(queue)
            .map(|set| set.take_due(now))
            .unwrap_or_default())
    }

    async fn delay_remove(&self, queue: &str, job_id: &JobId) -> DispatchResult<bool> {
        Ok(self
            .delayed
            .write()
            .get_mut(queue)
            .map_or(false, |set| set.remove(job_id)))
    }

    async fn delay_len(&self, queue: &str) -> DispatchResult<usize> {
        Ok(self.delayed.read().get(queue).map_or(0, |set| set.by_id.len()))
    }

    async fn processing_add(&self, queue: &str, job_id: &JobId) -> DispatchResult<()> {
        self.processing
            .write()
            .entry(queue.to_string())
            .or_default()
            .insert(job_id.clone());
        Ok(())
    }

    async fn processing_remove(&self, queue: &str, job_id: &JobId) -> DispatchResult<bool> {
        Ok(self
            .processing
            .write()
            .get_mut(queue)
            .map_or(false, |set| set.remove(job_id)))
    }

    async fn processing_list(&self, queue: &str) -> DispatchResult<Vec<JobId>> {
        Ok(self
            .processing
            .read()
            .get(queue)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_worker(&self, state: WorkerState, ttl: Duration) -> DispatchResult<()> {
        let expires_at = Utc::now() + ttl_to_chrono(ttl)?;
        self.workers
            .write()
            .insert(state.id.clone(), WorkerEntry { state, expires_at });
        Ok(())
    }

    async fn get_worker(&self, worker_id: &WorkerId) -> DispatchResult<Option<WorkerState>> {
        let now = Utc::now();
        let mut workers = self.workers.write();
        match workers.get(worker_id) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.state.clone())),
            Some(_) => {
                workers.remove(worker_id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn list_workers(&self) -> DispatchResult<Vec<WorkerState>> {
        let now = Utc::now();
        let mut workers = self.workers.write();
        workers.retain(|_, entry| entry.expires_at > now);

        let mut states: Vec<WorkerState> = workers.values().map(|e| e.state.clone()).collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(states)
    }

    async fn mark_worker_unhealthy(&self, worker_id: &WorkerId) -> DispatchResult<bool> {
        let now = Utc::now();
        let mut workers = self.workers.write();
        match workers.get_mut(worker_id) {
            Some(entry) if entry.expires_at > now => {
                entry.state.healthy = false;
                entry.state.status = WorkerStatus::Error;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove_worker(&self, worker_id: &WorkerId) -> DispatchResult<bool> {
        Ok(self.workers.write().remove(worker_id).is_some())
    }
}
