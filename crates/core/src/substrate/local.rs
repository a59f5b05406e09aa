use super::{
    AttemptEvent, AttemptRecord, AttemptStatus, ExecutionSubstrate, ResultContext, SubmitRequest,
};
use crate::types::{AttemptId, JobIdentity, ParamValue};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Executable logic behind a job kind
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    /// Run one attempt. Produced files go under `ctx.work_dir`, and the returned
    /// context says where they are.
    async fn run(&self, ctx: JobContext) -> Result<ResultContext>;
}

/// Everything a job attempt gets to see
#[derive(Debug, Clone)]
pub struct JobContext {
    pub identity: JobIdentity,
    pub attempt_id: AttemptId,
    pub parameters: BTreeMap<String, ParamValue>,
    pub inputs: Vec<PathBuf>,
    pub work_dir: PathBuf,
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn param(&self, key: &str) -> Result<&ParamValue> {
        self.parameters
            .get(key)
            .ok_or_else(|| anyhow!("Missing parameter '{}' for {}", key, self.identity))
    }

    pub fn param_i64(&self, key: &str) -> Result<i64> {
        self.param(key)?
            .as_i64()
            .ok_or_else(|| anyhow!("Parameter '{}' is not an integer", key))
    }

    pub fn param_str(&self, key: &str) -> Result<&str> {
        self.param(key)?
            .as_str()
            .ok_or_else(|| anyhow!("Parameter '{}' is not a string", key))
    }
}

/// In-process substrate running registered jobs on tokio tasks.
///
/// Attempt history lives in memory; each attempt gets its own work directory
/// under the substrate root.
pub struct LocalSubstrate {
    root: PathBuf,
    jobs: RwLock<HashMap<String, Arc<dyn Job>>>,
    attempts: Arc<Mutex<HashMap<JobIdentity, Vec<AttemptRecord>>>>,
    running: Arc<Mutex<HashMap<AttemptId, CancellationToken>>>,
    events: broadcast::Sender<AttemptEvent>,
}

impl LocalSubstrate {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root).context("Failed to create substrate work directory")?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            root,
            jobs: RwLock::new(HashMap::new()),
            attempts: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(Mutex::new(HashMap::new())),
            events,
        })
    }

    /// Register the logic for a job kind, replacing any previous registration
    pub fn register(&self, kind: impl Into<String>, job: Arc<dyn Job>) {
        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.into(), job);
    }

    /// Record an attempt without running anything (e.g. history from a previous process)
    pub fn seed_attempt(&self, identity: JobIdentity, record: AttemptRecord) {
        lock(&self.attempts).entry(identity).or_default().push(record);
    }

    /// Mark an attempt as abandoned, as if its process had died. No notification is sent.
    pub fn abandon(&self, attempt_id: AttemptId) -> bool {
        if let Some(token) = lock(&self.running).remove(&attempt_id) {
            token.cancel();
        }
        update_record(&self.attempts, attempt_id, |record| {
            record.status = AttemptStatus::Abandoned;
            record.end_time = Some(Utc::now());
        })
        .is_some()
    }

    /// Forget the attempt history of a job identity (remediation of abandoned attempts)
    pub fn clear_attempts(&self, identity: &JobIdentity) {
        lock(&self.attempts).remove(identity);
    }

    /// Number of attempts currently executing
    pub fn running_count(&self) -> usize {
        lock(&self.running).len()
    }

    fn job(&self, kind: &str) -> Option<Arc<dyn Job>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(kind)
            .cloned()
    }
}

#[async_trait::async_trait]
impl ExecutionSubstrate for LocalSubstrate {
    async fn submit(&self, request: SubmitRequest) -> Result<AttemptId> {
        let job = self
            .job(&request.job_kind)
            .ok_or_else(|| anyhow!("No job registered for kind '{}'", request.job_kind))?;

        let record = AttemptRecord::new(AttemptStatus::Starting);
        let attempt_id = record.attempt_id;
        let work_dir = self.root.join(attempt_id.to_string());
        tokio::fs::create_dir_all(&work_dir)
            .await
            .context("Failed to create attempt work directory")?;

        let cancel = CancellationToken::new();
        lock(&self.running).insert(attempt_id, cancel.clone());
        lock(&self.attempts)
            .entry(request.identity.clone())
            .or_default()
            .push(record);

        tracing::debug!(
            "Attempt submitted: identity={}, attempt_id={}",
            request.identity,
            attempt_id
        );

        let ctx = JobContext {
            identity: request.identity.clone(),
            attempt_id,
            parameters: request.parameters,
            inputs: request.inputs,
            work_dir,
            cancel: cancel.clone(),
        };
        let attempts = self.attempts.clone();
        let running = self.running.clone();
        let events = self.events.clone();
        let identity = request.identity;

        tokio::spawn(async move {
            update_record(&attempts, attempt_id, |r| {
                if r.status == AttemptStatus::Starting {
                    r.status = AttemptStatus::Started;
                }
            });

            let outcome = tokio::select! {
                result = job.run(ctx) => Some(result),
                _ = cancel.cancelled() => None,
            };

            let (status, result_context, error) = match outcome {
                Some(Ok(context)) => (AttemptStatus::Completed, context, None),
                Some(Err(e)) => {
                    tracing::warn!(
                        "Attempt failed: identity={}, attempt_id={}, error={:#}",
                        identity,
                        attempt_id,
                        e
                    );
                    (AttemptStatus::Failed, ResultContext::new(), Some(format!("{:#}", e)))
                }
                None => (AttemptStatus::Stopped, ResultContext::new(), None),
            };

            lock(&running).remove(&attempt_id);
            let recorded = update_record(&attempts, attempt_id, |r| {
                // abandon() may have claimed the record already
                if r.status.is_terminal() {
                    return;
                }
                r.status = status;
                r.end_time = Some(Utc::now());
                r.result_context = result_context;
                r.error = error;
            });

            if let Some(final_status) = recorded {
                if final_status != AttemptStatus::Abandoned {
                    // No subscribers is fine; the liveness guard will catch up
                    let _ = events.send(AttemptEvent {
                        identity,
                        attempt_id,
                        status: final_status,
                    });
                }
            }
        });

        Ok(attempt_id)
    }

    async fn query_attempts(&self, identity: &JobIdentity) -> Result<Vec<AttemptRecord>> {
        Ok(lock(&self.attempts)
            .get(identity)
            .cloned()
            .unwrap_or_default())
    }

    async fn stop(&self, attempt_id: AttemptId) -> Result<()> {
        let token = lock(&self.running).get(&attempt_id).cloned();
        match token {
            Some(token) => {
                update_record(&self.attempts, attempt_id, |r| {
                    if !r.status.is_terminal() {
                        r.status = AttemptStatus::Stopping;
                    }
                });
                token.cancel();
                tracing::info!("Stop requested: attempt_id={}", attempt_id);
            }
            None => {
                tracing::debug!(
                    "Stop requested for attempt that is not running: attempt_id={}",
                    attempt_id
                );
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<AttemptEvent> {
        self.events.subscribe()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Apply `f` to the record with the given id, returning its resulting status
fn update_record(
    attempts: &Mutex<HashMap<JobIdentity, Vec<AttemptRecord>>>,
    attempt_id: AttemptId,
    f: impl FnOnce(&mut AttemptRecord),
) -> Option<AttemptStatus> {
    let mut attempts = lock(attempts);
    let record = attempts
        .values_mut()
        .flat_map(|records| records.iter_mut())
        .find(|r| r.attempt_id == attempt_id)?;
    f(record);
    Some(record.status)
}
