//! Client-side mirror of one remote job.
//!
//! A [`Job`] caches what it last learned from the supervisor. Once the job
//! reaches a final state the cache is authoritative: state, exit code and
//! timestamps are served locally from then on, even after the remote
//! directory has been purged.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::description::JobDescription;
use super::state::JobState;
use crate::config::PollConfig;
use crate::error::{Error, Result};
use crate::supervisor::{JobId, JobService};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
struct Mirror {
    id: Option<JobId>,
    state: JobState,
    created: Option<DateTime<Utc>>,
    started: Option<DateTime<Utc>>,
    finished: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
}

/// Serializable snapshot of a job's cached state.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: Option<JobId>,
    pub state: JobState,
    pub exit_code: Option<i32>,
    pub created: Option<DateTime<Utc>>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
}

pub struct Job {
    handle_id: u64,
    service: Weak<JobService>,
    description: Option<JobDescription>,
    poll: PollConfig,
    mirror: Mutex<Mirror>,
}

impl Job {
    /// A job that has not been submitted yet.
    pub fn new(service: &Arc<JobService>, description: JobDescription) -> Self {
        Self::build(service, Some(description), None)
    }

    /// Mirrors an existing remote job, e.g. one submitted by an earlier
    /// process. Fails with `Error::InvalidJob` when the store does not know
    /// `id`.
    pub async fn attach(service: &Arc<JobService>, id: JobId) -> Result<Self> {
        let job = Self::build(service, None, Some(id));
        job.state().await?;
        Ok(job)
    }

    fn build(service: &Arc<JobService>, description: Option<JobDescription>, id: Option<JobId>) -> Self {
        Self {
            handle_id: NEXT_HANDLE_ID.fetch_add(1, Ordering::SeqCst),
            service: Arc::downgrade(service),
            description,
            poll: service.config().poll.clone(),
            mirror: Mutex::new(Mirror {
                id,
                state: JobState::New,
                created: None,
                started: None,
                finished: None,
                exit_code: None,
            }),
        }
    }

    fn mirror(&self) -> MutexGuard<'_, Mirror> {
        self.mirror.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Process-unique identity of this handle, independent of the job id.
    pub fn handle_id(&self) -> u64 {
        self.handle_id
    }

    pub fn id(&self) -> Option<JobId> {
        self.mirror().id.clone()
    }

    pub fn description(&self) -> Option<&JobDescription> {
        self.description.as_ref()
    }

    /// Last known state, without a round trip.
    pub fn cached_state(&self) -> JobState {
        self.mirror().state
    }

    /// Known once the job is final.
    pub fn exit_code(&self) -> Option<i32> {
        self.mirror().exit_code
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.mirror().created
    }

    pub fn started(&self) -> Option<DateTime<Utc>> {
        self.mirror().started
    }

    pub fn finished(&self) -> Option<DateTime<Utc>> {
        self.mirror().finished
    }

    pub fn info(&self) -> JobInfo {
        let m = self.mirror();
        JobInfo {
            id: m.id.clone(),
            state: m.state,
            exit_code: m.exit_code,
            created: m.created,
            started: m.started,
            finished: m.finished,
        }
    }

    pub(crate) fn service(&self) -> Result<Arc<JobService>> {
        self.service
            .upgrade()
            .ok_or_else(|| Error::IncorrectState("the job's service has been dropped".to_string()))
    }

    /// Identity of the owning service, for grouping jobs by backend.
    pub(crate) fn service_key(&self) -> usize {
        self.service.as_ptr() as usize
    }

    fn require_id(&self) -> Result<JobId> {
        self.id()
            .ok_or_else(|| Error::IncorrectState("job has not been run".to_string()))
    }

    /// Submits the job.
    pub async fn run(&self) -> Result<()> {
        let description = self.description.as_ref().ok_or_else(|| {
            Error::IncorrectState("an attached job cannot be submitted again".to_string())
        })?;
        if let Some(id) = self.id() {
            return Err(Error::IncorrectState(format!("job {} was already submitted", id)));
        }
        let argv = description.to_argv()?;
        let id = self.service()?.run_job(&argv).await?;

        let mut m = self.mirror();
        m.id = Some(id);
        m.state = JobState::New;
        m.created = Some(Utc::now());
        Ok(())
    }

    /// Current state; a round trip unless the job is known to be final or
    /// has not been submitted.
    pub async fn state(&self) -> Result<JobState> {
        let (id, cached) = {
            let m = self.mirror();
            (m.id.clone(), m.state)
        };
        let Some(id) = id else {
            return Ok(cached);
        };
        if cached.is_final() {
            return Ok(cached);
        }
        let state = self.service()?.state(&id).await?;
        self.observe(state).await;
        Ok(self.cached_state())
    }

    /// Folds an observed state into the cache. The first final state also
    /// fetches the exit code.
    pub(crate) async fn observe(&self, state: JobState) {
        let newly_final = {
            let mut m = self.mirror();
            if m.state.is_final() {
                return;
            }
            let now = Utc::now();
            if state != JobState::New && m.started.is_none() {
                m.started = Some(now);
            }
            m.state = state;
            if state.is_final() {
                m.finished = Some(now);
            }
            state.is_final()
        };
        if !newly_final {
            return;
        }

        let Some(id) = self.id() else {
            return;
        };
        let exit_code = match self.service() {
            Ok(service) => match service.result(&id).await {
                Ok(code) => code,
                Err(e) => {
                    warn!("no exit status for job {}: {}", id, e);
                    None
                }
            },
            Err(e) => {
                warn!("no exit status for job {}: {}", id, e);
                None
            }
        };
        self.mirror().exit_code = exit_code;
        info!("job {} is {} (exit code {:?})", id, state, exit_code);
    }

    /// Polls until the job is final.
    ///
    /// # Errors
    /// `Error::Timeout` when `timeout` passes first; the job keeps running.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<JobState> {
        let start = Instant::now();
        let mut backoff = Backoff::new(&self.poll);
        loop {
            let state = self.state().await?;
            if state.is_final() {
                return Ok(state);
            }
            let id = self.require_id()?;
            let delay = backoff.next_delay();
            match timeout {
                Some(limit) => {
                    let elapsed = start.elapsed();
                    if elapsed >= limit {
                        return Err(Error::Timeout {
                            context: format!("waiting for job {} (still {})", id, state),
                            elapsed,
                            partial: String::new(),
                        });
                    }
                    tokio::time::sleep(delay.min(limit - elapsed)).await;
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }

    pub async fn suspend(&self) -> Result<()> {
        let id = self.require_id()?;
        self.service()?.suspend(&id).await?;
        self.mirror().state = JobState::Suspended;
        debug!("job {} suspended", id);
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        let id = self.require_id()?;
        self.service()?.resume(&id).await?;
        self.mirror().state = JobState::Running;
        debug!("job {} resumed", id);
        Ok(())
    }

    /// Kills the job and waits for the supervisor to record `Canceled`.
    pub async fn cancel(&self) -> Result<()> {
        self.request_cancel().await?;
        let grace = Duration::from_secs(self.poll.cancel_grace_secs);
        self.wait(Some(grace)).await.map(drop)
    }

    /// Sends `CANCEL` without waiting for its effect.
    pub(crate) async fn request_cancel(&self) -> Result<()> {
        let id = self.require_id()?;
        let mut state = self.state().await?;
        if state.is_final() {
            return Err(Error::IncorrectState(format!("job {} is already {}", id, state)));
        }

        if state == JobState::New {
            // nothing to signal until the monitor has started the workload
            let grace = Duration::from_secs(self.poll.cancel_grace_secs);
            let start = Instant::now();
            let mut backoff = Backoff::new(&self.poll);
            while state == JobState::New {
                if start.elapsed() >= grace {
                    return Err(Error::Timeout {
                        context: format!("waiting for job {} to start before canceling it", id),
                        elapsed: start.elapsed(),
                        partial: String::new(),
                    });
                }
                tokio::time::sleep(backoff.next_delay()).await;
                state = self.state().await?;
            }
        }

        self.service()?.cancel(&id).await?;
        info!("cancel sent to job {}", id);
        Ok(())
    }

    /// Appends to the job's input file.
    pub async fn write_stdin(&self, data: &[u8]) -> Result<()> {
        let id = self.require_id()?;
        self.service()?.stdin(&id, data).await
    }

    /// Contents of the job's output file so far.
    pub async fn stdout(&self) -> Result<Vec<u8>> {
        let id = self.require_id()?;
        self.service()?.stdout(&id).await
    }

    pub async fn stderr(&self) -> Result<Vec<u8>> {
        let id = self.require_id()?;
        self.service()?.stderr(&id).await
    }
}
