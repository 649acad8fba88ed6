//! Bulk operations over many jobs.
//!
//! Jobs are grouped by the service they belong to. Each group is handled
//! with as few round trips as its supervisor allows (one `STATES` request
//! per poll), and groups on different services proceed concurrently.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::debug;

use super::backoff::Backoff;
use super::handle::Job;
use super::state::JobState;
use crate::config::PollConfig;
use crate::error::{Error, Result};
use crate::supervisor::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Return once at least one job is final.
    Any,
    /// Return once every job is final.
    All,
}

/// Ordered set of job references. Holding a job here does not keep its
/// service alive.
#[derive(Default)]
pub struct JobContainer {
    next_seq: u64,
    /// insertion sequence -> job
    jobs: BTreeMap<u64, Arc<Job>>,
    /// handle id -> insertion sequence
    index: HashMap<u64, u64>,
}

impl JobContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `job`; `false` if it is already a member.
    pub fn add(&mut self, job: Arc<Job>) -> bool {
        if self.index.contains_key(&job.handle_id()) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.index.insert(job.handle_id(), seq);
        self.jobs.insert(seq, job);
        true
    }

    /// Removes `job`; `false` if it was not a member.
    pub fn remove(&mut self, job: &Job) -> bool {
        match self.index.remove(&job.handle_id()) {
            Some(seq) => self.jobs.remove(&seq).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, job: &Job) -> bool {
        self.index.contains_key(&job.handle_id())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Members in insertion order.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.values().cloned().collect()
    }

    /// Members grouped by service, groups ordered by first appearance.
    fn groups(&self) -> Vec<Vec<Arc<Job>>> {
        let mut order: Vec<usize> = Vec::new();
        let mut groups: HashMap<usize, Vec<Arc<Job>>> = HashMap::new();
        for job in self.jobs.values() {
            let key = job.service_key();
            if !groups.contains_key(&key) {
                order.push(key);
            }
            groups.entry(key).or_default().push(job.clone());
        }
        order
            .into_iter()
            .filter_map(|key| groups.remove(&key))
            .collect()
    }

    /// Submits every job. All jobs are attempted; the first error is
    /// returned.
    pub async fn run(&self) -> Result<()> {
        let results = join_all(self.groups().into_iter().map(run_group)).await;
        results.into_iter().collect()
    }

    /// Cancels every job that is not final yet and waits for all of them
    /// to settle.
    ///
    /// # Errors
    /// `Error::IncorrectState`, before anything is signalled, when a member
    /// has not been run.
    pub async fn cancel(&self) -> Result<()> {
        self.ensure_submitted()?;
        let results = join_all(self.groups().into_iter().map(cancel_group)).await;
        let sent: Result<()> = results.into_iter().collect();

        let grace = Duration::from_secs(self.poll_config().cancel_grace_secs);
        let settled = self.wait(WaitMode::All, Some(grace)).await;
        sent?;
        settled.map(drop)
    }

    /// States of all members, in insertion order. One bulk query per
    /// service; final and unsubmitted jobs are answered from their cache.
    pub async fn get_states(&self) -> Result<Vec<JobState>> {
        let results = join_all(self.groups().into_iter().map(refresh_group)).await;
        results.into_iter().collect::<Result<()>>()?;
        Ok(self.jobs.values().map(|job| job.cached_state()).collect())
    }

    fn ensure_submitted(&self) -> Result<()> {
        match self.jobs.values().find(|job| job.id().is_none()) {
            Some(job) => Err(Error::IncorrectState(format!(
                "job handle {} has not been run",
                job.handle_id()
            ))),
            None => Ok(()),
        }
    }

    fn poll_config(&self) -> PollConfig {
        self.jobs
            .values()
            .find_map(|job| job.service().ok())
            .map(|service| service.config().poll.clone())
            .unwrap_or_default()
    }

    /// Polls until `mode` is satisfied and returns the final members, in
    /// insertion order.
    ///
    /// # Errors
    /// `Error::Timeout` when `timeout` passes first. `Error::IncorrectState`
    /// when a member has not been run, since it would never become final.
    pub async fn wait(&self, mode: WaitMode, timeout: Option<Duration>) -> Result<Vec<Arc<Job>>> {
        if self.jobs.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_submitted()?;
        let mut backoff = Backoff::new(&self.poll_config());
        let start = Instant::now();

        loop {
            let states = self.get_states().await?;
            let finished = states.iter().filter(|s| s.is_final()).count();
            let done = match mode {
                WaitMode::Any => finished > 0,
                WaitMode::All => finished == states.len(),
            };
            if done {
                return Ok(self
                    .jobs
                    .values()
                    .filter(|job| job.cached_state().is_final())
                    .cloned()
                    .collect());
            }

            let delay = backoff.next_delay();
            match timeout {
                Some(limit) => {
                    let elapsed = start.elapsed();
                    if elapsed >= limit {
                        return Err(Error::Timeout {
                            context: format!(
                                "waiting for {:?} of {} jobs ({} final)",
                                mode,
                                states.len(),
                                finished
                            ),
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
}

async fn run_group(group: Vec<Arc<Job>>) -> Result<()> {
    let mut outcome = Ok(());
    for job in group {
        if let Err(e) = job.run().await {
            debug!("run of job handle {} failed: {}", job.handle_id(), e);
            if outcome.is_ok() {
                outcome = Err(e);
            }
        }
    }
    outcome
}

async fn cancel_group(group: Vec<Arc<Job>>) -> Result<()> {
    let mut outcome = Ok(());
    for job in group {
        if job.cached_state().is_final() {
            continue;
        }
        if let Err(e) = job.request_cancel().await {
            // finished on its own in the meantime
            let finished =
                matches!(e, Error::IncorrectState(_)) && job.state().await.is_ok_and(JobState::is_final);
            if !finished && outcome.is_ok() {
                outcome = Err(e);
            }
        }
    }
    outcome
}

/// One `STATES` round trip for every member of a same-service group that
/// is submitted and not final yet.
async fn refresh_group(group: Vec<Arc<Job>>) -> Result<()> {
    let pending: Vec<(JobId, Arc<Job>)> = group
        .iter()
        .filter(|job| !job.cached_state().is_final())
        .filter_map(|job| job.id().map(|id| (id, job.clone())))
        .collect();
    let Some((_, first)) = pending.first() else {
        return Ok(());
    };
    let service = first.service()?;
    let ids: Vec<JobId> = pending.iter().map(|(id, _)| id.clone()).collect();
    let observed: HashMap<JobId, Option<JobState>> = service.states(&ids).await?.into_iter().collect();
    for (id, job) in &pending {
        match observed.get(id) {
            Some(Some(state)) => job.observe(*state).await,
            _ => {
                return Err(Error::InvalidJob(format!(
                    "job {} is unknown to its supervisor",
                    id
                )));
            }
        }
    }
    Ok(())
}
