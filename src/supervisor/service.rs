//! Client of one job store: the supervisor running on an endpoint, rooted
//! at a base directory.
//!
//! The service owns two sessions to its endpoint. The supervisor session is
//! bootstrapped into the supervisor and carries the job protocol; a second,
//! plain shell session is opened on demand for file staging. A supervisor
//! session that died (idle watchdog, lost connection) is replaced on the
//! next request. The request that observed the death fails and is never
//! replayed, since `RUN` is not idempotent.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::protocol::{self, JobId, Request, Response};
use super::script;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::job::JobState;
use crate::shell::{ConnectParams, Endpoint, LauncherRegistry, ShellSession};

/// Ids per `STATES` request, keeping the line well under the terminal limit.
const STATES_BATCH: usize = 200;
/// Raw bytes per `STDIN` request.
const STDIN_CHUNK: usize = 2048;

pub struct JobService {
    endpoint: Endpoint,
    params: ConnectParams,
    registry: LauncherRegistry,
    config: Config,
    supervisor: Mutex<Option<Arc<ShellSession>>>,
    files: Mutex<Option<Arc<ShellSession>>>,
    supervisor_pid: AtomicU32,
    closed: AtomicBool,
}

impl JobService {
    /// Connects to `url` and starts the supervisor there.
    pub async fn connect(url: &str, params: ConnectParams, config: Config) -> Result<Arc<Self>> {
        let endpoint = Endpoint::parse(url)?;
        Self::connect_with(LauncherRegistry::default(), endpoint, params, config).await
    }

    pub async fn connect_with(
        registry: LauncherRegistry,
        endpoint: Endpoint,
        params: ConnectParams,
        config: Config,
    ) -> Result<Arc<Self>> {
        registry.resolve(&endpoint.scheme)?;
        let service = Arc::new(Self {
            endpoint,
            params,
            registry,
            config,
            supervisor: Mutex::new(None),
            files: Mutex::new(None),
            supervisor_pid: AtomicU32::new(0),
            closed: AtomicBool::new(false),
        });
        service.supervisor_session().await?;
        Ok(service)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Root of the job store on the endpoint.
    pub fn base_dir(&self) -> &str {
        &self.config.supervisor.base_dir
    }

    /// pid of the current supervisor, as announced in its banner.
    pub fn supervisor_pid(&self) -> Option<u32> {
        match self.supervisor_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Whether the current supervisor session is alive. A dead one is only
    /// replaced by the next request.
    pub async fn is_connected(&self) -> bool {
        self.supervisor
            .lock()
            .await
            .as_ref()
            .is_some_and(|session| session.alive())
    }

    async fn supervisor_session(&self) -> Result<Arc<ShellSession>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::IncorrectState(format!("job service for {} is closed", self.endpoint)));
        }
        let mut slot = self.supervisor.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.alive() {
                return Ok(session.clone());
            }
            warn!(
                "supervisor session {} to {} is gone, starting a new one",
                session.id(),
                self.endpoint
            );
            session.finalize(true).await;
        }
        let session = Arc::new(self.bootstrap().await?);
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn bootstrap(&self) -> Result<ShellSession> {
        let session = ShellSession::open_with(
            &self.registry,
            self.endpoint.clone(),
            self.params.clone(),
            self.config.session.clone(),
        )
        .await?;
        match self.install(&session).await {
            Ok(pid) => {
                self.supervisor_pid.store(pid, Ordering::SeqCst);
                info!(
                    session = session.id(),
                    "supervisor {} running on {} with store {}",
                    pid,
                    self.endpoint,
                    self.base_dir()
                );
                Ok(session)
            }
            Err(e) => {
                session.finalize(true).await;
                Err(e)
            }
        }
    }

    /// Uploads the scripts and replaces the login shell with the
    /// supervisor. Returns the supervisor's pid.
    async fn install(&self, session: &ShellSession) -> Result<u32> {
        let base = self.base_dir();
        let timeout = Some(self.config.session.connect_timeout());

        let output = session.run_sync(&script::mkdir_command(base), timeout).await?;
        if !output.success() {
            return Err(Error::RemoteIo(format!(
                "cannot create {}: {}",
                base,
                output.stdout.trim()
            )));
        }

        for script in [script::wrapper(), script::monitor()] {
            let mut pending = session.run_async(&script.upload_command(base)).await?;
            pending.send(&script.heredoc_body())?;
            let output = pending.find_prompt(timeout).await?;
            if !output.success() {
                return Err(Error::RemoteIo(format!(
                    "cannot write {}/{}: {}",
                    base,
                    script.name,
                    output.stdout.trim()
                )));
            }
            debug!(session = session.id(), "uploaded {}", script.name);
        }

        let pending = session
            .run_async(&script::exec_command(base, self.config.supervisor.idle_timeout_secs))
            .await?;
        let banner = pending.find_prompt(timeout).await?;
        let payload = Response::parse(&banner)?.into_result()?;
        payload
            .trim()
            .parse::<u32>()
            .map_err(|_| Error::protocol(format!("bad supervisor banner '{}'", payload), banner.stdout))
    }

    /// Sends one request and returns the `OK` payload.
    pub async fn request(&self, request: &Request) -> Result<String> {
        let line = request.encode()?;
        let session = self.supervisor_session().await?;
        let output = session.run_sync(&line, None).await?;
        let response = Response::parse(&output)?;
        debug!(session = session.id(), request = request.name(), "{:?}", response);
        response.into_result()
    }

    /// Starts `argv` as a new job. The program is exec'd in place of the
    /// job's shell, so SUSPEND, RESUME and CANCEL signal it directly.
    pub async fn run_job<S: AsRef<str>>(&self, argv: &[S]) -> Result<JobId> {
        let argv: Vec<String> = argv.iter().map(|word| word.as_ref().to_string()).collect();
        let payload = self.request(&Request::Run(argv)).await?;
        let id = protocol::parse_job_id(&payload)?;
        info!("job {} started on {}", id, self.endpoint);
        Ok(id)
    }

    pub async fn state(&self, id: &JobId) -> Result<JobState> {
        self.request(&Request::State(id.clone())).await?.parse()
    }

    /// States of many jobs in as few round trips as possible. `None` marks
    /// ids the store does not know.
    pub async fn states(&self, ids: &[JobId]) -> Result<Vec<(JobId, Option<JobState>)>> {
        let mut states = Vec::with_capacity(ids.len());
        for batch in ids.chunks(STATES_BATCH) {
            let payload = self.request(&Request::States(batch.to_vec())).await?;
            states.extend(protocol::parse_states(&payload)?);
        }
        Ok(states)
    }

    /// Exit status of a finished job.
    pub async fn result(&self, id: &JobId) -> Result<Option<i32>> {
        let payload = self.request(&Request::Result(id.clone())).await?;
        protocol::parse_exit_code(&payload)
    }

    pub async fn suspend(&self, id: &JobId) -> Result<()> {
        self.request(&Request::Suspend(id.clone())).await.map(drop)
    }

    pub async fn resume(&self, id: &JobId) -> Result<()> {
        self.request(&Request::Resume(id.clone())).await.map(drop)
    }

    pub async fn cancel(&self, id: &JobId) -> Result<()> {
        self.request(&Request::Cancel(id.clone())).await.map(drop)
    }

    /// Appends `data` to the job's input file.
    pub async fn stdin(&self, id: &JobId, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(STDIN_CHUNK) {
            self.request(&Request::Stdin(id.clone(), chunk.to_vec())).await?;
        }
        Ok(())
    }

    pub async fn stdout(&self, id: &JobId) -> Result<Vec<u8>> {
        protocol::decode_output(&self.request(&Request::Stdout(id.clone())).await?)
    }

    pub async fn stderr(&self, id: &JobId) -> Result<Vec<u8>> {
        protocol::decode_output(&self.request(&Request::Stderr(id.clone())).await?)
    }

    pub async fn list(&self) -> Result<Vec<JobId>> {
        protocol::parse_id_list(&self.request(&Request::List).await?)
    }

    /// Removes one job directory, or every finished one. Returns how many
    /// directories went away.
    pub async fn purge(&self, id: Option<&JobId>) -> Result<usize> {
        let payload = self.request(&Request::Purge(id.cloned())).await?;
        payload
            .trim()
            .parse::<usize>()
            .map_err(|_| Error::protocol(format!("bad PURGE count '{}'", payload), payload.as_str()))
    }

    pub async fn noop(&self) -> Result<()> {
        self.request(&Request::Noop).await.map(drop)
    }

    async fn files_session(&self) -> Result<Arc<ShellSession>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::IncorrectState(format!("job service for {} is closed", self.endpoint)));
        }
        let mut slot = self.files.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.alive() {
                return Ok(session.clone());
            }
            session.finalize(true).await;
        }
        let session = Arc::new(
            ShellSession::open_with(
                &self.registry,
                self.endpoint.clone(),
                self.params.clone(),
                self.config.session.clone(),
            )
            .await?,
        );
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Copies a local file or directory tree to the endpoint.
    pub async fn stage_in(&self, local: &Path, remote: &str, recursive: bool) -> Result<()> {
        self.files_session()
            .await?
            .stage_to_remote(local, remote, recursive)
            .await
    }

    /// Copies a file or directory tree from the endpoint.
    pub async fn stage_out(&self, remote: &str, local: &Path, recursive: bool) -> Result<()> {
        self.files_session()
            .await?
            .stage_from_remote(remote, local, recursive)
            .await
    }

    /// Stops the supervisor and closes both sessions. Jobs keep running.
    /// Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.supervisor.lock().await.take() {
            if session.alive() {
                match Request::Quit.encode() {
                    Ok(line) => {
                        if let Err(e) = session.run_sync(&line, None).await {
                            debug!("QUIT to {} failed: {}", self.endpoint, e);
                        }
                    }
                    Err(e) => debug!("cannot encode QUIT: {}", e),
                }
            }
            session.finalize(true).await;
        }
        if let Some(session) = self.files.lock().await.take() {
            session.finalize(false).await;
        }
        self.supervisor_pid.store(0, Ordering::SeqCst);
        info!("job service for {} closed", self.endpoint);
    }
}
