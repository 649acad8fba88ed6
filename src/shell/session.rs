//! Serialized command/response channel over one interactive shell.
//!
//! A [`ShellSession`] writes a command line to the shell, then accumulates
//! output until the last line matches the active prompt pattern. The
//! installed prompt embeds `$?`, so every completed command also yields its
//! exit status. One command is in flight at a time: the channel sits behind
//! an async mutex that [`ShellSession::run_async`] acquires and the matching
//! [`PendingCommand::find_prompt`] releases.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc::Receiver;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::prompt::{clean_output, prompt_ps1, strip_ansi_codes, PromptMatcher};
use super::pty::{child_running, kill_child, ChildHandle, PtyProcess};
use super::transport::{ConnectParams, Endpoint, LauncherRegistry, ShellLauncher, Transport};
use crate::config::SessionConfig;
use crate::error::{Error, Result};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_MARKER: AtomicU64 = AtomicU64::new(1);

/// Output fragments that mean the login itself failed.
const LOGIN_FAILURES: &[&str] = &[
    "Permission denied",
    "Host key verification failed",
    "Could not resolve hostname",
    "Connection refused",
    "Connection timed out",
    "No route to host",
    "password:",
    "passphrase for key",
];

/// Longest tail of partial output quoted inside an error message.
const PARTIAL_IN_MESSAGE: usize = 512;

/// Result of one completed command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Exit status carried by the prompt; `None` under a prompt pattern
    /// without a capture group.
    pub exit_code: Option<i32>,
    pub stdout: String,
    /// Empty unless the command ran with [`IoMode::Separate`].
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// How stderr of a command is captured. A pty merges both streams, so
/// separating them costs a second prompt cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoMode {
    #[default]
    Merged,
    Separate,
}

/// State visible to both the session and its pending commands.
struct Shared {
    id: u64,
    label: String,
    granularity: Duration,
    dead: AtomicBool,
    finalized: AtomicBool,
    exited: Arc<AtomicBool>,
    child: ChildHandle,
}

impl Shared {
    fn check_usable(&self) -> Result<()> {
        if self.finalized.load(Ordering::SeqCst) {
            return Err(Error::IncorrectState(format!(
                "session {} to {} has been finalized",
                self.id, self.label
            )));
        }
        if self.dead.load(Ordering::SeqCst) || self.exited.load(Ordering::SeqCst) {
            return Err(Error::IncorrectState(format!(
                "session {} to {} is dead; open a new session",
                self.id, self.label
            )));
        }
        Ok(())
    }

    fn mark_dead(&self, reason: &str) {
        if !self.dead.swap(true, Ordering::SeqCst) {
            warn!(session = self.id, "session to {} is dead: {}", self.label, reason);
        }
    }
}

enum ReadError {
    Timeout,
    Closed,
}

struct Channel {
    pty: PtyProcess,
    output_rx: Receiver<Vec<u8>>,
    /// Line-accumulation buffer, raw terminal text.
    buffer: String,
    /// Tail of a multi-byte character split across reads.
    undecoded: Vec<u8>,
    prompt: PromptMatcher,
    /// Set after a timeout: a late prompt may still be on its way.
    desynced: bool,
}

impl Channel {
    fn write(&mut self, shared: &Shared, data: &str) -> Result<()> {
        self.pty.write_all(data.as_bytes()).map_err(|e| {
            shared.mark_dead(&format!("write failed: {}", e));
            Error::IncorrectState(format!("cannot write to session {}: {}", shared.id, e))
        })
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        self.undecoded.extend_from_slice(bytes);
        match std::str::from_utf8(&self.undecoded) {
            Ok(text) => {
                self.buffer.push_str(text);
                self.undecoded.clear();
            }
            Err(e) => {
                let valid = e.valid_up_to();
                self.buffer
                    .push_str(&String::from_utf8_lossy(&self.undecoded[..valid]));
                if e.error_len().is_some() {
                    // garbage rather than a split character
                    self.buffer
                        .push_str(&String::from_utf8_lossy(&self.undecoded[valid..]));
                    self.undecoded.clear();
                } else {
                    self.undecoded.drain(..valid);
                }
            }
        }
    }

    /// Drops output nobody asked for. Returns the number of bytes dropped.
    fn discard_stale(&mut self) -> usize {
        let mut dropped = self.buffer.len() + self.undecoded.len();
        while let Ok(bytes) = self.output_rx.try_recv() {
            dropped += bytes.len();
        }
        self.buffer.clear();
        self.undecoded.clear();
        dropped
    }

    /// Reads until `check` accepts the buffer, the deadline passes, or the
    /// shell goes away. Each wait on the pty is bounded by the session's
    /// granularity so the deadline and liveness get re-checked regularly.
    async fn read_until<T>(
        &mut self,
        shared: &Shared,
        timeout: Duration,
        mut check: impl FnMut(&str) -> Option<T>,
    ) -> std::result::Result<T, ReadError> {
        let start = Instant::now();
        loop {
            if let Some(found) = check(&self.buffer) {
                return Ok(found);
            }
            if shared.dead.load(Ordering::SeqCst) {
                return Err(ReadError::Closed);
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(ReadError::Timeout);
            }
            let wait = shared.granularity.min(timeout - elapsed);
            match tokio::time::timeout(wait, self.output_rx.recv()).await {
                Ok(Some(bytes)) => {
                    self.push_bytes(&bytes);
                    while let Ok(more) = self.output_rx.try_recv() {
                        self.push_bytes(&more);
                    }
                }
                Ok(None) => {
                    return check(&self.buffer).ok_or(ReadError::Closed);
                }
                Err(_) => {}
            }
        }
    }

    async fn await_prompt(&mut self, shared: &Shared, timeout: Duration) -> Result<CommandOutput> {
        let prompt = self.prompt.clone();
        match self.read_until(shared, timeout, |buf| prompt.find(buf)).await {
            Ok(found) => {
                self.buffer.clear();
                debug!(session = shared.id, exit_code = ?found.exit_code, "< {:?}", found.output);
                Ok(CommandOutput {
                    exit_code: found.exit_code,
                    stdout: found.output,
                    stderr: String::new(),
                })
            }
            Err(ReadError::Timeout) => {
                self.desynced = true;
                Err(Error::Timeout {
                    context: format!("waiting for a prompt on session {}", shared.id),
                    elapsed: timeout,
                    partial: clean_output(&self.buffer),
                })
            }
            Err(ReadError::Closed) => {
                shared.mark_dead("shell exited while a command was in flight");
                Err(Error::IncorrectState(format!(
                    "session {} to {} died while a command was in flight; partial output: {:?}",
                    shared.id,
                    shared.label,
                    tail(&clean_output(&self.buffer), PARTIAL_IN_MESSAGE)
                )))
            }
        }
    }

    /// Re-establishes request/response alignment after a timeout. The
    /// marker comes back either as the output of `echo` (plain shell) or
    /// inside the supervisor's complaint about an unknown command; in both
    /// cases the prompt following it is the current one.
    async fn resync(&mut self, shared: &Shared, timeout: Duration) -> Result<()> {
        let marker = sync_marker();
        self.discard_stale();
        self.write(shared, &format!("echo {}\n", marker))?;
        let prompt = self.prompt.clone();
        let result = self
            .read_until(shared, timeout, |buf| {
                let pos = buf.find(&marker)?;
                prompt.find(&buf[pos..])
            })
            .await;
        match result {
            Ok(_) => {
                self.buffer.clear();
                self.desynced = false;
                debug!(session = shared.id, "resynchronized after timeout");
                Ok(())
            }
            Err(ReadError::Timeout) => Err(Error::Timeout {
                context: format!("resynchronizing session {}", shared.id),
                elapsed: timeout,
                partial: clean_output(&self.buffer),
            }),
            Err(ReadError::Closed) => {
                shared.mark_dead("shell exited during resync");
                Err(Error::IncorrectState(format!("session {} is dead", shared.id)))
            }
        }
    }
}

/// One shell process on a pseudoterminal, used as a command channel.
pub struct ShellSession {
    endpoint: Endpoint,
    params: ConnectParams,
    launcher: Arc<dyn ShellLauncher>,
    config: SessionConfig,
    shared: Arc<Shared>,
    pid: Option<u32>,
    channel: Arc<Mutex<Option<Channel>>>,
}

impl ShellSession {
    /// Opens a session using the default launcher registry.
    pub async fn open(endpoint: Endpoint, params: ConnectParams, config: SessionConfig) -> Result<Self> {
        Self::open_with(&LauncherRegistry::default(), endpoint, params, config).await
    }

    /// Spawns the shell for `endpoint` and installs the session prompt.
    ///
    /// # Errors
    /// `Error::Connection` when the shell cannot be spawned, no pty is
    /// available, the login is rejected, or no prompt shows up within the
    /// connect timeout.
    pub async fn open_with(
        registry: &LauncherRegistry,
        endpoint: Endpoint,
        params: ConnectParams,
        config: SessionConfig,
    ) -> Result<Self> {
        let launcher = registry.resolve(&endpoint.scheme)?;
        let cmd = launcher.shell_command(&endpoint, &params, &config.shell);
        let (pty, output_rx) = PtyProcess::spawn(cmd)?;
        let pid = pty.pid();

        let shared = Arc::new(Shared {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst),
            label: endpoint.to_string(),
            granularity: config.read_granularity(),
            dead: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            exited: pty.exited_flag(),
            child: pty.child(),
        });
        info!(session = shared.id, pid = ?pid, "opening {} session to {}", launcher.transport(), endpoint);

        let channel = Channel {
            pty,
            output_rx,
            buffer: String::new(),
            undecoded: Vec::new(),
            prompt: PromptMatcher::generic()?,
            desynced: false,
        };

        let session = Self {
            endpoint,
            params,
            launcher,
            config,
            shared,
            pid,
            channel: Arc::new(Mutex::new(Some(channel))),
        };

        match session.initialize().await {
            Ok(()) => {
                info!(session = session.shared.id, "session to {} ready", session.endpoint);
                Ok(session)
            }
            Err(e) => {
                session.finalize(true).await;
                Err(e)
            }
        }
    }

    /// Waits for the login prompt, switches the shell to the session prompt
    /// with echo off, and confirms the switch with a sentinel command.
    async fn initialize(&self) -> Result<()> {
        let timeout = self.config.connect_timeout();
        let start = Instant::now();
        let label = self.endpoint.to_string();

        let mut guard = self.channel.lock().await;
        let channel = guard
            .as_mut()
            .ok_or_else(|| Error::Connection(format!("session to {} closed during login", label)))?;

        let login_prompt = channel.prompt.clone();
        let login = channel
            .read_until(&self.shared, timeout, |buf| {
                if let Some(reason) = login_failure(buf) {
                    return Some(Err(reason));
                }
                login_prompt.find(buf).map(|_| Ok(()))
            })
            .await;
        match login {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => {
                return Err(Error::Connection(format!("login to {} failed: {}", label, reason)));
            }
            Err(ReadError::Timeout) => {
                return Err(Error::Connection(format!(
                    "no shell prompt from {} within {:?}; output: {:?}",
                    label,
                    timeout,
                    tail(&clean_output(&channel.buffer), PARTIAL_IN_MESSAGE)
                )));
            }
            Err(ReadError::Closed) => {
                return Err(Error::Connection(format!(
                    "shell for {} exited during login: {}",
                    label,
                    tail(clean_output(&channel.buffer).trim(), PARTIAL_IN_MESSAGE)
                )));
            }
        }
        channel.buffer.clear();

        let marker = sync_marker();
        channel.write(
            &self.shared,
            &format!(
                "stty -echo 2>/dev/null; unset PROMPT_COMMAND 2>/dev/null; PS1='{}'; PS2=''; export PS1 PS2; echo {}; set +H 2>/dev/null\n",
                prompt_ps1(),
                marker
            ),
        )?;

        let remaining = timeout.saturating_sub(start.elapsed());
        let seen = channel
            .read_until(&self.shared, remaining, |buf| line_end_of(buf, &marker))
            .await;
        let end = match seen {
            Ok(end) => end,
            Err(_) => {
                return Err(Error::Connection(format!(
                    "shell on {} did not answer the sentinel command; output: {:?}",
                    label,
                    tail(&clean_output(&channel.buffer), PARTIAL_IN_MESSAGE)
                )));
            }
        };
        channel.buffer.drain(..end);
        channel.prompt = PromptMatcher::strict()?;

        let remaining = timeout.saturating_sub(start.elapsed());
        channel
            .await_prompt(&self.shared, remaining)
            .await
            .map_err(|e| Error::Connection(format!("session prompt on {} not seen: {}", label, e)))?;
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn transport(&self) -> Transport {
        self.launcher.transport()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub(crate) fn connect_params(&self) -> &ConnectParams {
        &self.params
    }

    pub(crate) fn launcher(&self) -> &Arc<dyn ShellLauncher> {
        &self.launcher
    }

    /// pid of the local child (the shell itself, or the ssh client).
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Non-blocking liveness probe.
    pub fn alive(&self) -> bool {
        self.shared.check_usable().is_ok() && child_running(&self.shared.child)
    }

    /// Writes `cmdline` and returns without waiting for its completion.
    ///
    /// The session stays locked until the returned [`PendingCommand`] is
    /// finished with `find_prompt` (or dropped), so the caller can feed
    /// further input, such as a here-document body, in between.
    pub async fn run_async(&self, cmdline: &str) -> Result<PendingCommand> {
        let mut guard = self.channel.clone().lock_owned().await;
        self.shared.check_usable()?;
        {
            let channel = guard
                .as_mut()
                .ok_or_else(|| Error::IncorrectState(format!("session {} is closed", self.shared.id)))?;
            if channel.desynced {
                channel.resync(&self.shared, self.config.command_timeout()).await?;
            }
            let stale = channel.discard_stale();
            if stale > 0 {
                debug!(session = self.shared.id, "discarded {} bytes of unsolicited output", stale);
            }
            debug!(session = self.shared.id, "> {}", cmdline);
            channel.write(&self.shared, &format!("{}\n", cmdline))?;
        }
        Ok(PendingCommand {
            guard,
            shared: self.shared.clone(),
            default_timeout: self.config.command_timeout(),
        })
    }

    /// Runs `cmdline` and waits for the prompt. stdout and stderr arrive
    /// merged in `stdout`.
    pub async fn run_sync(&self, cmdline: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
        self.run_sync_with(cmdline, IoMode::Merged, timeout).await
    }

    pub async fn run_sync_with(
        &self,
        cmdline: &str,
        mode: IoMode,
        timeout: Option<Duration>,
    ) -> Result<CommandOutput> {
        match mode {
            IoMode::Merged => self.run_async(cmdline).await?.find_prompt(timeout).await,
            IoMode::Separate => {
                let errfile = "\"${TMPDIR:-/tmp}/.rusty-jobs-stderr.$$\"";
                let mut pending = self
                    .run_async(&format!("{{ {}\n}} 2>{}", cmdline, errfile))
                    .await?;
                let mut output = pending.await_output(timeout).await?;
                pending.send(&format!("cat {f} 2>/dev/null; rm -f {f}\n", f = errfile))?;
                let stderr = pending.await_output(timeout).await?;
                output.stderr = stderr.stdout;
                Ok(output)
            }
        }
    }

    /// Replaces the pattern used by subsequent completion checks.
    pub async fn set_prompt(&self, pattern: &str) -> Result<()> {
        let matcher = PromptMatcher::new(pattern)?;
        let mut guard = self.channel.lock().await;
        let channel = guard
            .as_mut()
            .ok_or_else(|| Error::IncorrectState(format!("session {} is closed", self.shared.id)))?;
        debug!(session = self.shared.id, "prompt pattern now {}", matcher.as_str());
        channel.prompt = matcher;
        Ok(())
    }

    /// Tears the session down. Safe to call any number of times.
    ///
    /// Without `kill` the shell is first asked to `exit` and given a short
    /// grace period.
    pub async fn finalize(&self, kill: bool) {
        if self.shared.finalized.swap(true, Ordering::SeqCst) {
            return;
        }

        if !kill && child_running(&self.shared.child) {
            if let Ok(mut guard) = tokio::time::timeout(Duration::from_secs(1), self.channel.lock()).await {
                if let Some(channel) = guard.as_mut() {
                    if let Err(e) = channel.pty.write_all(b"exit\n") {
                        debug!(session = self.shared.id, "polite exit failed: {}", e);
                    }
                }
            }
            let deadline = Instant::now() + Duration::from_millis(500);
            while child_running(&self.shared.child) && Instant::now() < deadline {
                tokio::time::sleep(self.shared.granularity).await;
            }
        }

        let child = self.shared.child.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || kill_child(&child)).await {
            warn!(session = self.shared.id, "kill task failed: {}", e);
        }
        self.shared.dead.store(true, Ordering::SeqCst);

        // an outstanding PendingCommand keeps its channel; it is dropped with it
        if let Ok(mut guard) = self.channel.try_lock() {
            guard.take();
        }
        info!(session = self.shared.id, "session to {} finalized", self.endpoint);
    }
}

impl Drop for ShellSession {
    fn drop(&mut self) {
        if !self.shared.finalized.swap(true, Ordering::SeqCst) {
            kill_child(&self.shared.child);
        }
    }
}

/// A command that has been written but whose prompt has not been seen yet.
/// Holds the session lock.
pub struct PendingCommand {
    guard: OwnedMutexGuard<Option<Channel>>,
    shared: Arc<Shared>,
    default_timeout: Duration,
}

impl PendingCommand {
    /// Writes raw text, no newline added.
    pub fn send(&mut self, text: &str) -> Result<()> {
        let shared = self.shared.clone();
        let channel = self
            .guard
            .as_mut()
            .ok_or_else(|| Error::IncorrectState(format!("session {} is closed", shared.id)))?;
        channel.write(&shared, text)
    }

    /// Waits for the prompt that completes this command and releases the
    /// session.
    ///
    /// # Errors
    /// `Error::Timeout` (with partial output) when no prompt arrives in
    /// time; the remote command keeps running. `Error::IncorrectState` when
    /// the shell died.
    pub async fn find_prompt(mut self, timeout: Option<Duration>) -> Result<CommandOutput> {
        self.await_output(timeout).await
    }

    async fn await_output(&mut self, timeout: Option<Duration>) -> Result<CommandOutput> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let shared = self.shared.clone();
        let channel = self
            .guard
            .as_mut()
            .ok_or_else(|| Error::IncorrectState(format!("session {} is closed", shared.id)))?;
        channel.await_prompt(&shared, timeout).await
    }
}

fn sync_marker() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    format!(
        "RJSYNC-{}-{}-{}",
        std::process::id(),
        NEXT_MARKER.fetch_add(1, Ordering::SeqCst),
        nanos
    )
}

fn login_failure(buffer: &str) -> Option<String> {
    let text = strip_ansi_codes(buffer);
    LOGIN_FAILURES
        .iter()
        .find(|needle| text.contains(*needle))
        .map(|needle| {
            text.lines()
                .find(|line| line.contains(*needle))
                .unwrap_or(needle)
                .trim()
                .to_string()
        })
}

/// Byte offset just past the first complete line equal to `marker`.
fn line_end_of(buffer: &str, marker: &str) -> Option<usize> {
    let mut offset = 0;
    for line in buffer.split_inclusive('\n') {
        let end = offset + line.len();
        if line.ends_with('\n') && strip_ansi_codes(line).trim() == marker {
            return Some(end);
        }
        offset = end;
    }
    None
}

fn tail(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
