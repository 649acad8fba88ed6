//! Request encoding and response parsing for the supervisor's line protocol.
//!
//! A request is one line, `COMMAND arg ...`. The supervisor answers with
//! `OK` or `ERROR`, one payload line, and a prompt whose status is 0 for
//! `OK` and 1 for `ERROR`. Error payloads start with a kind token.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::JobState;
use crate::shell::CommandOutput;
use crate::utils::quote::join;

/// Longest request line the remote terminal accepts in canonical mode,
/// with some headroom.
pub const MAX_REQUEST_LINE: usize = 4000;

/// Supervisor-assigned job id: the pid of the job's monitor process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::BadParameter(format!("'{}' is not a job id", s)));
        }
        Ok(JobId(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Start a program as a new job. The supervisor execs the argv in
    /// place, so the job's pid is the program's pid.
    Run(Vec<String>),
    State(JobId),
    /// Bulk state query; unknown ids come back as `None`.
    States(Vec<JobId>),
    /// Exit status of a finished job.
    Result(JobId),
    Suspend(JobId),
    Resume(JobId),
    Cancel(JobId),
    Stdin(JobId, Vec<u8>),
    Stdout(JobId),
    Stderr(JobId),
    List,
    Purge(Option<JobId>),
    Quit,
    Noop,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Run(_) => "RUN",
            Request::State(_) => "STATE",
            Request::States(_) => "STATES",
            Request::Result(_) => "RESULT",
            Request::Suspend(_) => "SUSPEND",
            Request::Resume(_) => "RESUME",
            Request::Cancel(_) => "CANCEL",
            Request::Stdin(..) => "STDIN",
            Request::Stdout(_) => "STDOUT",
            Request::Stderr(_) => "STDERR",
            Request::List => "LIST",
            Request::Purge(_) => "PURGE",
            Request::Quit => "QUIT",
            Request::Noop => "NOOP",
        }
    }

    /// The request line, without the trailing newline.
    pub fn encode(&self) -> Result<String> {
        let line = match self {
            Request::Run(argv) => {
                let program = argv.first().map(|p| p.trim()).unwrap_or_default();
                if program.is_empty() {
                    return Err(Error::BadParameter("RUN needs a program".to_string()));
                }
                if argv.iter().any(|word| word.contains(['\n', '\r'])) {
                    return Err(Error::BadParameter(
                        "RUN arguments must not contain line breaks".to_string(),
                    ));
                }
                format!("RUN {}", join(argv))
            }
            Request::State(id)
            | Request::Result(id)
            | Request::Suspend(id)
            | Request::Resume(id)
            | Request::Cancel(id)
            | Request::Stdout(id)
            | Request::Stderr(id) => format!("{} {}", self.name(), id),
            Request::States(ids) => {
                let mut line = self.name().to_string();
                for id in ids {
                    line.push(' ');
                    line.push_str(id.as_str());
                }
                line
            }
            Request::Stdin(id, data) => format!("STDIN {} {}", id, BASE64.encode(data)),
            Request::Purge(Some(id)) => format!("PURGE {}", id),
            Request::Purge(None) | Request::List | Request::Quit | Request::Noop => {
                self.name().to_string()
            }
        };
        if line.len() > MAX_REQUEST_LINE {
            return Err(Error::BadParameter(format!(
                "{} request of {} bytes exceeds the {} byte line limit",
                self.name(),
                line.len(),
                MAX_REQUEST_LINE
            )));
        }
        Ok(line)
    }
}

/// Kind token leading an `ERROR` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidJob,
    IncorrectState,
    BadCommand,
    Io,
    Unknown,
}

impl ErrorKind {
    fn from_token(token: &str) -> Self {
        match token {
            "INVALID_JOB" => ErrorKind::InvalidJob,
            "INCORRECT_STATE" => ErrorKind::IncorrectState,
            "BAD_COMMAND" => ErrorKind::BadCommand,
            "IO" => ErrorKind::Io,
            _ => ErrorKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(String),
    Error { kind: ErrorKind, message: String },
}

impl Response {
    /// Parses the output of one request, as delimited by the prompt.
    pub fn parse(output: &CommandOutput) -> Result<Self> {
        let raw = &output.stdout;
        let mut lines = raw.lines().map(|l| l.trim_end_matches('\r')).skip_while(|l| l.trim().is_empty());

        let status = lines
            .next()
            .ok_or_else(|| Error::protocol("empty response", raw.as_str()))?
            .trim();
        let payload = lines.next().unwrap_or("").to_string();
        if lines.any(|l| !l.trim().is_empty()) {
            return Err(Error::protocol("unexpected lines after payload", raw.as_str()));
        }

        let response = match status {
            "OK" => Response::Ok(payload),
            "ERROR" => {
                let (token, message) = payload.split_once(' ').unwrap_or((payload.as_str(), ""));
                match ErrorKind::from_token(token) {
                    ErrorKind::Unknown => Response::Error {
                        kind: ErrorKind::Unknown,
                        message: payload.clone(),
                    },
                    kind => Response::Error {
                        kind,
                        message: message.to_string(),
                    },
                }
            }
            other => {
                return Err(Error::protocol(
                    format!("expected OK or ERROR, got '{}'", other),
                    raw.as_str(),
                ));
            }
        };

        let expected = match response {
            Response::Ok(_) => 0,
            Response::Error { .. } => 1,
        };
        if output.exit_code != Some(expected) {
            return Err(Error::protocol(
                format!(
                    "{} response with prompt status {:?}",
                    status, output.exit_code
                ),
                raw.as_str(),
            ));
        }
        Ok(response)
    }

    /// Payload of an `OK`, or the error an `ERROR` maps to.
    pub fn into_result(self) -> Result<String> {
        match self {
            Response::Ok(payload) => Ok(payload),
            Response::Error { kind, message } => Err(match kind {
                ErrorKind::InvalidJob => Error::InvalidJob(message),
                ErrorKind::IncorrectState => Error::IncorrectState(message),
                ErrorKind::Io => Error::RemoteIo(message),
                ErrorKind::BadCommand => Error::protocol(format!("supervisor rejected request: {}", message), ""),
                ErrorKind::Unknown => Error::protocol(format!("supervisor error: {}", message), ""),
            }),
        }
    }
}

/// `RUN` payload.
pub fn parse_job_id(payload: &str) -> Result<JobId> {
    payload
        .parse()
        .map_err(|_| Error::protocol(format!("RUN returned '{}' instead of a job id", payload), payload))
}

/// `LIST` payload: space-separated ids.
pub fn parse_id_list(payload: &str) -> Result<Vec<JobId>> {
    payload.split_whitespace().map(parse_job_id).collect()
}

/// `STATES` payload: `id:STATE` pairs, `UNKNOWN` for missing jobs.
pub fn parse_states(payload: &str) -> Result<Vec<(JobId, Option<JobState>)>> {
    payload
        .split_whitespace()
        .map(|pair| -> Result<(JobId, Option<JobState>)> {
            let (id, state) = pair
                .split_once(':')
                .ok_or_else(|| Error::protocol(format!("malformed state pair '{}'", pair), payload))?;
            let state = match state {
                "UNKNOWN" => None,
                token => Some(token.parse::<JobState>()?),
            };
            Ok((parse_job_id(id)?, state))
        })
        .collect()
}

/// `RESULT` payload: the exit status, empty while the job runs.
pub fn parse_exit_code(payload: &str) -> Result<Option<i32>> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(None);
    }
    payload
        .parse::<i32>()
        .map(Some)
        .map_err(|_| Error::protocol(format!("bad exit status '{}'", payload), payload))
}

/// `STDOUT`/`STDERR` payload.
pub fn decode_output(payload: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(payload.trim())
        .map_err(|e| Error::protocol(format!("bad base64 in output: {}", e), payload))
}
