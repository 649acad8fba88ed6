use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Lifecycle of a job: `New -> Running -> {Done, Failed, Canceled}`, with
/// `Running <-> Suspended` in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    New,
    Running,
    Suspended,
    Done,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_final(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Canceled)
    }

    /// Token used in the supervisor's `state` file.
    pub fn as_token(self) -> &'static str {
        match self {
            JobState::New => "NEW",
            JobState::Running => "RUNNING",
            JobState::Suspended => "SUSPENDED",
            JobState::Done => "DONE",
            JobState::Failed => "FAILED",
            JobState::Canceled => "CANCELED",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_token())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "NEW" => Ok(JobState::New),
            "RUNNING" => Ok(JobState::Running),
            "SUSPENDED" => Ok(JobState::Suspended),
            "DONE" => Ok(JobState::Done),
            "FAILED" => Ok(JobState::Failed),
            "CANCELED" => Ok(JobState::Canceled),
            other => Err(Error::protocol(format!("unknown job state '{}'", other), s)),
        }
    }
}
