//! RustyJobs - remote job supervision over an interactive login shell
//!
//! This library provides:
//! - Shell sessions: a local or ssh shell on a pseudoterminal, driven as a
//!   serialized command/response channel by prompt detection
//! - A POSIX sh job supervisor that is uploaded through such a session and
//!   keeps jobs running after the session goes away
//! - Job mirrors and containers that track remote jobs from the client
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use rusty_jobs::{Config, ConnectParams, Job, JobDescription, JobService};
//!
//! #[tokio::main]
//! async fn main() -> rusty_jobs::Result<()> {
//!     let service = JobService::connect(
//!         "ssh://alice@cluster.example.org",
//!         ConnectParams::default(),
//!         Config::default(),
//!     )
//!     .await?;
//!
//!     let job = Job::new(&service, JobDescription::new("/bin/sleep").arg("2"));
//!     job.run().await?;
//!     let state = job.wait(Some(Duration::from_secs(30))).await?;
//!     println!("{} finished as {} ({:?})", job.id().unwrap(), state, job.exit_code());
//!
//!     service.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod shell;
pub mod supervisor;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
pub use job::{Job, JobContainer, JobDescription, JobInfo, JobState, WaitMode};
pub use shell::{CommandOutput, ConnectParams, Endpoint, IoMode, ShellSession};
pub use supervisor::{JobId, JobService};
