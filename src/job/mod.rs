//! Client-side job objects: the per-job state mirror and the bulk
//! container.

mod backoff;
mod container;
mod description;
mod handle;
mod state;

pub use backoff::Backoff;
pub use container::{JobContainer, WaitMode};
pub use description::JobDescription;
pub use handle::{Job, JobInfo};
pub use state::JobState;
