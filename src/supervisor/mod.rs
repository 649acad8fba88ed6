//! The remote job supervisor: a POSIX shell program bootstrapped through a
//! shell session, and its client.

pub mod protocol;
pub mod script;
mod service;

pub use protocol::{JobId, Request, Response};
pub use service::JobService;
