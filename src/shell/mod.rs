//! Shell sessions over a pseudoterminal.
//!
//! This module handles spawning a local or remote shell on a pty, driving it
//! one command at a time by prompt detection, and staging files through it.

pub mod prompt;
mod pty;
mod session;
mod staging;
pub mod transport;

pub use prompt::{PromptMatcher, PROMPT_TAG};
pub use session::{CommandOutput, IoMode, PendingCommand, ShellSession};
pub use transport::{ConnectParams, CopyPath, Endpoint, ForkLauncher, LauncherRegistry, ShellLauncher, SshLauncher, Transport};
