//! Utility modules for common functionality.
//!
//! Logging configuration for the binary and shell quoting used whenever a
//! remote command line is assembled.

pub mod logger;
pub mod quote;
