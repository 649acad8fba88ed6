//! The supervisor's shell programs, embedded at build time, and the shell
//! commands that install and start them.

use crate::shell::PROMPT_TAG;
use crate::utils::quote::quote_path;

const WRAPPER_TEMPLATE: &str = include_str!("wrapper.sh");
const MONITOR_TEMPLATE: &str = include_str!("monitor.sh");

const TAG_PLACEHOLDER: &str = "__PROMPT_TAG__";
const SCRIPT_DELIMITER: &str = "RJ_SCRIPT_EOF";

pub const WRAPPER_NAME: &str = "wrapper.sh";
pub const MONITOR_NAME: &str = "monitor.sh";

/// A script ready for upload.
#[derive(Debug, Clone)]
pub struct Script {
    pub name: &'static str,
    pub body: String,
}

pub fn wrapper() -> Script {
    Script {
        name: WRAPPER_NAME,
        body: WRAPPER_TEMPLATE.replace(TAG_PLACEHOLDER, PROMPT_TAG),
    }
}

pub fn monitor() -> Script {
    Script {
        name: MONITOR_NAME,
        body: MONITOR_TEMPLATE.replace(TAG_PLACEHOLDER, PROMPT_TAG),
    }
}

impl Script {
    /// Command line opening a here-document that writes the script into
    /// `base_dir`. The body has to follow through [`Script::heredoc_body`].
    pub fn upload_command(&self, base_dir: &str) -> String {
        format!(
            "cat > {}/{} <<'{}'",
            quote_path(base_dir),
            self.name,
            SCRIPT_DELIMITER
        )
    }

    pub fn heredoc_body(&self) -> String {
        let mut body = self.body.clone();
        if !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str(SCRIPT_DELIMITER);
        body.push('\n');
        body
    }
}

pub fn mkdir_command(base_dir: &str) -> String {
    format!("mkdir -p {}", quote_path(base_dir))
}

/// Replaces the login shell with the supervisor. Everything sent afterwards
/// is read by the supervisor's command loop.
pub fn exec_command(base_dir: &str, idle_timeout_secs: u64) -> String {
    let base = quote_path(base_dir);
    format!(
        "exec /bin/sh {}/{} {} {}",
        base,
        WRAPPER_NAME,
        base,
        idle_timeout_secs.max(1)
    )
}
