//! What to run, and how it becomes the argv of a `RUN` request.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::quote::{is_valid_name, quote, quote_path};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDescription {
    pub executable: String,
    pub arguments: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub working_directory: Option<String>,
    /// Redirections, relative to the working directory. Without them the
    /// job reads and writes the `in`/`out`/`err` files of its job directory.
    pub input: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl JobDescription {
    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            ..Default::default()
        }
    }

    /// Splits `line` on whitespace: first word is the executable. No
    /// quoting rules apply.
    pub fn from_words(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let executable = words
            .next()
            .ok_or_else(|| Error::BadParameter("empty command line".to_string()))?;
        Ok(Self {
            executable: executable.to_string(),
            arguments: words.map(str::to_string).collect(),
            ..Default::default()
        })
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.arguments.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn input(mut self, path: impl Into<String>) -> Self {
        self.input = Some(path.into());
        self
    }

    pub fn output(mut self, path: impl Into<String>) -> Self {
        self.output = Some(path.into());
        self
    }

    pub fn error(mut self, path: impl Into<String>) -> Self {
        self.error = Some(path.into());
        self
    }

    /// The argv sent with `RUN`. A bare program goes as is. A working
    /// directory, environment or redirections need a shell, so the
    /// flattened line runs under `/bin/sh -c`; it ends in `exec`, and the
    /// program still replaces every shell in between.
    pub fn to_argv(&self) -> Result<Vec<String>> {
        let line = self.to_command_line()?;
        let bare = self.working_directory.is_none()
            && self.environment.is_empty()
            && self.input.is_none()
            && self.output.is_none()
            && self.error.is_none();
        if bare {
            return Ok(std::iter::once(self.executable.clone())
                .chain(self.arguments.iter().cloned())
                .collect());
        }
        Ok(vec!["/bin/sh".to_string(), "-c".to_string(), line])
    }

    /// Flattens the description into one shell line.
    ///
    /// The program is started with `exec`, so the pid the supervisor
    /// records is the program itself.
    ///
    /// # Errors
    /// `Error::BadParameter` for an empty executable, an invalid
    /// environment variable name, or a newline in any field.
    pub fn to_command_line(&self) -> Result<String> {
        if self.executable.trim().is_empty() {
            return Err(Error::BadParameter("job description has no executable".to_string()));
        }

        let fields = std::iter::once(&self.executable)
            .chain(&self.arguments)
            .chain(self.environment.keys())
            .chain(self.environment.values())
            .chain(&self.working_directory)
            .chain(&self.input)
            .chain(&self.output)
            .chain(&self.error);
        for field in fields {
            if field.contains(['\n', '\r']) {
                return Err(Error::BadParameter(format!(
                    "job description field {:?} contains a line break",
                    field
                )));
            }
        }

        let mut parts = Vec::new();
        if let Some(dir) = &self.working_directory {
            parts.push(format!("cd {} || exit 1", quote_path(dir)));
        }
        for (key, value) in &self.environment {
            if !is_valid_name(key) {
                return Err(Error::BadParameter(format!(
                    "'{}' is not a valid environment variable name",
                    key
                )));
            }
            parts.push(format!("{}={}; export {}", key, quote(value), key));
        }

        let mut exec = format!("exec {}", quote(&self.executable));
        for arg in &self.arguments {
            exec.push(' ');
            exec.push_str(&quote(arg));
        }
        if let Some(path) = &self.input {
            exec.push_str(&format!(" < {}", quote_path(path)));
        }
        if let Some(path) = &self.output {
            exec.push_str(&format!(" > {}", quote_path(path)));
        }
        if let Some(path) = &self.error {
            exec.push_str(&format!(" 2> {}", quote_path(path)));
        }
        parts.push(exec);

        Ok(parts.join("; "))
    }
}
