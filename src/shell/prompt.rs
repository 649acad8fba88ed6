//! Prompt detection.
//!
//! A command is complete once the last (unterminated) line of the output
//! matches the active prompt pattern. The pattern's first capture group, if
//! any, carries the exit status of the command.

use regex::Regex;

use crate::error::{Error, Result};

/// Tag of the prompt installed in every session. The remote supervisor
/// prints the same marker after each response.
pub const PROMPT_TAG: &str = "RJPROMPT";

/// Matches whatever a freshly started interactive shell prints.
pub const GENERIC_PROMPT: &str = r"[\$#%>\]]\s*$";

/// Value for `PS1`; the shell expands `$?` each time it prints the prompt.
pub fn prompt_ps1() -> String {
    format!("{}-$?->", PROMPT_TAG)
}

/// Pattern matching [`prompt_ps1`] and capturing the exit status.
pub fn prompt_pattern() -> String {
    format!(r"{}-(\d+)->\s*$", PROMPT_TAG)
}

#[derive(Debug, Clone)]
pub struct PromptMatcher {
    regex: Regex,
}

/// A completed command found in the accumulation buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMatch {
    /// Cleaned output preceding the prompt.
    pub output: String,
    pub exit_code: Option<i32>,
}

impl PromptMatcher {
    pub fn new(pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| Error::BadParameter(format!("invalid prompt pattern '{}': {}", pattern, e)))?;
        Ok(Self { regex })
    }

    pub fn generic() -> Result<Self> {
        Self::new(GENERIC_PROMPT)
    }

    pub fn strict() -> Result<Self> {
        Self::new(&prompt_pattern())
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    /// Looks for the prompt on the last line of `buffer`.
    pub fn find(&self, buffer: &str) -> Option<PromptMatch> {
        let line_start = buffer.rfind('\n').map(|i| i + 1).unwrap_or(0);
        let tail = clean_output(&buffer[line_start..]);
        let caps = self.regex.captures(&tail)?;
        let exit_code = caps.get(1).and_then(|m| m.as_str().parse::<i32>().ok());
        Some(PromptMatch {
            output: clean_output(&buffer[..line_start]),
            exit_code,
        })
    }
}

/// Strip terminal noise: ANSI escapes and carriage returns.
pub fn clean_output(text: &str) -> String {
    strip_ansi_codes(text).replace("\r\n", "\n").replace('\r', "")
}

/// Removes color codes, cursor movements, and other terminal control sequences.
pub fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // Skip until the CSI final byte
                while let Some(&next_ch) = chars.peek() {
                    chars.next();
                    if next_ch.is_ascii_alphabetic() || next_ch == '~' {
                        break;
                    }
                }
            } else if chars.peek() == Some(&']') {
                chars.next();
                // OSC runs until BEL or ST
                while let Some(&next_ch) = chars.peek() {
                    chars.next();
                    if next_ch == '\x07' {
                        break;
                    }
                    if next_ch == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            } else {
                // two-byte escape such as ESC =
                chars.next();
            }
        } else if ch == '\x07' {
            continue;
        } else {
            result.push(ch);
        }
    }

    result
}
