//! POSIX shell quoting.
//!
//! Everything that ends up on a remote command line goes through here, so
//! arguments never get word-split or expanded by the remote shell.

/// Quote `s` so a POSIX shell reads it back as exactly one word.
pub fn quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(is_safe_char) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for ch in s.chars() {
        if ch == '\'' {
            // close, emit an escaped quote, reopen
            out.push_str("'\\''");
        } else {
            out.push(ch);
        }
    }
    out.push('\'');
    out
}

/// Quote a remote path, leaving a leading `~/` outside the quotes so the
/// remote shell still expands it.
pub fn quote_path(path: &str) -> String {
    match path.strip_prefix("~/") {
        Some(rest) if rest.is_empty() => "~".to_string(),
        Some(rest) => format!("~/{}", quote(rest)),
        None if path == "~" => "~".to_string(),
        None => quote(path),
    }
}

/// Join words into a single command line, quoting each one.
pub fn join<I, S>(words: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    words
        .into_iter()
        .map(|w| quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Valid shell variable name: `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_safe_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, '/' | '.' | '_' | '-' | '+' | ',' | ':' | '@' | '%' | '=')
}
