//! Secret redaction for anything that reaches a log line (spec §7).
//!
//! Subprocess stdout/stderr, argv echoed for debugging, and build logs all
//! pass through here before they're logged or attached to an API error body.

const REDACTED: &str = "***REDACTED***";

/// Replaces every occurrence of each non-empty secret in `text` with a fixed
/// placeholder. Order-independent; a secret that is a substring of another
/// is still fully redacted since each pass operates on the original text.
pub fn redact_text(text: &str, secrets: &[&str]) -> String {
    let mut out = text.to_string();
    for secret in secrets {
        if secret.is_empty() {
            continue;
        }
        out = out.replace(*secret, REDACTED);
    }
    out
}

/// Redacts an argument vector for safe logging — used when echoing the
/// exact command line a subprocess was invoked with.
pub fn redact_argv(argv: &[String], secrets: &[&str]) -> String {
    argv.iter()
        .map(|a| redact_text(a, secrets))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Truncates `text` to at most `max_len` bytes at a UTF-8 boundary, appending
/// a marker when truncation occurred. Used to bound log/diagnostic sizes.
pub fn truncate_text(text: &str, max_len: usize) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redacts_every_occurrence() {
        let out = redact_text("password=hunter2 and again hunter2", &["hunter2"]);
        assert_eq!(out, "password=***REDACTED*** and again ***REDACTED***");
    }

    #[test]
    fn empty_secret_is_ignored() {
        let out = redact_text("hello world", &[""]);
        assert_eq!(out, "hello world");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let out = truncate_text("hello world", 5);
        assert_eq!(out, "hello... (truncated)");
        assert_eq!(truncate_text("short", 100), "short");
    }
}
