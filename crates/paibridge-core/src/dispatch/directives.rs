//! Out-of-band directives embedded in assistant output.
//!
//! `SEND: /path` lines ask the bridge to deliver a file to the chat;
//! `VOICE: text` (or the `🗣️ Name:` form) asks for a spoken reply. Directive
//! lines are stripped from the text shown to the user, and SEND paths pass a
//! path-safety check before anything leaves the machine.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;

use crate::config::resolve_home;

static SEND_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^SEND:\s*(.+)$").unwrap());
static VOICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:VOICE|\u{1f5e3}\u{fe0f}\s+\w+)\s*:\s*(.+)$").unwrap()
});

/// Roots a SEND path must live under. Matching is per path component, so
/// `/mnt/pai-data/project-other` does not slip through as a prefix of
/// `/mnt/pai-data/projects`.
const ALLOWED_ROOTS: &[&str] = &[
    "/mnt/pai-data/projects",
    "/mnt/pai-data/memory",
    "/tmp",
    "/home/pai",
];

/// Substrings that block a SEND path outright, wherever they appear.
const DENIED_SUBSTRINGS: &[&str] = &[
    "secrets",
    ".ssh",
    ".env",
    "credentials",
    "token",
    ".key",
    ".pem",
];

#[derive(Debug, Default)]
pub struct Directives {
    /// The response with directive lines removed.
    pub text: String,
    /// SEND paths that survived normalization and the safety check,
    /// deduplicated in first-seen order.
    pub files: Vec<PathBuf>,
    /// The first recognized voice utterance, if any.
    pub voice: Option<String>,
}

pub fn extract(text: &str) -> Directives {
    let mut directives = Directives::default();
    let mut kept: Vec<&str> = Vec::new();

    for line in text.lines() {
        if let Some(captures) = SEND_RE.captures(line) {
            // the line is stripped even when the path is rejected
            if let Some(path) = sanitize_send_path(captures[1].trim())
                && !directives.files.contains(&path)
            {
                directives.files.push(path);
            }
            continue;
        }
        if directives.voice.is_none()
            && let Some(captures) = VOICE_RE.captures(line)
        {
            directives.voice = Some(captures[1].trim().to_string());
            continue;
        }
        kept.push(line);
    }

    directives.text = kept.join("\n");
    directives
}

/// Normalize a SEND path and apply the safety predicate. Returns `None` —
/// and the path is silently dropped — when the path falls outside the
/// allowed roots or contains a denied substring.
fn sanitize_send_path(raw: &str) -> Option<PathBuf> {
    let expanded = resolve_home(raw);
    let absolute = std::path::absolute(&expanded).ok()?;

    if !ALLOWED_ROOTS
        .iter()
        .any(|root| absolute.starts_with(root))
    {
        return None;
    }
    let rendered = absolute.to_string_lossy();
    if DENIED_SUBSTRINGS.iter().any(|d| rendered.contains(d)) {
        return None;
    }
    Some(absolute)
}
