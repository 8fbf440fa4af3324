//! Persistent memory: per-session conversation logs, claude-generated
//! session summaries, per-day append notes, and the retention sweeper.
//!
//! Everything in here is best-effort — I/O failures are logged and never
//! surfaced to callers. The on-disk tree under `base_path`:
//!
//! ```text
//! conversations/{user}/{session}.jsonl
//! summaries/{user}/{YYYY-MM-DD}-{sid8}.md
//! daily/{user}/{YYYY-MM-DD}.md
//! ```

use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::claude;
use crate::config::MemoryConfig;
use crate::session::short_id;
use crate::util::{now_millis, truncate_text};

/// Wall-clock budget for a summarization subprocess.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2 * 60);

/// Per-turn text cap when rendering a conversation log for summarization.
const RENDER_TURN_LIMIT: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => f.write_str("user"),
            Role::Assistant => f.write_str("assistant"),
        }
    }
}

/// One persisted conversation turn, serialized as a single JSONL record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub ts: i64,
    pub role: Role,
    pub text: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

pub struct MemoryStore {
    base_path: PathBuf,
    enabled: bool,
    retention_days: i64,
    /// Overrides claude binary resolution; used by tests.
    claude_path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new(memory: &MemoryConfig) -> Self {
        Self {
            base_path: PathBuf::from(&memory.base_path),
            enabled: memory.enabled,
            retention_days: memory.retention_days,
            claude_path: None,
        }
    }

    /// Force a specific claude binary instead of resolving `$CLAUDE_PATH`.
    pub fn with_claude_binary(mut self, path: PathBuf) -> Self {
        self.claude_path = Some(path);
        self
    }

    /// Append one turn to the session's JSONL log. Empty text is a no-op.
    pub fn log_turn(&self, user_id: &str, session_id: &str, role: Role, text: &str) {
        if !self.enabled || text.is_empty() {
            return;
        }

        let dir = self.base_path.join("conversations").join(user_id);
        if let Err(e) = create_dir_with_mode(&dir, 0o755) {
            warn!(dir = %dir.display(), error = %e, "failed to create conversation dir");
            return;
        }

        let turn = ConversationTurn {
            ts: now_millis(),
            role,
            text: text.to_string(),
            session_id: session_id.to_string(),
        };
        let record = match serde_json::to_string(&turn) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to encode conversation turn");
                return;
            }
        };

        let path = dir.join(format!("{session_id}.jsonl"));
        if let Err(e) = append_line(&path, &record, 0o644) {
            warn!(path = %path.display(), error = %e, "failed to append conversation turn");
        }
    }

    /// Read a session's log and render it as `[role]: text` paragraphs for
    /// the summarization prompt. Long turns are truncated.
    pub fn read_conversation_log(&self, user_id: &str, session_id: &str) -> std::io::Result<String> {
        let path = self
            .base_path
            .join("conversations")
            .join(user_id)
            .join(format!("{session_id}.jsonl"));
        let data = std::fs::read_to_string(&path)?;

        let mut rendered = String::new();
        for line in data.lines() {
            let Ok(turn) = serde_json::from_str::<ConversationTurn>(line) else {
                continue;
            };
            let text = truncate_text(&turn.text, RENDER_TURN_LIMIT, "... [truncated]");
            rendered.push_str(&format!("[{}]: {}\n\n", turn.role, text));
        }
        Ok(rendered)
    }

    /// Summarize a completed session into a durable markdown file.
    ///
    /// Spawns claude over the rendered conversation log; when summarization
    /// fails or returns nothing, a raw fallback extracted from the log tail
    /// is written instead, so session context is never silently lost.
    pub async fn flush_session(&self, user_id: &str, session_id: &str, model: &str) {
        if !self.enabled {
            return;
        }

        debug!(session = short_id(session_id), user = user_id, "flushing session");

        let conversation_log = match self.read_conversation_log(user_id, session_id) {
            Ok(log) if !log.trim().is_empty() => log,
            Ok(_) => {
                debug!(session = short_id(session_id), "empty conversation log, skipping flush");
                return;
            }
            Err(e) => {
                debug!(session = short_id(session_id), error = %e, "no conversation log to flush");
                return;
            }
        };

        let mut summary = match self.summarize(&conversation_log, model).await {
            Some(s) => s,
            None => {
                warn!(
                    session = short_id(session_id),
                    "summarization failed, writing raw fallback"
                );
                raw_fallback_summary(&conversation_log)
            }
        };
        if summary.is_empty() {
            return;
        }
        summary.push('\n');

        let dir = self.base_path.join("summaries").join(user_id);
        if let Err(e) = create_dir_with_mode(&dir, 0o755) {
            warn!(error = %e, "failed to create summaries dir");
            return;
        }

        let date = Local::now().format("%Y-%m-%d");
        let path = dir.join(format!("{date}-{}.md", short_id(session_id)));
        if let Err(e) = write_file_with_mode(&path, summary.as_bytes(), 0o644) {
            warn!(path = %path.display(), error = %e, "failed to write summary");
            return;
        }
        info!(session = short_id(session_id), path = %path.display(), "session flushed");

        if let Some(bullet) = first_summary_bullet(&summary) {
            self.append_daily_note(user_id, bullet);
        }
    }

    async fn summarize(&self, conversation_log: &str, model: &str) -> Option<String> {
        let prompt = format!("{SUMMARY_PROMPT}{conversation_log}");
        let binary = match &self.claude_path {
            Some(path) => path.clone(),
            None => claude::resolve_binary(),
        };

        let mut command = tokio::process::Command::new(&binary);
        command
            .arg("-p")
            .arg(&prompt)
            .arg("--model")
            .arg(model)
            .arg("--output-format")
            .arg("text")
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(FLUSH_TIMEOUT, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(binary = %binary.display(), error = %e, "failed to spawn summarizer");
                return None;
            }
            Err(_) => {
                warn!("summarizer timed out");
                return None;
            }
        };

        if !output.status.success() {
            return None;
        }
        let summary = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if summary.is_empty() { None } else { Some(summary) }
    }

    /// Most recent session summaries rendered as a context block for
    /// injection into a fresh session. Empty when there is no history.
    pub fn recent_context(&self, user_id: &str, max_summaries: usize) -> String {
        if !self.enabled {
            return String::new();
        }

        let dir = self.base_path.join("summaries").join(user_id);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return String::new(); // no summaries yet, normal for first-time users
        };

        let mut names: Vec<String> = entries
            .flatten()
            .filter(|e| e.path().is_file())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.ends_with(".md"))
            .collect();
        if names.is_empty() {
            return String::new();
        }

        // Filenames are date-prefixed, so lexicographic order is chronological
        names.sort();
        let start = names.len().saturating_sub(max_summaries);

        let mut block = String::from(
            "[PREVIOUS SESSION CONTEXT]\n\
             These are summaries from your recent conversations with this user.\n\
             Use them to maintain continuity — reference prior decisions and open items.\n\n",
        );
        for name in &names[start..] {
            let Ok(content) = std::fs::read_to_string(dir.join(name)) else {
                continue;
            };
            block.push_str(&format!(
                "--- Session {} ---\n{}\n\n",
                summary_date_label(name),
                content.trim()
            ));
        }
        block.push_str("[END PREVIOUS SESSION CONTEXT]\n\n");
        block
    }

    /// Today's and yesterday's daily notes as a context block, or empty.
    pub fn daily_notes(&self, user_id: &str) -> String {
        if !self.enabled {
            return String::new();
        }

        let dir = self.base_path.join("daily").join(user_id);
        let today = Local::now().format("%Y-%m-%d").to_string();
        let yesterday = (Local::now() - chrono::Duration::days(1))
            .format("%Y-%m-%d")
            .to_string();

        let mut block = String::new();
        for (label, date) in [("Yesterday", &yesterday), ("Today", &today)] {
            let Ok(content) = std::fs::read_to_string(dir.join(format!("{date}.md"))) else {
                continue;
            };
            let trimmed = content.trim();
            if trimmed.is_empty() {
                continue;
            }
            if block.is_empty() {
                block.push_str("[DAILY NOTES]\n");
            }
            block.push_str(&format!("--- {label} ({date}) ---\n{trimmed}\n\n"));
        }
        if !block.is_empty() {
            block.push_str("[END DAILY NOTES]\n\n");
        }
        block
    }

    /// Append a timestamped note to today's daily log for the user.
    pub fn append_daily_note(&self, user_id: &str, note: &str) {
        let note = note.trim();
        if !self.enabled || note.is_empty() {
            return;
        }

        let dir = self.base_path.join("daily").join(user_id);
        if let Err(e) = create_dir_with_mode(&dir, 0o755) {
            warn!(error = %e, "failed to create daily dir");
            return;
        }

        let path = dir.join(format!("{}.md", Local::now().format("%Y-%m-%d")));
        let line = format!("- [{}] {note}", Local::now().format("%H:%M"));
        if let Err(e) = append_line(&path, &line, 0o644) {
            warn!(path = %path.display(), error = %e, "failed to append daily note");
        }
    }

    /// Remove memory files past their retention tier. Conversation logs age
    /// out at 1x `retention_days`, daily notes at 2x, summaries at 6x.
    pub fn clean_old_files(&self) {
        if !self.enabled || self.retention_days <= 0 {
            return;
        }

        let now = SystemTime::now();
        let mut cleaned = 0;
        for (subdir, multiplier) in [("conversations", 1), ("daily", 2), ("summaries", 6)] {
            cleaned += clean_dir(
                &self.base_path.join(subdir),
                retention_cutoff(now, self.retention_days * multiplier),
            );
        }

        if cleaned > 0 {
            info!(files = cleaned, "retention cleanup removed old files");
        }
    }
}

const SUMMARY_PROMPT: &str = "You are summarizing a conversation for future context continuity.
Given the following conversation log between a user and an AI assistant, produce a concise summary with these sections:

## Summary
- 3-5 bullet points of what was discussed and accomplished

## Decisions
- Any decisions made or preferences expressed (skip if none)

## Open Items
- Any unfinished tasks or open questions (skip if none)

Output ONLY the summary in markdown, no preamble or explanation.

--- CONVERSATION LOG ---
";

/// Last few turns of a rendered conversation log, bulleted under a header
/// that marks the summary as raw.
fn raw_fallback_summary(conversation_log: &str) -> String {
    let turns: Vec<&str> = conversation_log
        .trim()
        .split("\n\n")
        .filter(|t| !t.trim().is_empty())
        .collect();
    let start = turns.len().saturating_sub(6);

    let mut out = String::from("## Summary (raw — summarization failed)\n");
    for turn in &turns[start..] {
        out.push_str("- ");
        out.push_str(&truncate_text(turn.trim(), 300, "..."));
        out.push('\n');
    }
    out
}

/// First `- ` bullet of a summary that is not a "- Any ..." section
/// placeholder; becomes the daily-note line for the session.
fn first_summary_bullet(summary: &str) -> Option<&str> {
    summary
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("- ") && !line.starts_with("- Any "))
        .map(|line| line.trim_start_matches("- "))
}

/// Extract the `YYYY-MM-DD` prefix from a summary file name.
fn summary_date_label(name: &str) -> &str {
    let mut dashes = 0;
    for (i, b) in name.bytes().enumerate() {
        if b == b'-' {
            dashes += 1;
            if dashes == 3 {
                return &name[..i];
            }
        }
    }
    name
}

fn retention_cutoff(now: SystemTime, days: i64) -> SystemTime {
    now - Duration::from_secs(days.max(0) as u64 * 86_400)
}

fn clean_dir(dir: &Path, cutoff: SystemTime) -> usize {
    let mut cleaned = 0;
    walk_files(dir, &mut |path, meta| {
        let Ok(modified) = meta.modified() else {
            return;
        };
        if modified < cutoff && std::fs::remove_file(path).is_ok() {
            cleaned += 1;
        }
    });
    cleaned
}

fn walk_files(dir: &Path, visit: &mut impl FnMut(&Path, &std::fs::Metadata)) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_files(&path, visit);
        } else if let Ok(meta) = entry.metadata() {
            visit(&path, &meta);
        }
    }
}

fn create_dir_with_mode(dir: &Path, mode: u32) -> std::io::Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    builder.create(dir)
}

fn append_line(path: &Path, line: &str, mode: u32) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = options.open(path)?;
    writeln!(file, "{line}")
}

fn write_file_with_mode(path: &Path, data: &[u8], mode: u32) -> std::io::Result<()> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = options.open(path)?;
    file.write_all(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_at(base: &Path) -> MemoryStore {
        MemoryStore::new(&MemoryConfig {
            enabled: true,
            base_path: base.to_string_lossy().into_owned(),
            max_summaries: 5,
            retention_days: 14,
        })
    }

    #[test]
    fn log_turn_appends_jsonl_records() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());

        store.log_turn("u1", "sess-1", Role::User, "hello");
        store.log_turn("u1", "sess-1", Role::Assistant, "hi there");
        store.log_turn("u1", "sess-1", Role::User, ""); // no-op

        let raw = std::fs::read_to_string(
            dir.path().join("conversations/u1/sess-1.jsonl"),
        )
        .unwrap();
        assert_eq!(raw.lines().count(), 2);

        let first: ConversationTurn = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        assert_eq!(first.role, Role::User);
        assert_eq!(first.text, "hello");
        assert_eq!(first.session_id, "sess-1");
    }

    #[test]
    fn disabled_store_writes_nothing() {
        let dir = tempdir().unwrap();
        let mut store = store_at(dir.path());
        store.enabled = false;

        store.log_turn("u1", "sess-1", Role::User, "hello");
        assert!(!dir.path().join("conversations").exists());
        assert_eq!(store.recent_context("u1", 5), "");
        assert_eq!(store.daily_notes("u1"), "");
    }

    #[test]
    fn rendered_log_labels_roles_and_truncates() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());

        store.log_turn("u1", "s", Role::User, "question");
        store.log_turn("u1", "s", Role::Assistant, &"x".repeat(3000));

        let rendered = store.read_conversation_log("u1", "s").unwrap();
        assert!(rendered.starts_with("[user]: question\n\n"));
        assert!(rendered.contains("[assistant]: "));
        assert!(rendered.contains("... [truncated]"));
        // 2000 chars of payload plus the marker, not the original 3000
        assert!(rendered.len() < 2500);
    }

    #[test]
    fn fallback_summary_keeps_last_six_turns() {
        let mut log = String::new();
        for i in 1..=9 {
            log.push_str(&format!("[user]: message number {i}\n\n"));
        }
        let summary = raw_fallback_summary(&log);

        assert!(summary.starts_with("## Summary (raw — summarization failed)\n"));
        let bullets: Vec<&str> = summary.lines().filter(|l| l.starts_with("- ")).collect();
        assert_eq!(bullets.len(), 6);
        assert!(bullets[0].contains("message number 4"));
        assert!(bullets[5].contains("message number 9"));
    }

    #[test]
    fn fallback_summary_caps_turn_length() {
        let log = format!("[assistant]: {}\n\n", "y".repeat(1000));
        let summary = raw_fallback_summary(&log);
        let bullet = summary.lines().nth(1).unwrap();
        assert!(bullet.len() <= 2 + 300 + 3);
        assert!(bullet.ends_with("..."));
    }

    #[test]
    fn recent_context_keeps_newest_in_order() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());
        let summaries = dir.path().join("summaries/u1");
        std::fs::create_dir_all(&summaries).unwrap();
        for day in 1..=7 {
            std::fs::write(
                summaries.join(format!("2026-07-{day:02}-abcd1234.md")),
                format!("summary for day {day}"),
            )
            .unwrap();
        }
        std::fs::write(summaries.join("notes.txt"), "ignored").unwrap();

        let block = store.recent_context("u1", 5);
        assert!(block.starts_with("[PREVIOUS SESSION CONTEXT]\n"));
        assert!(block.ends_with("[END PREVIOUS SESSION CONTEXT]\n\n"));
        assert!(!block.contains("day 1"));
        assert!(!block.contains("day 2"));
        assert!(block.contains("--- Session 2026-07-03 ---"));
        assert!(block.contains("summary for day 7"));
        let pos3 = block.find("day 3").unwrap();
        let pos7 = block.find("day 7").unwrap();
        assert!(pos3 < pos7);
    }

    #[test]
    fn recent_context_empty_without_history() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());
        assert_eq!(store.recent_context("nobody", 5), "");
    }

    #[test]
    fn daily_note_format_and_context_block() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());

        store.append_daily_note("u1", "  shipped the release  ");
        store.append_daily_note("u1", ""); // no-op

        let today = Local::now().format("%Y-%m-%d").to_string();
        let content =
            std::fs::read_to_string(dir.path().join(format!("daily/u1/{today}.md"))).unwrap();
        assert_eq!(content.lines().count(), 1);
        let line = content.lines().next().unwrap();
        assert!(line.starts_with("- ["));
        assert!(line.ends_with("] shipped the release"));

        let yesterday = (Local::now() - chrono::Duration::days(1))
            .format("%Y-%m-%d")
            .to_string();
        std::fs::write(
            dir.path().join(format!("daily/u1/{yesterday}.md")),
            "- [09:00] older note\n",
        )
        .unwrap();

        let block = store.daily_notes("u1");
        assert!(block.starts_with("[DAILY NOTES]\n"));
        assert!(block.ends_with("[END DAILY NOTES]\n\n"));
        assert!(block.contains(&format!("--- Yesterday ({yesterday}) ---")));
        assert!(block.contains(&format!("--- Today ({today}) ---")));
        let y = block.find("Yesterday").unwrap();
        let t = block.find("Today").unwrap();
        assert!(y < t);
    }

    #[test]
    fn first_bullet_skips_any_placeholders() {
        let summary = "## Summary\n- Any decisions made or preferences expressed\n- Fixed the build\n- Second item\n";
        assert_eq!(first_summary_bullet(summary), Some("Fixed the build"));
        assert_eq!(first_summary_bullet("no bullets here"), None);
    }

    #[test]
    fn summary_date_label_extraction() {
        assert_eq!(summary_date_label("2026-07-15-abcd1234.md"), "2026-07-15");
        assert_eq!(summary_date_label("weird.md"), "weird.md");
    }

    #[test]
    fn retention_cutoff_tiers() {
        let now = SystemTime::now();
        let day = Duration::from_secs(86_400);

        let cutoff = retention_cutoff(now, 14);
        assert!(now - day * 15 < cutoff);
        assert!(now - day * 13 > cutoff);
    }

    #[test]
    fn retention_leaves_fresh_files_and_directories() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());
        store.log_turn("u1", "s", Role::User, "fresh");

        store.clean_old_files();

        assert!(dir.path().join("conversations/u1/s.jsonl").exists());
    }

    #[cfg(unix)]
    fn fake_summarizer(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("claude");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn flush_writes_summary_and_daily_note() {
        let dir = tempdir().unwrap();
        let script = fake_summarizer(
            dir.path(),
            "echo '## Summary'\necho '- Shipped the new parser'\necho '- Second bullet'",
        );
        let store = store_at(dir.path()).with_claude_binary(script);
        store.log_turn("u1", "sess-abcdef12", Role::User, "let's ship the parser");

        store.flush_session("u1", "sess-abcdef12", "test-model").await;

        let date = Local::now().format("%Y-%m-%d");
        let summary = std::fs::read_to_string(
            dir.path()
                .join(format!("summaries/u1/{date}-sess-abc.md")),
        )
        .unwrap();
        assert!(summary.contains("## Summary"));
        assert!(summary.ends_with('\n'));

        let daily =
            std::fs::read_to_string(dir.path().join(format!("daily/u1/{date}.md"))).unwrap();
        assert!(daily.contains("Shipped the new parser"));
        assert!(!daily.contains("Second bullet"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn flush_falls_back_when_summarizer_fails() {
        let dir = tempdir().unwrap();
        let script = fake_summarizer(dir.path(), "exit 1");
        let store = store_at(dir.path()).with_claude_binary(script);
        store.log_turn("u1", "sess-abcdef12", Role::User, "only turn");

        store.flush_session("u1", "sess-abcdef12", "test-model").await;

        let date = Local::now().format("%Y-%m-%d");
        let summary = std::fs::read_to_string(
            dir.path()
                .join(format!("summaries/u1/{date}-sess-abc.md")),
        )
        .unwrap();
        assert!(summary.starts_with("## Summary (raw — summarization failed)"));
        assert!(summary.contains("only turn"));
    }

    #[tokio::test]
    async fn flush_without_a_log_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = store_at(dir.path());
        store.flush_session("u1", "missing-session", "test-model").await;
        assert!(!dir.path().join("summaries").exists());
    }

    #[test]
    fn clean_dir_removes_files_past_cutoff() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("nested/old.md");
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, "old").unwrap();

        // a cutoff in the future ages every existing file out
        let removed = clean_dir(dir.path(), SystemTime::now() + Duration::from_secs(60));
        assert_eq!(removed, 1);
        assert!(!file.exists());
        assert!(file.parent().unwrap().is_dir());
    }
}
