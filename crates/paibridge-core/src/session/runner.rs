//! One assistant turn, end to end: argument assembly, subprocess spawn under
//! the minimal environment, stream-json parsing, and exit interpretation.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::claude::{self, stream};
use crate::error::{BridgeError, Result};
use crate::memory::Role;
use crate::session::registry::SessionRegistry;
use crate::session::{Attachment, Session, SessionStatus, short_id};
use crate::util::now_millis;

/// Fixed brief prepended to the first turn of every session, describing the
/// chat environment and the out-of-band directives the assistant may emit.
const BRIDGE_CONTEXT: &str = "[TELEGRAM BRIDGE CONTEXT]
You are responding through a Telegram chat bridge. The user is on their phone.
- Keep responses concise and mobile-friendly.
- When the user asks you to send, fetch, grab, pull, or share a FILE, output its absolute path on its own line as: SEND: /absolute/path/to/file.ext
- You can output multiple SEND: lines for multiple files.
- The bridge will automatically deliver SEND: files to the user's Telegram chat.
- Use SEND: only when the user wants to RECEIVE a file, not when you're just reading files for your own understanding.
- To speak a response as a voice note, use either format on its own line:
  VOICE: Text to be spoken aloud
  \u{1f5e3}\u{fe0f} PAI: Text to be spoken aloud
- Only one voice line per response. Keep voice text concise (1-3 sentences).
- The bridge will deliver the voice line as a spoken Telegram message.
- For Obsidian notes: wiki-links like [[filename]] and ![[attachment]] resolve relative to the vault root. Follow links to find referenced files.
[END BRIDGE CONTEXT]

";

/// What a completed turn hands back to the dispatcher.
#[derive(Debug)]
pub struct TurnOutput {
    pub text: String,
    pub created_files: Vec<String>,
}

/// Invocation fields copied out of the session under the registry lock, so
/// the turn never touches the lock while the subprocess runs.
struct TurnPlan {
    session_id: String,
    work_dir: String,
    model: String,
    resume_token: String,
}

struct RawTurn {
    text: String,
    files: Vec<String>,
    status: std::process::ExitStatus,
    stderr: String,
}

impl SessionRegistry {
    /// Run one assistant turn for the user.
    ///
    /// Fails `StillBusy` when a turn is already in flight (the caller should
    /// queue the message as a follow-up) and `ConcurrencyCap` when no session
    /// exists and none may be created.
    pub async fn send_message(
        &self,
        user_id: &str,
        chat_id: &str,
        text: &str,
        attachment: Option<Attachment>,
    ) -> Result<TurnOutput> {
        let plan = {
            let mut inner = self.write();
            match inner.sessions.get(user_id) {
                Some(session) if session.is_busy() => return Err(BridgeError::StillBusy),
                Some(_) => {}
                None => {
                    if inner.sessions.len() >= self.config.sessions.max_concurrent {
                        return Err(BridgeError::ConcurrencyCap);
                    }
                    let session = Session::new(user_id, chat_id, &self.config.sessions);
                    inner.sessions.insert(user_id.to_string(), session);
                }
            }

            let session = inner.sessions.get_mut(user_id).expect("session ensured above");
            session.status = SessionStatus::Busy;
            session.last_activity_at = now_millis();
            session.message_count += 1;
            let plan = TurnPlan {
                session_id: session.id.clone(),
                work_dir: session.work_dir.clone(),
                model: session.model.clone(),
                resume_token: session.claude_session_id.clone(),
            };
            self.save_locked(&inner);
            plan
        };

        let cancel = CancellationToken::new();
        let raw = self
            .run_turn(user_id, text, attachment.as_ref(), &plan, cancel)
            .await;

        // The turn is over either way: drop the cancel handle, return the
        // session to `active`, snapshot.
        {
            let mut inner = self.write();
            inner.procs.remove(&plan.session_id);
            if let Some(session) = inner.sessions.get_mut(user_id) {
                session.status = SessionStatus::Active;
            }
            self.save_locked(&inner);
        }

        let raw = raw?;

        if !raw.status.success() {
            let stderr = raw.stderr.trim();
            if !plan.resume_token.is_empty() && stderr.contains("Could not find session") {
                self.clear_conversation_id(user_id);
                return Err(BridgeError::SessionExpired);
            }
            if !stderr.is_empty() {
                return Err(BridgeError::AssistantFailed(stderr.to_string()));
            }
            // killed (timeout or cancel) with a silent stderr: surface
            // whatever was collected rather than an error
        }

        if !raw.text.is_empty() {
            self.memory
                .log_turn(user_id, &plan.session_id, Role::Assistant, &raw.text);
        }

        Ok(TurnOutput {
            text: raw.text,
            created_files: raw.files,
        })
    }

    async fn run_turn(
        &self,
        user_id: &str,
        text: &str,
        attachment: Option<&Attachment>,
        plan: &TurnPlan,
        cancel: CancellationToken,
    ) -> std::io::Result<RawTurn> {
        let binary = match &self.claude_path {
            Some(path) => path.clone(),
            None => claude::resolve_binary(),
        };

        // First turn of a session: prepend the bridge brief and the
        // cross-session context. Resumed turns carry context via the token.
        let is_first = plan.resume_token.is_empty();
        let mut prompt = if is_first {
            let recent = self
                .memory
                .recent_context(user_id, self.config.memory.max_summaries);
            let daily = self.memory.daily_notes(user_id);
            format!("{BRIDGE_CONTEXT}{recent}{daily}{text}")
        } else {
            text.to_string()
        };

        if let Some(file @ Attachment::TextFile { content, .. }) = attachment
            && !content.is_empty()
        {
            prompt = format!(
                "{prompt}\n\n--- {} ---\n{}\n--- end ---",
                file.text_label(),
                content
            );
        }

        let binary_attachment = attachment.filter(|a| a.is_binary());

        let mut command = Command::new(&binary);
        command.arg("-p");
        if binary_attachment.is_some() {
            command.args(["--input-format", "stream-json"]);
        } else {
            command.arg(&prompt);
        }
        command.args(["--output-format", "stream-json", "--verbose"]);
        command.args(["--model", &plan.model]);
        if !plan.resume_token.is_empty() {
            command.args(["--resume", &plan.resume_token]);
        }

        command
            .current_dir(&plan.work_dir)
            .env_clear()
            .envs(claude::subprocess_env(self.run_as.is_some()))
            .stdin(if binary_attachment.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        if let Some(run_as) = self.run_as {
            command.uid(run_as.uid).gid(run_as.gid);
        }

        self.memory
            .log_turn(user_id, &plan.session_id, Role::User, text);

        debug!(
            session = short_id(&plan.session_id),
            binary = %binary.display(),
            resume = !is_first,
            "spawning claude"
        );
        let mut child = command.spawn()?;

        // Register the cancel handle so /clear and the sweeper can kill the
        // invocation.
        {
            let mut inner = self.write();
            inner.procs.insert(plan.session_id.clone(), cancel.clone());
        }

        if let Some(binary_attachment) = binary_attachment
            && let Some(mut stdin) = child.stdin.take()
        {
            let payload = stream::stdin_user_message(binary_attachment, &prompt);
            tokio::spawn(async move {
                match serde_json::to_vec(&payload) {
                    Ok(mut data) => {
                        data.push(b'\n');
                        let _ = stdin.write_all(&data).await;
                        let _ = stdin.shutdown().await;
                    }
                    Err(e) => warn!(error = %e, "failed to encode stdin payload"),
                }
            });
        }

        let stdout = child.stdout.take().expect("child stdout");
        let stderr = child.stderr.take().expect("child stderr");

        let mut lines = BufReader::new(stdout).lines();
        let mut collector = stream::ResponseCollector::default();
        let mut token_captured = !is_first;
        let mut killed = false;

        let deadline = tokio::time::sleep(claude::TURN_TIMEOUT);
        tokio::pin!(deadline);

        // After a kill the loop keeps draining stdout so buffered output is
        // not lost; the reader sees EOF once the process is gone.
        loop {
            tokio::select! {
                () = cancel.cancelled(), if !killed => {
                    debug!(session = short_id(&plan.session_id), "turn cancelled, killing claude");
                    killed = true;
                    let _ = child.start_kill();
                }
                () = &mut deadline, if !killed => {
                    warn!(session = short_id(&plan.session_id), "turn deadline exceeded, killing claude");
                    killed = true;
                    let _ = child.start_kill();
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => {
                        let Some(event) = stream::parse_line(&line) else {
                            continue;
                        };
                        if !token_captured && let Some(conversation_id) = event.session_id() {
                            self.assign_conversation_id(user_id, conversation_id);
                            token_captured = true;
                        }
                        collector.absorb(&event);
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "error reading claude stdout");
                        break;
                    }
                }
            }
        }

        let mut stderr_buf = String::new();
        let _ = BufReader::new(stderr).read_to_string(&mut stderr_buf).await;

        let status = child.wait().await?;
        let (text, files) = collector.into_parts();
        Ok(RawTurn {
            text,
            files,
            status,
            stderr: stderr_buf,
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::session::registry::tests::test_registry;

    /// Write an executable fake claude script into the tempdir.
    fn fake_claude(dir: &TempDir, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("claude");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn fresh_first_turn() {
        let dir = TempDir::new().unwrap();
        let args_file = dir.path().join("args.txt");
        let script = fake_claude(
            &dir,
            &format!(
                r#"printf '%s\n' "$@" > {}
echo '{{"type":"system","session_id":"abc-123"}}'
echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"hi"}}]}}}}'"#,
                args_file.display()
            ),
        );
        let registry = test_registry(&dir).with_claude_binary(script);

        let output = registry
            .send_message("u1", "c1", "hello", None)
            .await
            .unwrap();

        assert_eq!(output.text, "hi");
        assert!(output.created_files.is_empty());

        let session = registry.get("u1").unwrap();
        assert_eq!(session.claude_session_id, "abc-123");
        assert_eq!(session.message_count, 1);
        assert_eq!(session.status, SessionStatus::Active);

        // invocation surface: one-shot flag, context-prefaced positional
        // prompt, stream-json output, model; no --resume on a first turn.
        // The prompt itself spans multiple lines of the dump.
        let args = std::fs::read_to_string(&args_file).unwrap();
        assert!(args.starts_with("-p\n[TELEGRAM BRIDGE CONTEXT]"));
        assert!(args.contains("hello\n--output-format\nstream-json\n--verbose\n--model\ntest-model\n"));
        assert!(!args.contains("--resume"));

        // both turns logged
        let log_path = dir
            .path()
            .join("memory/conversations/u1")
            .join(format!("{}.jsonl", session.id));
        let log = std::fs::read_to_string(log_path).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains(r#""text":"hello""#));
        assert!(log.contains(r#""text":"hi""#));
    }

    #[tokio::test]
    async fn resumed_turn_passes_token_and_skips_preface() {
        let dir = TempDir::new().unwrap();
        let args_file = dir.path().join("args.txt");
        let script = fake_claude(
            &dir,
            &format!(
                r#"printf '%s\n' "$@" > {}
echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"resumed"}}]}}}}'"#,
                args_file.display()
            ),
        );
        let registry = test_registry(&dir).with_claude_binary(script);
        registry.resolve_or_create("u1", "c1").unwrap();
        registry
            .write()
            .sessions
            .get_mut("u1")
            .unwrap()
            .claude_session_id = "token-1".to_string();

        let output = registry
            .send_message("u1", "c1", "go on", None)
            .await
            .unwrap();
        assert_eq!(output.text, "resumed");

        // resumed turns carry the raw text (no context preface) and the token
        let args = std::fs::read_to_string(&args_file).unwrap();
        assert_eq!(
            args,
            "-p\ngo on\n--output-format\nstream-json\n--verbose\n--model\ntest-model\n--resume\ntoken-1\n"
        );
    }

    #[tokio::test]
    async fn expired_resume_token_is_wiped() {
        let dir = TempDir::new().unwrap();
        let script = fake_claude(
            &dir,
            "echo 'Could not find session token-1' >&2\nexit 1",
        );
        let registry = test_registry(&dir).with_claude_binary(script);
        registry.resolve_or_create("u1", "c1").unwrap();
        registry
            .write()
            .sessions
            .get_mut("u1")
            .unwrap()
            .claude_session_id = "token-1".to_string();

        let err = registry
            .send_message("u1", "c1", "go on", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::SessionExpired));

        let session = registry.get("u1").unwrap();
        assert!(session.claude_session_id.is_empty());
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn nonzero_exit_with_stderr_is_surfaced() {
        let dir = TempDir::new().unwrap();
        let script = fake_claude(&dir, "echo 'model overloaded' >&2\nexit 2");
        let registry = test_registry(&dir).with_claude_binary(script);

        let err = registry
            .send_message("u1", "c1", "hello", None)
            .await
            .unwrap_err();
        let BridgeError::AssistantFailed(stderr) = err else {
            panic!("expected AssistantFailed, got {err:?}");
        };
        assert!(stderr.contains("model overloaded"));

        // the session survives a failed turn
        assert_eq!(registry.get("u1").unwrap().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn nonzero_exit_with_silent_stderr_is_an_empty_response() {
        let dir = TempDir::new().unwrap();
        let script = fake_claude(&dir, "exit 3");
        let registry = test_registry(&dir).with_claude_binary(script);

        let output = registry
            .send_message("u1", "c1", "hello", None)
            .await
            .unwrap();
        assert_eq!(output.text, "");
        assert_eq!(registry.get("u1").unwrap().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn busy_session_rejects_a_second_turn() {
        let dir = TempDir::new().unwrap();
        let script = fake_claude(&dir, "echo '{\"type\":\"system\"}'");
        let registry = test_registry(&dir).with_claude_binary(script);
        registry.resolve_or_create("u1", "c1").unwrap();
        registry.write().sessions.get_mut("u1").unwrap().status = SessionStatus::Busy;

        let err = registry
            .send_message("u1", "c1", "hello", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::StillBusy));
    }

    #[tokio::test]
    async fn cancellation_kills_the_turn_and_keeps_buffered_output() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("started");
        let script = fake_claude(
            &dir,
            &format!(
                r#"echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"partial"}}]}}}}'
touch {}
sleep 30
echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":" never"}}]}}}}'"#,
                marker.display()
            ),
        );
        let registry = Arc::new(test_registry(&dir).with_claude_binary(script));

        let task = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.send_message("u1", "c1", "work", None).await })
        };

        // wait for the subprocess to emit its first line, then cancel it
        while !marker.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let token = loop {
            if let Some(token) = registry.read().procs.values().next().cloned() {
                break token;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        token.cancel();

        let output = task.await.unwrap().unwrap();
        assert_eq!(output.text, "partial");
        assert_eq!(registry.get("u1").unwrap().status, SessionStatus::Active);
        assert!(registry.read().procs.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_returns_the_session_to_active() {
        let dir = TempDir::new().unwrap();
        let registry =
            test_registry(&dir).with_claude_binary(dir.path().join("does-not-exist"));

        let err = registry
            .send_message("u1", "c1", "hello", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Io(_)));
        assert_eq!(registry.get("u1").unwrap().status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn binary_attachment_streams_json_on_stdin() {
        use base64::Engine as _;

        let dir = TempDir::new().unwrap();
        let stdin_file = dir.path().join("stdin.txt");
        let args_file = dir.path().join("args.txt");
        let script = fake_claude(
            &dir,
            &format!(
                r#"cat > {}
printf '%s\n' "$@" > {}
echo '{{"type":"assistant","message":{{"content":[{{"type":"text","text":"saw it"}}]}}}}'"#,
                stdin_file.display(),
                args_file.display()
            ),
        );
        let registry = test_registry(&dir).with_claude_binary(script);

        let attachment = Attachment::Image {
            data: b"imgbytes".to_vec(),
            media_type: "image/png".to_string(),
        };
        let output = registry
            .send_message("u1", "c1", "what is this?", Some(attachment))
            .await
            .unwrap();
        assert_eq!(output.text, "saw it");

        // prompt moves off the command line in stream-json input mode
        let args = std::fs::read_to_string(&args_file).unwrap();
        assert!(args.starts_with("-p\n--input-format\nstream-json\n--output-format\nstream-json\n"));
        assert!(!args.contains("what is this?"));

        // exactly one JSON object on stdin, newline-terminated: base64 part
        // first, prompt text part last
        let written = std::fs::read_to_string(&stdin_file).unwrap();
        assert!(written.ends_with('\n'));
        let payload: serde_json::Value = serde_json::from_str(written.trim_end()).unwrap();
        assert_eq!(payload["type"], "user");
        let content = payload["message"]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "image");
        assert_eq!(
            content[0]["source"]["data"],
            base64::engine::general_purpose::STANDARD.encode(b"imgbytes")
        );
        let prompt = content[1]["text"].as_str().unwrap();
        assert!(prompt.starts_with("[TELEGRAM BRIDGE CONTEXT]"));
        assert!(prompt.ends_with("what is this?"));
    }

    #[tokio::test]
    async fn created_files_are_collected_from_tool_use() {
        let dir = TempDir::new().unwrap();
        let script = fake_claude(
            &dir,
            r#"echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Write","input":{"file_path":"/tmp/report.md"}}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"convert a.png -o /tmp/chart.png"}}]}}'
echo '{"type":"assistant","message":{"content":[{"type":"text","text":"done"}]}}'"#,
        );
        let registry = test_registry(&dir).with_claude_binary(script);

        let output = registry
            .send_message("u1", "c1", "make files", None)
            .await
            .unwrap();
        assert_eq!(output.text, "done");
        assert_eq!(output.created_files, vec!["/tmp/report.md", "/tmp/chart.png"]);
    }
}
