//! The chat dispatcher: glue between the transport and the session layer.
//!
//! Each incoming message passes authorization and rate limiting, then either
//! runs as a user command or becomes an assistant turn. Turn output is split
//! into directives and text before it goes back out through the transport.

pub mod directives;
pub mod rate_limit;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::{Config, ResponseFormat, resolve_home};
use crate::error::BridgeError;
use crate::session::registry::SessionRegistry;
use crate::session::runner::TurnOutput;
use crate::session::{Attachment, MAX_PENDING_MESSAGES, queue};
use rate_limit::RateLimiter;

/// Outbound side of the chat transport. Implemented by the Telegram client;
/// the dispatcher only ever talks to this trait.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str) -> anyhow::Result<()>;
    async fn send_file(&self, chat_id: &str, path: &Path) -> anyhow::Result<()>;
    /// Deliver a short utterance as a spoken message. Transports without a
    /// speech channel fall back to text.
    async fn send_voice(&self, chat_id: &str, utterance: &str) -> anyhow::Result<()>;
    async fn send_typing(&self, chat_id: &str) -> anyhow::Result<()>;
}

/// Liveness probe the health endpoint reads.
pub trait TransportProbe: Send + Sync {
    /// Millisecond timestamp of the last successful poll cycle, if any.
    fn last_poll_at(&self) -> Option<i64>;
}

/// One message delivered by the transport.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub user_id: String,
    pub chat_id: String,
    pub text: String,
    pub attachment: Option<Attachment>,
}

pub struct Dispatcher {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn ChatTransport>,
    rate_limiter: Arc<RateLimiter>,
    config: Config,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SessionRegistry>,
        transport: Arc<dyn ChatTransport>,
        config: Config,
    ) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.security.rate_limit_per_minute));
        Self {
            registry,
            transport,
            rate_limiter,
            config,
        }
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        self.rate_limiter.clone()
    }

    /// Entry point for every message the transport delivers.
    pub async fn handle(&self, message: IncomingMessage) {
        if !self.authorized(&message.user_id) {
            self.send(
                &message.chat_id,
                "Unauthorized. Your user ID is not in the allowlist.",
            )
            .await;
            return;
        }

        if message.text.starts_with('/') && message.attachment.is_none() {
            self.handle_command(&message).await;
            return;
        }

        if self.rate_limiter.is_limited(&message.user_id) {
            self.send(&message.chat_id, "Rate limited. Please wait a moment.")
                .await;
            return;
        }

        if self.registry.get(&message.user_id).is_none() && !self.registry.can_create() {
            self.send(
                &message.chat_id,
                "Max concurrent sessions reached. Use /clear to end your session first.",
            )
            .await;
            return;
        }

        let _ = self.transport.send_typing(&message.chat_id).await;
        self.process_turn(
            &message.user_id,
            &message.chat_id,
            &message.text,
            message.attachment.clone(),
        )
        .await;
    }

    fn authorized(&self, user_id: &str) -> bool {
        self.config.allowed_users.is_empty()
            || self.config.allowed_users.iter().any(|u| u == user_id)
    }

    async fn send(&self, chat_id: &str, text: &str) {
        if let Err(e) = self.transport.send_text(chat_id, text).await {
            warn!(error = %e, "failed to send chat message");
        }
    }

    // --- Turns ---

    async fn process_turn(
        &self,
        user_id: &str,
        chat_id: &str,
        text: &str,
        attachment: Option<Attachment>,
    ) {
        match self
            .registry
            .send_message(user_id, chat_id, text, attachment.clone())
            .await
        {
            Ok(output) => {
                self.deliver(chat_id, &output).await;
                self.drain_follow_ups(user_id, chat_id).await;
            }
            Err(BridgeError::StillBusy) => {
                self.queue_follow_up(user_id, chat_id, text, attachment)
                    .await;
            }
            Err(e) => {
                self.send(chat_id, &format!("Error: {e}")).await;
            }
        }
    }

    async fn queue_follow_up(
        &self,
        user_id: &str,
        chat_id: &str,
        text: &str,
        attachment: Option<Attachment>,
    ) {
        let Some(session) = self.registry.get(user_id) else {
            // the session finished (or died) between the busy check and now;
            // ask the user to resend rather than silently dropping input
            self.send(chat_id, &BridgeError::StillBusy.to_string())
                .await;
            return;
        };

        match queue::enqueue(&session, text.to_string(), attachment) {
            Ok(depth) => {
                self.send(
                    chat_id,
                    &format!(
                        "Queued ({depth}/{MAX_PENDING_MESSAGES}). I'll pick it up when the current task finishes."
                    ),
                )
                .await;
            }
            Err(e) => self.send(chat_id, &e.to_string()).await,
        }
    }

    /// Feed queued follow-ups back into the runner, batch by batch, until
    /// the queue stays empty.
    async fn drain_follow_ups(&self, user_id: &str, chat_id: &str) {
        loop {
            let Some(session) = self.registry.get(user_id) else {
                return;
            };
            let pending = queue::drain(&session);
            if pending.is_empty() {
                return;
            }

            let (batch_text, batch_attachment) = queue::build_batch(&pending);
            if batch_text.is_empty() && batch_attachment.is_none() {
                continue;
            }
            info!(count = pending.len(), user = user_id, "processing follow-up batch");

            match self
                .registry
                .send_message(user_id, chat_id, &batch_text, batch_attachment)
                .await
            {
                Ok(output) => self.deliver(chat_id, &output).await,
                Err(e) => {
                    self.send(chat_id, &format!("Error: {e}")).await;
                    return;
                }
            }
        }
    }

    async fn deliver(&self, chat_id: &str, output: &TurnOutput) {
        if output.text.trim().is_empty() {
            self.send(chat_id, "(No response from Claude)").await;
            return;
        }

        let directives = directives::extract(&output.text);

        if let Some(utterance) = &directives.voice
            && let Err(e) = self.transport.send_voice(chat_id, utterance).await
        {
            warn!(error = %e, "failed to send voice message");
        }

        let text = select_response_text(
            self.config.response.format,
            &directives.text,
            directives.voice.as_deref(),
        );
        if !text.trim().is_empty() {
            self.send(chat_id, &text).await;
        }

        // only files explicitly requested via SEND directives are delivered
        for path in &directives.files {
            if !path.exists() {
                continue;
            }
            if let Err(e) = self.transport.send_file(chat_id, path).await {
                warn!(path = %path.display(), error = %e, "failed to send file");
            }
        }
    }

    // --- Commands ---

    async fn handle_command(&self, message: &IncomingMessage) {
        let trimmed = message.text.trim();
        let (command, args) = match trimmed.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (trimmed, ""),
        };
        // strip the @botname suffix Telegram appends in group chats
        let command = command.split('@').next().unwrap_or(command);

        match command {
            "/start" => {
                self.send(
                    &message.chat_id,
                    &format!(
                        "PAI Telegram Bridge active.\n\nYour user ID: {}\nModel: {}\nWork dir: {}\n\nSend any message to start a conversation with PAI.",
                        message.user_id,
                        self.config.sessions.default_model,
                        self.config.sessions.default_work_dir
                    ),
                )
                .await;
            }
            "/status" => {
                let Some(session) = self.registry.get(&message.user_id) else {
                    self.send(
                        &message.chat_id,
                        "No active session. Send a message to start one.",
                    )
                    .await;
                    return;
                };
                let started = chrono::DateTime::from_timestamp_millis(session.created_at)
                    .map(|t| t.to_rfc2822())
                    .unwrap_or_default();
                self.send(
                    &message.chat_id,
                    &format!(
                        "Session: {}...\nStatus: {}\nMessages: {}\nModel: {}\nWork dir: {}\nStarted: {}",
                        session.short_id(),
                        session.status,
                        session.message_count,
                        session.model,
                        session.work_dir,
                        started
                    ),
                )
                .await;
            }
            "/clear" => {
                let killed = self.registry.kill(&message.user_id).await;
                self.send(
                    &message.chat_id,
                    if killed {
                        "Session cleared."
                    } else {
                        "No active session."
                    },
                )
                .await;
            }
            "/cd" => self.handle_cd(message, args).await,
            "/sessions" => {
                let sessions = self.registry.list();
                if sessions.is_empty() {
                    self.send(&message.chat_id, "No active sessions.").await;
                    return;
                }
                let lines: Vec<String> = sessions
                    .iter()
                    .map(|s| {
                        format!(
                            "{}... | {} | {} msgs | {}",
                            s.short_id(),
                            s.status,
                            s.message_count,
                            s.work_dir
                        )
                    })
                    .collect();
                self.send(
                    &message.chat_id,
                    &format!("Active sessions:\n\n{}", lines.join("\n")),
                )
                .await;
            }
            _ => {} // unknown commands are ignored
        }
    }

    async fn handle_cd(&self, message: &IncomingMessage, args: &str) {
        let default_work_dir = &self.config.sessions.default_work_dir;
        if args.is_empty() {
            self.send(
                &message.chat_id,
                &format!("Current work dir: {default_work_dir}\n\nUsage: /cd /path/to/project"),
            )
            .await;
            return;
        }

        let dir = resolve_home(args);
        // compare symlink-resolved paths, so ~/projects matched against its
        // target still passes
        let resolved = std::fs::canonicalize(&dir).unwrap_or_else(|_| dir.clone());
        let resolved_default = std::fs::canonicalize(default_work_dir)
            .unwrap_or_else(|_| resolve_home(default_work_dir));

        if !resolved.starts_with(&resolved_default) && !resolved.starts_with("/mnt/pai-data") {
            self.send(
                &message.chat_id,
                &format!("Path not allowed. Must be under {default_work_dir} or /mnt/pai-data."),
            )
            .await;
            return;
        }

        if let Err(e) = self
            .registry
            .resolve_or_create(&message.user_id, &message.chat_id)
        {
            self.send(&message.chat_id, &format!("Error: {e}")).await;
            return;
        }
        let dir = dir.to_string_lossy().into_owned();
        self.registry.set_work_dir(&message.user_id, &dir);
        self.send(&message.chat_id, &format!("Work directory set to: {dir}"))
            .await;
    }
}

/// Apply the configured response mode. Concise and voice-only modes prefer
/// the voice line when one was extracted; full always carries the whole
/// cleaned response.
fn select_response_text(format: ResponseFormat, clean_text: &str, voice: Option<&str>) -> String {
    match format {
        ResponseFormat::Full => clean_text.to_string(),
        ResponseFormat::Concise | ResponseFormat::VoiceOnly => match voice {
            Some(voice) => voice.to_string(),
            None => clean_text.to_string(),
        },
    }
}
