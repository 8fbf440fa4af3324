//! Session data model.

pub mod queue;
pub mod registry;
pub mod runner;
pub mod sweeper;

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::SessionsConfig;
use crate::util::now_millis;

/// Upper bound on queued follow-up messages per session.
pub const MAX_PENDING_MESSAGES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Idle, accepting input.
    #[default]
    Active,
    /// An assistant invocation is in flight.
    Busy,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionStatus::Active => f.write_str("active"),
            SessionStatus::Busy => f.write_str("busy"),
        }
    }
}

/// A single user's conversation state.
///
/// Cloning a `Session` yields a snapshot of its scalar fields; the follow-up
/// queue is shared between clones through the inner `Arc`, and is guarded by
/// its own lock, distinct from the registry lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub chat_id: String,
    pub work_dir: String,
    pub model: String,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub message_count: u64,
    pub status: SessionStatus,
    /// Resume token returned by claude on its first event. Empty until the
    /// first turn completes the handshake.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub claude_session_id: String,
    #[serde(skip)]
    pub pending: Arc<Mutex<Vec<PendingMessage>>>,
}

impl Session {
    pub fn new(user_id: &str, chat_id: &str, sessions: &SessionsConfig) -> Self {
        let now = now_millis();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            chat_id: chat_id.to_string(),
            work_dir: sessions.default_work_dir.clone(),
            model: sessions.default_model.clone(),
            created_at: now,
            last_activity_at: now,
            message_count: 0,
            status: SessionStatus::Active,
            claude_session_id: String::new(),
            pending: Arc::default(),
        }
    }

    pub fn is_busy(&self) -> bool {
        self.status == SessionStatus::Busy
    }

    /// First eight characters of the session id, used in log lines and
    /// summary file names.
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

pub fn short_id(id: &str) -> &str {
    &id[..id.len().min(8)]
}

/// A message received while the session was busy, waiting in the follow-up
/// queue.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub text: String,
    pub attachment: Option<Attachment>,
}

/// A file the user attached to a chat message. Binary payloads are held as
/// raw bytes and base64-encoded at the point they are written to the
/// subprocess.
#[derive(Debug, Clone)]
pub enum Attachment {
    Image {
        data: Vec<u8>,
        media_type: String,
    },
    Document {
        data: Vec<u8>,
        media_type: String,
        file_name: String,
    },
    /// Inline text content (source files, configs, logs). Never sent as a
    /// binary payload — inlined into the prompt instead.
    TextFile {
        content: String,
        file_name: Option<String>,
    },
}

impl Attachment {
    pub fn is_binary(&self) -> bool {
        !matches!(self, Attachment::TextFile { .. })
    }

    /// Label used when a text file is inlined into a prompt.
    pub fn text_label(&self) -> &str {
        match self {
            Attachment::TextFile {
                file_name: Some(name),
                ..
            } if !name.is_empty() => name,
            _ => "document",
        }
    }
}
