//! Error taxonomy for the session layer.
//!
//! Every variant that can reach the dispatcher renders as the single chat
//! message shown to the user, so the `Display` strings are user-facing.

/// Errors surfaced by the session layer to the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The session is already processing a message. The caller should queue
    /// the message as a follow-up instead of retrying.
    #[error("Still processing your previous message. Please wait.")]
    StillBusy,

    /// No session exists for this user and the concurrency cap is reached.
    #[error("Max concurrent sessions reached. Use /clear to end your session first.")]
    ConcurrencyCap,

    /// The follow-up queue for the session is at capacity.
    #[error("Too many queued messages. Please wait for the current task to finish.")]
    QueueFull,

    /// The assistant could not find the resume token. The token has been
    /// wiped; the next message starts a fresh conversation.
    #[error("Session expired. Send your message again to start a new conversation.")]
    SessionExpired,

    /// The assistant subprocess exited non-zero with output on stderr.
    #[error("Claude exited: {0}")]
    AssistantFailed(String),

    /// Subprocess plumbing failed (spawn, pipes).
    #[error("failed to run claude: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
