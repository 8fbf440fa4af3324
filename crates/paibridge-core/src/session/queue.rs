//! Follow-up queue: messages that arrive while a session is busy.
//!
//! The queue lives inside the `Session` behind its own lock. Callers enqueue
//! only after the runner rejected a message with `StillBusy`; once the
//! in-flight turn finishes, the dispatcher drains the queue and feeds the
//! batch back to the runner as a single synthetic follow-up.

use crate::error::{BridgeError, Result};
use crate::session::{Attachment, MAX_PENDING_MESSAGES, PendingMessage, Session};

/// Append a message to the session's follow-up queue. Returns the queue
/// depth after the append, or `QueueFull` at capacity.
pub fn enqueue(session: &Session, text: String, attachment: Option<Attachment>) -> Result<usize> {
    // empty-text entries are only meaningful when they carry an attachment
    debug_assert!(
        !text.is_empty() || attachment.is_some(),
        "queued an empty message with no attachment"
    );
    let mut pending = session.pending.lock().expect("queue lock poisoned");
    if pending.len() >= MAX_PENDING_MESSAGES {
        return Err(BridgeError::QueueFull);
    }
    pending.push(PendingMessage { text, attachment });
    Ok(pending.len())
}

/// Atomically take everything queued on the session. Safe on an empty queue.
pub fn drain(session: &Session) -> Vec<PendingMessage> {
    std::mem::take(&mut *session.pending.lock().expect("queue lock poisoned"))
}

/// Collapse drained messages into one synthetic follow-up prompt.
///
/// Text-file attachments are inlined into their message's body. Among binary
/// attachments the last one wins — the transport can only carry one per
/// invocation. Returns `(empty, None)` when there is nothing to say and no
/// binary payload.
pub fn build_batch(messages: &[PendingMessage]) -> (String, Option<Attachment>) {
    let total = messages.len();
    let mut sections: Vec<String> = Vec::new();
    let mut binary: Option<Attachment> = None;

    for (index, message) in messages.iter().enumerate() {
        let mut body = message.text.clone();

        match &message.attachment {
            Some(attachment) if attachment.is_binary() => {
                binary = Some(attachment.clone());
            }
            Some(attachment) => {
                if let Attachment::TextFile { content, .. } = attachment {
                    if !body.is_empty() {
                        body.push_str("\n\n");
                    }
                    body.push_str(&format!(
                        "--- {} ---\n{}\n--- end ---",
                        attachment.text_label(),
                        content
                    ));
                }
            }
            None => {}
        }

        if !body.is_empty() {
            sections.push(format!(
                "[Follow-up message {}/{}]:\n{}",
                index + 1,
                total,
                body
            ));
        }
    }

    if sections.is_empty() && binary.is_none() {
        return (String::new(), None);
    }

    let mut text = format!("[While you were working, I sent {total} follow-up message(s):]");
    for section in sections {
        text.push_str("\n\n");
        text.push_str(&section);
    }
    (text, binary)
}
