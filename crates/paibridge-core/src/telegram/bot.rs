//! Telegram long-polling loop and the outbound transport implementation.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::dispatch::{ChatTransport, Dispatcher, IncomingMessage, TransportProbe};
use crate::session::Attachment;
use crate::util::now_millis;

use super::api::{Message, TelegramApi};

/// Telegram rejects messages above 4096 chars; chunk below that.
const MESSAGE_CHUNK_LIMIT: usize = 4000;

/// Updated on every successful poll cycle; read by the health endpoint.
#[derive(Default)]
pub struct PollProbe {
    last_poll_at: AtomicI64,
}

impl TransportProbe for PollProbe {
    fn last_poll_at(&self) -> Option<i64> {
        match self.last_poll_at.load(Ordering::Relaxed) {
            0 => None,
            at => Some(at),
        }
    }
}

/// Outbound half of the transport.
pub struct TelegramTransport {
    api: Arc<TelegramApi>,
}

impl TelegramTransport {
    pub fn new(api: Arc<TelegramApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ChatTransport for TelegramTransport {
    async fn send_text(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let chat_id: i64 = chat_id.parse()?;
        for chunk in chunk_message(text, MESSAGE_CHUNK_LIMIT) {
            self.api.send_message(chat_id, &chunk).await?;
        }
        Ok(())
    }

    async fn send_file(&self, chat_id: &str, path: &Path) -> anyhow::Result<()> {
        let chat_id: i64 = chat_id.parse()?;
        if is_image_path(path) {
            self.api.send_photo(chat_id, path).await
        } else {
            self.api.send_document(chat_id, path).await
        }
    }

    async fn send_voice(&self, chat_id: &str, utterance: &str) -> anyhow::Result<()> {
        // no TTS here; the utterance is delivered as a marked text message
        let chat_id: i64 = chat_id.parse()?;
        self.api
            .send_message(chat_id, &format!("\u{1f5e3}\u{fe0f} {utterance}"))
            .await
    }

    async fn send_typing(&self, chat_id: &str) -> anyhow::Result<()> {
        let chat_id: i64 = chat_id.parse()?;
        self.api.send_chat_action(chat_id, "typing").await
    }
}

/// The long-polling loop. Each update is dispatched on its own task.
pub struct TelegramBot {
    api: Arc<TelegramApi>,
    dispatcher: Arc<Dispatcher>,
    probe: Arc<PollProbe>,
    running: Arc<AtomicBool>,
}

impl TelegramBot {
    pub fn new(api: Arc<TelegramApi>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            api,
            dispatcher,
            probe: Arc::new(PollProbe::default()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn probe(&self) -> Arc<PollProbe> {
        self.probe.clone()
    }

    /// Start polling in a background task.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting Telegram long-polling");

        let api = self.api.clone();
        let dispatcher = self.dispatcher.clone();
        let probe = self.probe.clone();
        let running = self.running.clone();

        tokio::spawn(async move {
            let mut offset: Option<i64> = None;
            while running.load(Ordering::SeqCst) {
                let updates = match api.get_updates(offset, 60).await {
                    Ok(updates) => {
                        probe.last_poll_at.store(now_millis(), Ordering::Relaxed);
                        updates
                    }
                    Err(e) => {
                        warn!(error = %e, "Telegram getUpdates failed");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                for update in updates {
                    offset = Some(update.update_id + 1);
                    let Some(message) = update.message else {
                        continue;
                    };
                    let api = api.clone();
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        handle_update(&api, &dispatcher, message).await;
                    });
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn handle_update(api: &TelegramApi, dispatcher: &Dispatcher, message: Message) {
    let Some(from) = &message.from else {
        return;
    };
    let user_id = from.id.to_string();
    let chat_id = message.chat.id.to_string();

    let (text, attachment) = if let Some(photo) = &message.photo
        && !photo.is_empty()
    {
        // Telegram sends several sizes; the last one is the largest
        let largest = &photo[photo.len() - 1];
        match fetch_attachment(api, &largest.file_id).await {
            Ok((data, file_path)) => {
                let media_type = image_mime_type(&file_path);
                (
                    message.caption.clone().unwrap_or_default(),
                    Some(Attachment::Image { data, media_type }),
                )
            }
            Err(e) => {
                let _ = api
                    .send_message(message.chat.id, &format!("Error downloading photo: {e}"))
                    .await;
                return;
            }
        }
    } else if let Some(document) = &message.document {
        let file_name = document
            .file_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "document".to_string());
        let ext = extension_of(&file_name);

        if ext != "pdf" && !is_text_ext(&ext) {
            let _ = api
                .send_message(
                    message.chat.id,
                    &format!(
                        "Unsupported file type: .{ext}. I can handle PDF, text, code, and data files."
                    ),
                )
                .await;
            return;
        }

        match fetch_attachment(api, &document.file_id).await {
            Ok((data, _)) => {
                let attachment = if ext == "pdf" {
                    Attachment::Document {
                        data,
                        media_type: "application/pdf".to_string(),
                        file_name,
                    }
                } else {
                    Attachment::TextFile {
                        content: String::from_utf8_lossy(&data).into_owned(),
                        file_name: Some(file_name),
                    }
                };
                (
                    message.caption.clone().unwrap_or_default(),
                    Some(attachment),
                )
            }
            Err(e) => {
                let _ = api
                    .send_message(message.chat.id, &format!("Error downloading document: {e}"))
                    .await;
                return;
            }
        }
    } else if let Some(text) = &message.text {
        if text.is_empty() {
            return;
        }
        (text.clone(), None)
    } else {
        return;
    };

    dispatcher
        .handle(IncomingMessage {
            user_id,
            chat_id,
            text,
            attachment,
        })
        .await;
}

async fn fetch_attachment(
    api: &TelegramApi,
    file_id: &str,
) -> anyhow::Result<(Vec<u8>, String)> {
    let file = api.get_file(file_id).await?;
    let file_path = file
        .file_path
        .ok_or_else(|| anyhow::anyhow!("file has no path"))?;
    let data = api.download_file(&file_path).await?;
    Ok((data, file_path))
}

fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

fn image_mime_type(file_path: &str) -> String {
    match extension_of(file_path).as_str() {
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "image/jpeg",
    }
    .to_string()
}

fn is_image_path(path: &Path) -> bool {
    matches!(
        path.extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .as_deref(),
        Some("png" | "jpg" | "jpeg" | "gif" | "webp")
    )
}

fn is_text_ext(ext: &str) -> bool {
    matches!(
        ext,
        "txt" | "md" | "csv" | "json" | "xml" | "html" | "yml" | "yaml" | "toml" | "ini"
            | "log" | "py" | "js" | "ts" | "sh" | "rb" | "go" | "rs" | "java" | "c" | "cpp"
            | "h" | "css" | "sql"
    )
}

/// Split a long message into chunks below the Telegram size limit,
/// preferring paragraph and line boundaries.
fn chunk_message(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= limit {
            chunks.push(remaining.to_string());
            break;
        }

        let window = floor_char_boundary(remaining, limit);
        let head = &remaining[..window];
        let mut split_at = head.rfind("\n\n").filter(|at| *at >= limit * 3 / 10);
        if split_at.is_none() {
            split_at = head.rfind('\n').filter(|at| *at >= limit * 3 / 10);
        }
        let split_at = split_at.unwrap_or(window);

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start_matches([' ', '\n']);
    }

    chunks
}

fn floor_char_boundary(text: &str, mut at: usize) -> usize {
    while at > 0 && !text.is_char_boundary(at) {
        at -= 1;
    }
    at
}
