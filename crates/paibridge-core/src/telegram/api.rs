//! Minimal Telegram Bot API client using reqwest. Only the handful of
//! methods the bridge needs.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

/// Refuse to download attachments larger than this.
const MAX_DOWNLOAD_SIZE: usize = 50 * 1024 * 1024;

pub struct TelegramApi {
    client: reqwest::Client,
    base_url: String,
    file_url: String,
}

// --- Response types ---

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub from: Option<User>,
    pub chat: Chat,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub photo: Option<Vec<PhotoSize>>,
    pub document: Option<Document>,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
}

#[derive(Debug, Deserialize)]
pub struct Document {
    pub file_id: String,
    pub file_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct File {
    pub file_path: Option<String>,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl TelegramApi {
    pub fn new(bot_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{bot_token}"),
            file_url: format!("https://api.telegram.org/file/bot{bot_token}"),
        }
    }

    pub async fn get_updates(&self, offset: Option<i64>, timeout: u32) -> Result<Vec<Update>> {
        let mut body = serde_json::json!({
            "timeout": timeout,
            "allowed_updates": ["message"],
        });
        if let Some(offset) = offset {
            body["offset"] = serde_json::Value::Number(offset.into());
        }

        let resp: ApiResponse<Vec<Update>> = self
            .client
            .post(format!("{}/getUpdates", self.base_url))
            .json(&body)
            .timeout(Duration::from_secs((timeout + 10) as u64))
            .send()
            .await?
            .json()
            .await?;

        if !resp.ok {
            bail!("getUpdates failed: {}", resp.description.unwrap_or_default());
        }
        Ok(resp.result.unwrap_or_default())
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        self.post(
            "sendMessage",
            &serde_json::json!({"chat_id": chat_id, "text": text}),
        )
        .await
    }

    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        self.post(
            "sendChatAction",
            &serde_json::json!({"chat_id": chat_id, "action": action}),
        )
        .await
    }

    pub async fn get_file(&self, file_id: &str) -> Result<File> {
        let resp: ApiResponse<File> = self
            .client
            .post(format!("{}/getFile", self.base_url))
            .json(&serde_json::json!({"file_id": file_id}))
            .send()
            .await?
            .json()
            .await?;

        if !resp.ok {
            bail!("getFile failed: {}", resp.description.unwrap_or_default());
        }
        resp.result.context("getFile returned no result")
    }

    /// Download a file previously resolved with `get_file`.
    pub async fn download_file(&self, file_path: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(format!("{}/{file_path}", self.file_url))
            .timeout(Duration::from_secs(30))
            .send()
            .await?
            .error_for_status()?;
        let data = resp.bytes().await?;
        if data.len() > MAX_DOWNLOAD_SIZE {
            bail!("file exceeds the {MAX_DOWNLOAD_SIZE} byte download limit");
        }
        Ok(data.to_vec())
    }

    pub async fn send_photo(&self, chat_id: i64, path: &Path) -> Result<()> {
        self.upload("sendPhoto", "photo", chat_id, path).await
    }

    pub async fn send_document(&self, chat_id: i64, path: &Path) -> Result<()> {
        self.upload("sendDocument", "document", chat_id, path).await
    }

    async fn upload(&self, method: &str, field: &'static str, chat_id: i64, path: &Path) -> Result<()> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());

        let form = reqwest::multipart::Form::new()
            .text("chat_id", chat_id.to_string())
            .part(field, reqwest::multipart::Part::bytes(data).file_name(file_name));

        let resp: ApiResponse<serde_json::Value> = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;

        if !resp.ok {
            bail!(
                "Telegram API {method} failed: {}",
                resp.description.unwrap_or_default()
            );
        }
        Ok(())
    }

    async fn post(&self, method: &str, body: &serde_json::Value) -> Result<()> {
        let resp: ApiResponse<serde_json::Value> = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .json(body)
            .send()
            .await?
            .json()
            .await?;

        if !resp.ok {
            bail!(
                "Telegram API {method} failed: {}",
                resp.description.unwrap_or_default()
            );
        }
        Ok(())
    }
}
