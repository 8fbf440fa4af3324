//! The stream-json protocol spoken by the claude CLI.
//!
//! Stdout is one self-delimiting JSON record per line, discriminated on the
//! `type` field. The parser is deliberately tolerant: unknown record kinds
//! and unknown content blocks deserialize into fallback variants and are
//! ignored, and lines that are not valid JSON are skipped.

use std::sync::LazyLock;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use regex::Regex;
use serde::Deserialize;

use crate::session::Attachment;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System {
        #[serde(default)]
        session_id: Option<String>,
    },
    #[serde(rename = "assistant")]
    Assistant {
        #[serde(default)]
        message: Option<AssistantMessage>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

/// Parse one stdout line. Empty and malformed lines yield `None`.
pub fn parse_line(line: &str) -> Option<StreamEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

impl StreamEvent {
    /// The conversation id carried by a `system` record, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            StreamEvent::System {
                session_id: Some(sid),
            } if !sid.is_empty() => Some(sid),
            _ => None,
        }
    }
}

/// Accumulates the assistant's text and tool-produced file paths across the
/// records of one turn.
#[derive(Debug, Default)]
pub struct ResponseCollector {
    text: String,
    files: Vec<String>,
}

// Files created through shell redirection (`> /path.ext`) and through
// explicit output flags (`-o` / `--output`).
static REDIRECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r">\s*(/\S+\.\w+)").unwrap());
static OUTPUT_FLAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?:-o|--output)\s+["']?(\S+\.\w+)["']?"#).unwrap());

impl ResponseCollector {
    /// Fold one event into the collected response.
    pub fn absorb(&mut self, event: &StreamEvent) {
        let StreamEvent::Assistant {
            message: Some(message),
        } = event
        else {
            return;
        };

        for block in &message.content {
            match block {
                ContentBlock::Text { text } => self.text.push_str(text),
                ContentBlock::ToolUse { name, input } => self.absorb_tool_use(name, input),
                ContentBlock::Other => {}
            }
        }
    }

    fn absorb_tool_use(&mut self, name: &str, input: &serde_json::Value) {
        match name {
            "Write" => {
                if let Some(path) = input.get("file_path").and_then(|v| v.as_str()) {
                    self.push_file(path);
                }
            }
            "Bash" => {
                if let Some(command) = input.get("command").and_then(|v| v.as_str()) {
                    for captures in REDIRECT_RE.captures_iter(command) {
                        self.push_file(&captures[1]);
                    }
                    for captures in OUTPUT_FLAG_RE.captures_iter(command) {
                        self.push_file(&captures[1]);
                    }
                }
            }
            _ => {}
        }
    }

    fn push_file(&mut self, path: &str) {
        if !self.files.iter().any(|f| f == path) {
            self.files.push(path.to_string());
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn into_parts(self) -> (String, Vec<String>) {
        (self.text, self.files)
    }
}

/// Build the single JSON object written to the subprocess's stdin when a
/// turn carries a binary attachment: the base64 payload as one content part,
/// the prompt as a trailing text part.
///
/// Bare attachments get a default prompt so the assistant has something to
/// respond to.
pub fn stdin_user_message(attachment: &Attachment, prompt: &str) -> serde_json::Value {
    let mut content = Vec::new();

    match attachment {
        Attachment::Image { data, media_type } => {
            content.push(serde_json::json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": BASE64.encode(data),
                },
            }));
        }
        Attachment::Document {
            data, media_type, ..
        } => {
            content.push(serde_json::json!({
                "type": "document",
                "source": {
                    "type": "base64",
                    "media_type": media_type,
                    "data": BASE64.encode(data),
                },
            }));
        }
        Attachment::TextFile { .. } => {}
    }

    let prompt = if prompt.is_empty() {
        match attachment {
            Attachment::Image { .. } => "What is in this image?",
            _ => "Please analyze this document.",
        }
    } else {
        prompt
    };
    content.push(serde_json::json!({"type": "text", "text": prompt}));

    serde_json::json!({
        "type": "user",
        "message": {"role": "user", "content": content},
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(lines: &[&str]) -> ResponseCollector {
        let mut collector = ResponseCollector::default();
        for line in lines {
            if let Some(event) = parse_line(line) {
                collector.absorb(&event);
            }
        }
        collector
    }

    #[test]
    fn text_blocks_concatenate() {
        let collector = collect(&[
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"First "}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Second"}]}}"#,
        ]);
        assert_eq!(collector.text(), "First Second");
    }

    #[test]
    fn tool_use_and_unknown_blocks_produce_no_text() {
        let collector = collect(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/tmp/x"}}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hmm"}]}}"#,
            r#"{"type":"system","session_id":"abc"}"#,
            r#"{"type":"user"}"#,
        ]);
        assert_eq!(collector.text(), "");
        let (_, files) = collector.into_parts();
        assert!(files.is_empty());
    }

    #[test]
    fn write_tool_records_file_path() {
        let collector = collect(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Write","input":{"file_path":"/tmp/output.txt"}}]}}"#,
        ]);
        let (_, files) = collector.into_parts();
        assert_eq!(files, vec!["/tmp/output.txt"]);
    }

    #[test]
    fn bash_redirect_and_output_flag() {
        let collector = collect(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"echo hello > /tmp/out.txt"}}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"curl -o /tmp/download.json http://example.com"}}]}}"#,
        ]);
        let (_, files) = collector.into_parts();
        assert_eq!(files, vec!["/tmp/out.txt", "/tmp/download.json"]);
    }

    #[test]
    fn duplicate_files_kept_once_in_first_seen_order() {
        let collector = collect(&[
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Write","input":{"file_path":"/tmp/a.txt"}}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"cat x > /tmp/a.txt"}}]}}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Write","input":{"file_path":"/tmp/b.txt"}}]}}"#,
        ]);
        let (_, files) = collector.into_parts();
        assert_eq!(files, vec!["/tmp/a.txt", "/tmp/b.txt"]);
    }

    #[test]
    fn system_event_carries_session_id() {
        let event = parse_line(r#"{"type":"system","session_id":"abc-123","model":"x"}"#).unwrap();
        assert_eq!(event.session_id(), Some("abc-123"));

        let event = parse_line(r#"{"type":"system","subtype":"init"}"#).unwrap();
        assert_eq!(event.session_id(), None);
    }

    #[test]
    fn malformed_and_unknown_lines_are_skipped() {
        assert!(parse_line("").is_none());
        assert!(parse_line("not json").is_none());
        assert!(parse_line(r#"{"no_type":true}"#).is_none());
        assert!(matches!(
            parse_line(r#"{"type":"result","is_error":false}"#),
            Some(StreamEvent::Other)
        ));
    }

    #[test]
    fn stdin_message_layout_for_image() {
        let attachment = Attachment::Image {
            data: b"fake image bytes".to_vec(),
            media_type: "image/png".to_string(),
        };
        let msg = stdin_user_message(&attachment, "what is this?");

        assert_eq!(msg["type"], "user");
        assert_eq!(msg["message"]["role"], "user");
        let content = msg["message"]["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "image");
        assert_eq!(content[0]["source"]["type"], "base64");
        assert_eq!(content[0]["source"]["media_type"], "image/png");
        assert_eq!(
            content[0]["source"]["data"],
            BASE64.encode(b"fake image bytes")
        );
        assert_eq!(content[1]["type"], "text");
        assert_eq!(content[1]["text"], "what is this?");
    }

    #[test]
    fn stdin_message_default_prompts() {
        let image = Attachment::Image {
            data: vec![1],
            media_type: "image/jpeg".to_string(),
        };
        let msg = stdin_user_message(&image, "");
        let content = msg["message"]["content"].as_array().unwrap();
        assert_eq!(content[1]["text"], "What is in this image?");

        let pdf = Attachment::Document {
            data: vec![1],
            media_type: "application/pdf".to_string(),
            file_name: "report.pdf".to_string(),
        };
        let msg = stdin_user_message(&pdf, "");
        let content = msg["message"]["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "document");
        assert_eq!(content[1]["text"], "Please analyze this document.");
    }
}
