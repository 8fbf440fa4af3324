use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Truncate to at most `max_len` bytes without splitting a multi-byte
/// character, appending `suffix` when anything was cut.
pub fn truncate_text(text: &str, max_len: usize, suffix: &str) -> String {
    if text.len() <= max_len {
        return text.to_string();
    }
    let mut end = max_len;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{}", &text[..end], suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_text("hello", 10, "..."), "hello");
        assert_eq!(truncate_text("hello world", 5, "..."), "hello...");
        // 🦀 is 4 bytes; cutting at byte 5 must back off to the boundary
        let out = truncate_text("a🦀🦀", 5, "...");
        assert_eq!(out, "a🦀...");
    }
}
