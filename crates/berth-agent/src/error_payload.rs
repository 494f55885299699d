use crate::error::BerthError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;
const MAX_LOG_LINE_BYTES: usize = 2 * 1024;

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error: bool,
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_logs: Vec<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn encode(
    code: &str,
    message: impl Into<String>,
    hint: Option<String>,
    recent_logs: Vec<String>,
) -> String {
    let payload = ErrorPayload {
        error: true,
        code: code.to_string(),
        message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
        hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
        recent_logs: recent_logs
            .iter()
            .map(|l| truncate_utf8(l, MAX_LOG_LINE_BYTES))
            .collect(),
    };

    serde_json::to_string_pretty(&payload).unwrap_or_else(|_| {
        "{\"error\":true,\"code\":\"INTERNAL\",\"message\":\"serialize_failed\"}".to_string()
    })
}

pub fn from_error(err: &BerthError, recent_logs: Vec<String>) -> String {
    encode(err.code(), err.to_string(), err.hint(), recent_logs)
}
