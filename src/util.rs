use std::time::{SystemTime, UNIX_EPOCH};

use blake3::Hash;

// ── Hashing / time ───────────────────────────────────────────────────────

pub(crate) fn blake3_hash(bytes: &[u8]) -> Hash {
    blake3::hash(bytes)
}

pub(crate) fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ── Environment helpers ──────────────────────────────────────────────────

pub(crate) fn env_required(name: &str) -> Result<String, Box<dyn std::error::Error>> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(format!("missing required env var: {name}").into()),
    }
}

pub(crate) fn env_optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub(crate) fn env_u64(name: &str, default: u64) -> u64 {
    env_optional(name)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_usize(name: &str, default: usize) -> usize {
    env_optional(name)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

pub(crate) fn env_bool(name: &str, default: bool) -> bool {
    match env_optional(name) {
        Some(v) => matches!(v.trim(), "1" | "true" | "yes"),
        None => default,
    }
}

// ── Backoff helpers ──────────────────────────────────────────────────────

pub(crate) fn jitter_ratio() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

pub(crate) fn parse_retry_after(resp: &ureq::Response) -> Option<f64> {
    resp.header("retry-after")
        .and_then(|v| v.trim().parse::<f64>().ok())
}

// ── Audit sanitization ───────────────────────────────────────────────────

const SECRET_KEY_MARKERS: &[&str] = &["token", "secret", "password", "api_key", "authorization"];

/// Replace values of secret-named keys before an argument map touches the
/// audit trail.
pub(crate) fn redact_args(args: &serde_json::Value) -> serde_json::Value {
    match args {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                let lower = key.to_ascii_lowercase();
                if SECRET_KEY_MARKERS.iter().any(|m| lower.contains(m)) {
                    out.insert(key.clone(), serde_json::Value::String("[redacted]".into()));
                } else {
                    out.insert(key.clone(), redact_args(value));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_args).collect())
        }
        other => other.clone(),
    }
}

/// Truncate on a char boundary, appending an ellipsis marker when cut.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}

pub(crate) const AUDIT_SUMMARY_CHARS: usize = 400;

/// What goes into an audit record's result column: truncated, single-spaced.
pub(crate) fn summarize_for_audit(output: &str) -> String {
    let collapsed: String = output.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, AUDIT_SUMMARY_CHARS)
}

/// Compact single-line rendering of an argument map for human prompts.
pub(crate) fn format_args_preview(args: &serde_json::Value, max_chars: usize) -> String {
    let text = match args {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    };
    truncate_chars(&text, max_chars)
}
