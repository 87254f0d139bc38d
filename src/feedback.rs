//! Correction feedback: detect "that's wrong"-style messages, persist them,
//! and fold recent ones back into the system prompt as cautions.

use crate::{now_ts, truncate_chars, CorrectionRecord, StoreError, TraceStore};

/// Lowercased markers that flag a user message as a correction of the prior
/// assistant reply. Deliberately a plain substring scan: the loop treats this
/// as a pluggable predicate, not gate state.
const CORRECTION_MARKERS: &[&str] = &[
    "that's wrong",
    "thats wrong",
    "that's not right",
    "that's incorrect",
    "you're wrong",
    "not correct",
    "correction:",
    "actually,",
    "actually ",
    "no, it's",
    "no, its",
    "wrong.",
    "wrong!",
];

const MAX_STORED_CHARS: usize = 200;
const MAX_PROMPT_CORRECTIONS: usize = 3;
const MAX_PROMPT_ITEM_CHARS: usize = 80;

pub(crate) fn detect_correction(text: &str) -> bool {
    let trimmed = text.trim();
    if trimmed.len() < 2 {
        return false;
    }
    let lower = trimmed.to_lowercase();
    CORRECTION_MARKERS.iter().any(|m| lower.contains(m))
}

/// Persist a detected correction against the assistant output it corrects.
pub(crate) fn save_correction(
    store: &TraceStore,
    session: &str,
    original: &str,
    correction: &str,
) -> Result<i64, StoreError> {
    store.save_correction(&CorrectionRecord {
        id: None,
        ts_utc: now_ts(),
        session: session.to_string(),
        original: truncate_chars(original, MAX_STORED_CHARS),
        correction: truncate_chars(correction, MAX_STORED_CHARS),
        applied: false,
    })
}

/// Build the caution block injected into the system prompt, marking each
/// folded-in correction as applied (first fold-in only; the flag is one-way).
pub(crate) fn caution_block(store: &TraceStore, session: &str) -> Option<String> {
    let corrections = match store.recent_corrections(session, MAX_PROMPT_CORRECTIONS) {
        Ok(corrections) => corrections,
        Err(err) => {
            eprintln!("[feedback] failed to load corrections: {err}");
            return None;
        }
    };
    if corrections.is_empty() {
        return None;
    }
    let mut lines = vec!["## Past corrections from the user".to_string()];
    for rec in &corrections {
        lines.push(format!(
            "- You said \"{}\" and were corrected: \"{}\"",
            truncate_chars(&rec.original, MAX_PROMPT_ITEM_CHARS),
            truncate_chars(&rec.correction, MAX_PROMPT_ITEM_CHARS),
        ));
        if !rec.applied {
            if let Some(id) = rec.id {
                if let Err(err) = store.mark_correction_applied(id) {
                    eprintln!("[feedback] failed to mark correction applied: {err}");
                }
            }
        }
    }
    lines.push("Do not repeat these mistakes.".to_string());
    Some(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("lodestar_test");
        std::fs::create_dir_all(&dir).unwrap();
        dir.join(format!("feedback_{}_{name}.sqlite", std::process::id()))
    }

    #[test]
    fn detects_explicit_corrections() {
        assert!(detect_correction("That's wrong, the deadline is Friday"));
        assert!(detect_correction("you're wrong about the venue"));
        assert!(detect_correction("Correction: the job id was 48213"));
        assert!(detect_correction("Actually, I meant the February batch"));
        assert!(detect_correction("No, it's the Chicago group"));
    }

    #[test]
    fn ignores_ordinary_messages() {
        assert!(!detect_correction("search arxiv for topological insulators"));
        assert!(!detect_correction("thanks, that was right"));
        assert!(!detect_correction(""));
        assert!(!detect_correction("a"));
    }

    #[test]
    fn caution_block_marks_applied() {
        let path = temp_db_path("caution");
        let _ = std::fs::remove_file(&path);
        let store = TraceStore::open_or_create(&path).unwrap();

        save_correction(&store, "s1", "the talk is Monday", "no, it's Tuesday").unwrap();
        let block = caution_block(&store, "s1").unwrap();
        assert!(block.contains("the talk is Monday"));
        assert!(block.contains("no, it's Tuesday"));

        let stored = store.recent_corrections("s1", 5).unwrap();
        assert!(stored[0].applied);

        // No corrections for an unknown session
        assert!(caution_block(&store, "s2").is_none());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn stored_corrections_are_truncated() {
        let path = temp_db_path("truncate");
        let _ = std::fs::remove_file(&path);
        let store = TraceStore::open_or_create(&path).unwrap();

        let long = "x".repeat(500);
        save_correction(&store, "s1", &long, &long).unwrap();
        let stored = store.recent_corrections("s1", 1).unwrap();
        assert!(stored[0].original.chars().count() <= MAX_STORED_CHARS + 3);

        std::fs::remove_file(&path).ok();
    }
}
