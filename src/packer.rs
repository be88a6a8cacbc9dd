// Context Packer
// Selects and orders notes under a token budget for synthesis, and clamps
// text destined for the embedding service to its token ceiling.

use crate::types::Note;

/// Tokens per word heuristic; budgets are soft targets.
const TOKENS_PER_WORD: f64 = 1.3;

/// Embedding services commonly cap payloads near this many tokens.
const EMBED_TOKEN_CEILING: usize = 512;

/// Safety factor applied under the ceiling before the first attempt.
const EMBED_SAFETY: f64 = 0.8;

/// Marks clamped embedding payloads.
pub const TRUNCATION_SENTINEL: &str = "…";

/// Approximate token count from whitespace-separated words.
pub fn estimate_tokens(text: &str) -> i64 {
    let words = text.split_whitespace().count();
    (words as f64 * TOKENS_PER_WORD).ceil() as i64
}

/// Greedy pack of notes under `budget` tokens, at most `max_notes` entries.
///
/// Candidates are ordered by (importance desc, token_count desc). A note that
/// would overflow the budget is skipped and scanning continues, so smaller
/// lower-ranked notes can still fill the remainder. Output order matches
/// selection order.
pub fn pack_notes(notes: &[Note], budget: i64, max_notes: usize) -> Vec<Note> {
    let mut ordered: Vec<&Note> = notes.iter().collect();
    ordered.sort_by(|a, b| {
        b.importance
            .cmp(&a.importance)
            .then(b.token_count.cmp(&a.token_count))
    });

    let mut packed = Vec::new();
    let mut used: i64 = 0;
    for note in ordered {
        if packed.len() >= max_notes {
            break;
        }
        if used + note.token_count > budget {
            continue;
        }
        used += note.token_count;
        packed.push(note.clone());
    }
    packed
}

/// Shrink text until it fits under the embedding token ceiling.
///
/// Starts at ceiling x safety, then cuts 10% per round. Truncation is marked
/// with a sentinel ellipsis so downstream readers can tell the text was cut.
pub fn clamp_for_embedding(text: &str) -> String {
    let target = (EMBED_TOKEN_CEILING as f64 * EMBED_SAFETY) as i64;
    if estimate_tokens(text) <= target {
        return text.to_string();
    }

    let mut keep = text.chars().count();
    let mut clamped: String = text.to_string();
    loop {
        keep = (keep as f64 * 0.9) as usize;
        if keep == 0 {
            return TRUNCATION_SENTINEL.to_string();
        }
        clamped = text.chars().take(keep).collect();
        if estimate_tokens(&clamped) <= target {
            break;
        }
    }
    format!("{}{}", clamped.trim_end(), TRUNCATION_SENTINEL)
}

/// One further 10% shrink for retry-after-rejection loops.
pub fn shrink_once(text: &str) -> String {
    let trimmed = text.trim_end_matches(TRUNCATION_SENTINEL);
    let keep = (trimmed.chars().count() as f64 * 0.9) as usize;
    if keep == 0 {
        return TRUNCATION_SENTINEL.to_string();
    }
    let shorter: String = trimmed.chars().take(keep).collect();
    format!("{}{}", shorter.trim_end(), TRUNCATION_SENTINEL)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NoteRole;
    use chrono::Utc;

    fn note(id: &str, importance: i64, token_count: i64) -> Note {
        Note {
            id: id.to_string(),
            job_id: "job".to_string(),
            step_id: None,
            role: NoteRole::PageSummary,
            importance,
            token_count,
            content: format!("note {}", id),
            source_url: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn estimate_scales_word_count() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one two three four"), 6); // ceil(4 * 1.3)
    }

    #[test]
    fn packs_highest_importance_within_budget_and_cap() {
        // 40 notes, importance cycling 5,4,3,..., 500 tokens each.
        // Budget 3000 fits 6; the 6 highest-importance notes win.
        let notes: Vec<Note> = (0..40)
            .map(|i| note(&format!("n{}", i), 5 - (i as i64 % 5), 500))
            .collect();

        let packed = pack_notes(&notes, 3000, 8);
        assert_eq!(packed.len(), 6);
        assert!(packed.iter().all(|n| n.importance == 5));
        let total: i64 = packed.iter().map(|n| n.token_count).sum();
        assert!(total <= 3000);
    }

    #[test]
    fn never_returns_more_than_cap() {
        let notes: Vec<Note> = (0..20).map(|i| note(&format!("n{}", i), 3, 10)).collect();
        let packed = pack_notes(&notes, 100_000, 8);
        assert_eq!(packed.len(), 8);
    }

    #[test]
    fn oversized_note_is_skipped_not_fatal() {
        let notes = vec![
            note("big", 5, 5000),
            note("mid", 4, 100),
            note("small", 3, 50),
        ];
        let packed = pack_notes(&notes, 200, 8);
        let ids: Vec<&str> = packed.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["mid", "small"]);
    }

    #[test]
    fn selection_is_prefix_of_ranked_order_modulo_skips() {
        let notes = vec![
            note("a", 5, 120),
            note("b", 5, 80),
            note("c", 4, 300), // skipped: overflows
            note("d", 4, 40),
        ];
        let packed = pack_notes(&notes, 250, 8);
        let ids: Vec<&str> = packed.iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "d"]);
    }

    #[test]
    fn clamp_leaves_short_text_alone() {
        let text = "short text";
        assert_eq!(clamp_for_embedding(text), text);
    }

    #[test]
    fn clamp_truncates_long_text_with_sentinel() {
        let text = "word ".repeat(2000);
        let clamped = clamp_for_embedding(&text);
        assert!(clamped.ends_with(TRUNCATION_SENTINEL));
        assert!(estimate_tokens(&clamped) <= (512.0 * 0.8) as i64 + 2);
    }

    #[test]
    fn shrink_once_reduces_length() {
        let text = "word ".repeat(100);
        let shorter = shrink_once(&text);
        assert!(shorter.chars().count() < text.chars().count());
        assert!(shorter.ends_with(TRUNCATION_SENTINEL));
    }
}
