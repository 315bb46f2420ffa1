//! services/sync/src/aligner.rs
//!
//! Matches timestamped transcription fragments against a window of book
//! text using sliding-window fuzzy search, yielding time→text anchors.
//!
//! The search is deterministic: identical inputs always produce identical
//! anchors. Ties between equally good windows resolve to the earliest
//! character offset.

use audiosync_core::domain::{SyncAnchor, TranscriptSegment};

use crate::config::SyncConfig;
use crate::text::{normalize_for_match, WordMap};

/// Words per search window.
const WINDOW_WORDS: usize = 50;
/// Window stride; windows overlap by half.
const STRIDE_WORDS: usize = 25;
/// Word step when sliding a fragment inside one window.
const SUB_STRIDE_WORDS: usize = 5;
/// Maximum accepted normalized edit distance.
const MAX_DISTANCE: f64 = 0.4;
/// Minimum characters a fragment and a window slice must share.
const MIN_OVERLAP_CHARS: usize = 10;
/// Fragments shorter than this (trimmed) are ignored.
const MIN_FRAGMENT_CHARS: usize = 10;
/// Cheap token-overlap prefilter: only the best windows get the expensive
/// edit-distance pass. When no window shares a token at all, every window
/// is scanned instead.
const MAX_CANDIDATE_WINDOWS: usize = 6;
const MIN_TOKEN_OVERLAP: f64 = 0.3;

struct Window {
    /// Character offset of the window start in the searched text.
    offset: usize,
    words: Vec<String>,
}

/// Sliding-window fuzzy matcher from transcript fragments to text offsets.
#[derive(Debug, Clone)]
pub struct FuzzyAligner {
    confidence_floor: f64,
}

impl FuzzyAligner {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            confidence_floor: config.anchor_confidence_floor,
        }
    }

    /// Matches each fragment against the text and returns the accepted
    /// anchors sorted by audio time.
    ///
    /// Character indexes in the result are offsets into `text`; callers
    /// matching against a slice of the book translate them back by adding
    /// the slice start.
    pub fn align(&self, text: &str, fragments: &[TranscriptSegment]) -> Vec<SyncAnchor> {
        let windows = build_windows(text);
        if windows.is_empty() {
            return Vec::new();
        }

        let mut anchors: Vec<SyncAnchor> = Vec::new();
        for fragment in fragments {
            let trimmed = fragment.text.trim();
            if trimmed.len() < MIN_FRAGMENT_CHARS {
                continue;
            }
            if let Some((char_index, confidence)) = self.best_match(&windows, trimmed) {
                if confidence > self.confidence_floor {
                    anchors.push(SyncAnchor {
                        audio_time: fragment.start,
                        char_index,
                        confidence,
                    });
                }
            }
        }

        anchors.sort_by(|a, b| a.audio_time.total_cmp(&b.audio_time));
        anchors
    }

    /// Best `(window_offset, confidence)` for one fragment, or `None` when
    /// no window clears the distance ceiling.
    fn best_match(&self, windows: &[Window], fragment: &str) -> Option<(usize, f64)> {
        let frag_norm = normalize_for_match(fragment);
        if frag_norm.is_empty() {
            return None;
        }
        let frag_words: Vec<&str> = frag_norm.split(' ').collect();

        // A transcript can garble every single token and still sit inside
        // the edit-distance ceiling, so an empty prefilter result falls back
        // to scanning every window rather than dropping the fragment.
        let mut candidates = candidate_windows(windows, &frag_words);
        if candidates.is_empty() {
            candidates = windows.iter().collect();
        }

        let mut best: Option<(usize, f64)> = None;
        for window in candidates {
            let similarity = best_similarity_in_window(window, &frag_words, &frag_norm);
            let accept = 1.0 - similarity <= MAX_DISTANCE;
            if !accept {
                continue;
            }
            match best {
                Some((_, current)) if similarity <= current => {}
                _ => best = Some((window.offset, similarity)),
            }
        }
        best
    }
}

fn build_windows(text: &str) -> Vec<Window> {
    let map = WordMap::new(text);
    let total = map.word_count();
    let mut windows = Vec::new();
    let mut start = 0usize;
    while start < total {
        let end = (start + WINDOW_WORDS).min(total);
        let (char_start, char_end) = map.char_range(start, end);
        let words = normalize_for_match(&text[char_start..char_end])
            .split(' ')
            .filter(|w| !w.is_empty())
            .map(str::to_owned)
            .collect();
        windows.push(Window {
            offset: char_start,
            words,
        });
        if end == total {
            break;
        }
        start += STRIDE_WORDS;
    }
    windows
}

/// Ranks windows by shared-token ratio and keeps the best few. Stable by
/// window order so equally ranked windows keep their text order.
fn candidate_windows<'w>(windows: &'w [Window], frag_words: &[&str]) -> Vec<&'w Window> {
    let mut scored: Vec<(f64, usize)> = windows
        .iter()
        .enumerate()
        .map(|(idx, window)| {
            let shared = frag_words
                .iter()
                .filter(|fw| window.words.iter().any(|ww| ww == *fw))
                .count();
            (shared as f64 / frag_words.len().max(1) as f64, idx)
        })
        .filter(|(ratio, _)| *ratio >= MIN_TOKEN_OVERLAP)
        .collect();
    scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
    scored
        .into_iter()
        .take(MAX_CANDIDATE_WINDOWS)
        .map(|(_, idx)| &windows[idx])
        .collect()
}

/// Slides the fragment across word-aligned slices of one window and returns
/// the best normalized Levenshtein similarity.
fn best_similarity_in_window(window: &Window, frag_words: &[&str], frag_norm: &str) -> f64 {
    let frag_len = frag_words.len();
    if window.words.is_empty() {
        return 0.0;
    }

    let last_start = window.words.len().saturating_sub(frag_len);
    let mut best = 0.0f64;
    let mut pos = 0usize;
    loop {
        let end = (pos + frag_len).min(window.words.len());
        let slice = window.words[pos..end].join(" ");
        if slice.len().min(frag_norm.len()) >= MIN_OVERLAP_CHARS {
            let similarity = strsim::normalized_levenshtein(frag_norm, &slice);
            if similarity > best {
                best = similarity;
            }
        }
        if pos >= last_start {
            break;
        }
        pos = (pos + SUB_STRIDE_WORDS).min(last_start);
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(start: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start,
            end: start + 5.0,
            text: text.to_string(),
        }
    }

    fn sample_text() -> String {
        (0..400)
            .map(|i| format!("word{i:03}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[test]
    fn exact_fragment_matches_its_window() {
        let text = sample_text();
        let aligner = FuzzyAligner::new(&SyncConfig::default());
        let fragments = vec![fragment(12.0, "word100 word101 word102 word103 word104")];

        let anchors = aligner.align(&text, &fragments);
        assert_eq!(anchors.len(), 1);
        assert!((anchors[0].audio_time - 12.0).abs() < f64::EPSILON);
        assert!(anchors[0].confidence > 0.9);
        // Ties between equally good windows resolve to the earliest one;
        // words 100..104 are fully covered from the window at word 75 on.
        let expected_offset = text.find("word075").unwrap();
        assert_eq!(anchors[0].char_index, expected_offset);
    }

    #[test]
    fn noisy_fragment_still_matches() {
        let text = sample_text();
        let aligner = FuzzyAligner::new(&SyncConfig::default());
        // A few transcription mistakes inside an otherwise correct span.
        let fragments = vec![fragment(
            30.0,
            "word150 werd151 word152 word153 word1x4 word155",
        )];

        let anchors = aligner.align(&text, &fragments);
        assert_eq!(anchors.len(), 1);
        assert!(anchors[0].confidence > 0.5);
    }

    #[test]
    fn garbled_fragment_with_no_exact_tokens_still_matches() {
        let text = sample_text();
        let aligner = FuzzyAligner::new(&SyncConfig::default());
        // Every token is misheard by one character, so no window shares a
        // single exact token with the fragment.
        let fragments = vec![fragment(
            45.0,
            "ward150 ward151 ward152 ward153 ward154 ward155",
        )];

        let anchors = aligner.align(&text, &fragments);
        assert_eq!(anchors.len(), 1);
        assert!(anchors[0].confidence > 0.5);
        let expected_offset = text.find("word125").unwrap();
        assert!(anchors[0].char_index >= expected_offset);
        assert!(anchors[0].char_index <= text.find("word150").unwrap());
    }

    #[test]
    fn gibberish_produces_no_anchor() {
        let text = sample_text();
        let aligner = FuzzyAligner::new(&SyncConfig::default());
        let fragments = vec![fragment(5.0, "completely unrelated spoken content here")];

        assert!(aligner.align(&text, &fragments).is_empty());
    }

    #[test]
    fn short_fragments_are_ignored() {
        let text = sample_text();
        let aligner = FuzzyAligner::new(&SyncConfig::default());
        let fragments = vec![fragment(5.0, "word10")];

        assert!(aligner.align(&text, &fragments).is_empty());
    }

    #[test]
    fn anchors_are_sorted_by_audio_time() {
        let text = sample_text();
        let aligner = FuzzyAligner::new(&SyncConfig::default());
        let fragments = vec![
            fragment(90.0, "word300 word301 word302 word303 word304"),
            fragment(10.0, "word050 word051 word052 word053 word054"),
        ];

        let anchors = aligner.align(&text, &fragments);
        assert_eq!(anchors.len(), 2);
        assert!(anchors[0].audio_time < anchors[1].audio_time);
        assert!(anchors[0].char_index < anchors[1].char_index);
    }

    #[test]
    fn alignment_is_deterministic() {
        let text = sample_text();
        let aligner = FuzzyAligner::new(&SyncConfig::default());
        let fragments = vec![
            fragment(10.0, "word050 word051 word052 word053 word054"),
            fragment(42.0, "word200 word201 word202 word203 word204"),
        ];

        let first = aligner.align(&text, &fragments);
        let second = aligner.align(&text, &fragments);
        assert_eq!(first, second);
    }

    #[test]
    fn empty_text_yields_no_anchors() {
        let aligner = FuzzyAligner::new(&SyncConfig::default());
        let fragments = vec![fragment(1.0, "some spoken words that are long enough")];
        assert!(aligner.align("", &fragments).is_empty());
    }
}
