//! services/sync/src/text.rs
//!
//! Word-level indexing over a book's plain text. Progressive sync works in
//! word coordinates (chunk sizes, overlaps, the synced frontier) while the
//! aligner and anchors work in character offsets; this map converts between
//! the two.
//!
//! Character offsets throughout the crate are byte positions into the UTF-8
//! plain text, so they can be used directly for slicing.

/// A precomputed index of whitespace-separated words to character spans.
#[derive(Debug, Clone)]
pub struct WordMap {
    /// `(start_char, end_char)` of each word, in order.
    spans: Vec<(usize, usize)>,
    text_len: usize,
}

impl WordMap {
    pub fn new(text: &str) -> Self {
        let mut spans = Vec::new();
        let mut word_start: Option<usize> = None;

        for (idx, ch) in text.char_indices() {
            if ch.is_whitespace() {
                if let Some(start) = word_start.take() {
                    spans.push((start, idx));
                }
            } else if word_start.is_none() {
                word_start = Some(idx);
            }
        }
        if let Some(start) = word_start {
            spans.push((start, text.len()));
        }

        Self {
            spans,
            text_len: text.len(),
        }
    }

    pub fn word_count(&self) -> usize {
        self.spans.len()
    }

    pub fn text_len(&self) -> usize {
        self.text_len
    }

    /// Character offset where word `index` starts. Indexes at or past the
    /// end map to the end of the text.
    pub fn char_for_word(&self, index: usize) -> usize {
        match self.spans.get(index) {
            Some(&(start, _)) => start,
            None => self.text_len,
        }
    }

    /// Index of the word containing (or, inside whitespace, following) the
    /// given character offset. Offsets past the last word clamp to
    /// `word_count()`.
    pub fn word_for_char(&self, char_index: usize) -> usize {
        self.spans.partition_point(|&(_, end)| end <= char_index)
    }

    /// Character range covering words `[word_start, word_end)`, both ends
    /// clamped to the text.
    pub fn char_range(&self, word_start: usize, word_end: usize) -> (usize, usize) {
        let start = self.char_for_word(word_start);
        let end = if word_end == 0 {
            start
        } else {
            match self.spans.get(word_end.saturating_sub(1)) {
                Some(&(_, end)) => end,
                None => self.text_len,
            }
        };
        (start, end.max(start))
    }
}

/// Collapses runs of whitespace to single spaces and trims. Used to
/// normalize both transcript fragments and book text before fuzzy
/// comparison.
pub fn normalize_for_match(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            for lower in ch.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        }
    }
    if out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Whitespace-token count, the word-count definition used for chapters and
/// session progress alike.
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}
