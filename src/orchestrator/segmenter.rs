//! Sentence segmenter: slices streaming LLM text into sentence-sized TTS
//! requests.
//!
//! Tokens are appended to a buffer and complete sentences are drained as they
//! form. Contract: ordering preserved, no mid-sentence splits, no text
//! emitted twice. The residual fragment is flushed at stream end or before a
//! tool call.
//!
//! A break happens after terminal punctuation (`.`, `!`, `?`) when the next
//! character is whitespace or the buffer ends there — so `25.5` keeps
//! accumulating — and after every newline, since a line break from the model
//! always ends a spoken chunk.

/// Accumulates token deltas and yields completed sentences.
#[derive(Debug, Default)]
pub struct SentenceSegmenter {
    buffer: String,
}

impl SentenceSegmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a token delta; returns every sentence completed by it.
    pub fn push(&mut self, delta: &str) -> Vec<String> {
        self.buffer.push_str(delta);

        let mut sentences = Vec::new();
        while let Some(end) = self.first_break() {
            let tail = self.buffer.split_off(end);
            let head = std::mem::replace(&mut self.buffer, tail);
            let sentence = head.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_owned());
            }
        }
        sentences
    }

    /// Byte index just past the first sentence break in the buffer, if any.
    fn first_break(&self) -> Option<usize> {
        let mut chars = self.buffer.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            let end = i + c.len_utf8();
            match c {
                '\n' => return Some(end),
                '.' | '!' | '?' => match chars.peek() {
                    None => return Some(end),
                    Some((_, next)) if next.is_whitespace() => return Some(end),
                    // Inside a number or token ("25.5", "v1.2"); keep going.
                    Some(_) => {}
                },
                _ => {}
            }
        }
        None
    }

    /// Drain the residual fragment, if any.
    pub fn flush(&mut self) -> Option<String> {
        let remaining = std::mem::take(&mut self.buffer);
        let remaining = remaining.trim();
        if remaining.is_empty() {
            None
        } else {
            Some(remaining.to_owned())
        }
    }

    /// Discard buffered text without emitting it (barge-in path).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
