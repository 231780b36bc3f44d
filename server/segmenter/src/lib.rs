//! Sentence segmenter (C9, optional): turns incremental LLM text deltas
//! into sentence-sized chunks for a streaming TTS provider (spec §4.9).

use uuid::Uuid;

const MIN_CHUNK_CHARS: usize = 20;
const MAX_CHUNK_CHARS: usize = 150;

const ABBREVIATIONS: &[&str] = &[
    "Dr", "Mr", "Mrs", "Ms", "Prof", "etc", "vs", "e.g", "i.e", "Sr", "Jr", "Ph.D", "M.D", "B.A",
    "M.A", "U.S", "U.K",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPosition {
    First,
    Middle,
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceChunk {
    pub seq: u64,
    pub text: String,
    pub prev_text: Option<String>,
    pub position: ChunkPosition,
    pub session_id: Uuid,
}

pub struct SentenceSegmenter {
    session_id: Uuid,
    pending: String,
    next_seq: u64,
    last_emitted: Option<String>,
    finalized: bool,
}

impl SentenceSegmenter {
    pub fn new(session_id: Uuid) -> Self {
        Self { session_id, pending: String::new(), next_seq: 0, last_emitted: None, finalized: false }
    }

    /// Appends an incremental text delta and returns any sentence chunks
    /// it completes, in order.
    pub fn push_delta(&mut self, delta: &str) -> Vec<SentenceChunk> {
        self.pending.push_str(delta);
        self.drain_complete_sentences()
    }

    /// Flushes any remaining tail of at least [`MIN_CHUNK_CHARS`] as a
    /// single final chunk. Idempotent: a second call with no new input
    /// emits nothing (spec P7).
    pub fn finalize(&mut self) -> Vec<SentenceChunk> {
        if self.finalized {
            return Vec::new();
        }
        self.finalized = true;
        let tail = std::mem::take(&mut self.pending);
        let trimmed = tail.trim();
        if trimmed.len() < MIN_CHUNK_CHARS {
            if trimmed.is_empty() {
                return Vec::new();
            }
        }
        if trimmed.is_empty() {
            return Vec::new();
        }
        vec![self.make_chunk(trimmed.to_string(), ChunkPosition::Last)]
    }

    fn drain_complete_sentences(&mut self) -> Vec<SentenceChunk> {
        let mut chunks = Vec::new();
        loop {
            let mut search_from = 0;
            let boundary_end = loop {
                match find_next_boundary(&self.pending[search_from..]) {
                    Some(offset) => {
                        let candidate_end = search_from + offset;
                        if candidate_end < MIN_CHUNK_CHARS {
                            // Too short to stand alone; keep scanning
                            // further along for a boundary that, measured
                            // from the start of this buffer, qualifies.
                            search_from = candidate_end;
                            continue;
                        }
                        break Some(candidate_end);
                    }
                    None => break None,
                }
            };
            match boundary_end {
                Some(candidate_len) if candidate_len <= MAX_CHUNK_CHARS => {
                    let sentence: String = self.pending[..candidate_len].trim_end().to_string();
                    self.pending = self.pending[candidate_len..].trim_start().to_string();
                    let position =
                        if self.next_seq == 0 { ChunkPosition::First } else { ChunkPosition::Middle };
                    chunks.push(self.make_chunk(sentence, position));
                }
                // Either no boundary at all, or the first qualifying one
                // already exceeds the max: defer until finalize().
                _ => break,
            }
        }
        chunks
    }

    fn make_chunk(&mut self, text: String, position: ChunkPosition) -> SentenceChunk {
        let chunk = SentenceChunk {
            seq: self.next_seq,
            text: text.clone(),
            prev_text: self.last_emitted.clone(),
            position,
            session_id: self.session_id,
        };
        self.next_seq += 1;
        self.last_emitted = Some(text);
        chunk
    }
}

/// Finds the end offset (exclusive, pointing just past the boundary
/// punctuation) of the first candidate sentence boundary: one of `.!?`
/// followed by whitespace and an uppercase letter, where the token
/// immediately preceding the punctuation is not a known abbreviation.
fn find_next_boundary(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c == '.' || c == '!' || c == '?' {
            let rest = &text[i + 1..];
            let ws_len = rest.chars().take_while(|c| c.is_whitespace()).count();
            if ws_len > 0 {
                let after_ws = &rest[ws_len..];
                if after_ws.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false) {
                    let token = preceding_token(&text[..i]);
                    if !ABBREVIATIONS.contains(&token.as_str()) {
                        return Some(i + 1);
                    }
                }
            }
        }
        i += 1;
    }
    None
}

fn preceding_token(prefix: &str) -> String {
    prefix
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '.')
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abbreviation_does_not_terminate_sentence() {
        let mut seg = SentenceSegmenter::new(Uuid::nil());
        let c1 = seg.push_delta("Hello Dr. Smith. ");
        assert!(c1.is_empty(), "short prefix with abbreviation should not emit yet");
        let c2 = seg.push_delta("How are you?");
        assert!(c2.is_empty(), "no qualifying boundary mid-stream yet");
        let final_chunks = seg.finalize();
        assert_eq!(final_chunks.len(), 1);
        assert_eq!(final_chunks[0].text, "Hello Dr. Smith. How are you?");
        assert_eq!(final_chunks[0].position, ChunkPosition::Last);
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut seg = SentenceSegmenter::new(Uuid::nil());
        seg.push_delta("Short tail text that is long enough to flush.");
        let first = seg.finalize();
        let second = seg.finalize();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn long_sentence_splits_on_real_boundary() {
        let mut seg = SentenceSegmenter::new(Uuid::nil());
        let chunks = seg.push_delta(
            "This is the first complete sentence of the response. Here is the second one now.",
        );
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].position, ChunkPosition::First);
        assert!(chunks[0].text.starts_with("This is the first"));
        assert!(chunks[0].text.ends_with("response."));
    }

    #[test]
    fn short_sentences_merge_until_long_enough() {
        let mut seg = SentenceSegmenter::new(Uuid::nil());
        // Neither "Ok." nor "Sure." alone reaches the 20-char minimum, so
        // both boundaries are skipped in favor of a later, longer one.
        let chunks = seg.push_delta("Ok. Sure. That sounds fine. Next topic please?");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Ok. Sure. That sounds fine.");
    }
}
