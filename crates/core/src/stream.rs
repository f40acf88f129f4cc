use crate::traits::StreamChunk;

/// Folds streamed chunks into text that only ever grows.
#[derive(Debug, Default, Clone)]
pub struct StreamAccumulator {
    text: String,
    /// Trailing bytes of a UTF-8 sequence that has not fully arrived.
    pending: Vec<u8>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies `chunk` and returns whether the visible text advanced.
    pub fn push(&mut self, chunk: StreamChunk) -> bool {
        match chunk {
            StreamChunk::Delta(piece) => {
                self.pending.extend_from_slice(&piece);
                let decoded = self.decode_pending();
                if decoded.is_empty() {
                    false
                } else {
                    self.text.push_str(&decoded);
                    true
                }
            }
            StreamChunk::Snapshot(current) => {
                if current.len() > self.text.len() {
                    self.text = current;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Decodes only the undecoded bytes, keeping an incomplete tail for the next delta.
    fn decode_pending(&mut self) -> String {
        let mut decoded = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    decoded.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(error) => {
                    let (valid, after) = rest.split_at(error.valid_up_to());
                    decoded.push_str(&String::from_utf8_lossy(valid));
                    match error.error_len() {
                        None => {
                            rest = after;
                            break;
                        }
                        Some(invalid) => {
                            decoded.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[invalid..];
                        }
                    }
                }
            }
        }

        let remainder = rest.to_vec();
        self.pending = remainder;
        decoded
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn into_text(self) -> String {
        self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_accumulate() {
        let mut acc = StreamAccumulator::new();
        assert!(acc.push(StreamChunk::Delta(b"Hello, ".to_vec())));
        assert!(acc.push(StreamChunk::Delta(b"world".to_vec())));
        assert_eq!(acc.text(), "Hello, world");
    }

    #[test]
    fn split_utf8_sequences_wait_for_completion() {
        let bytes = "é".as_bytes();
        let mut acc = StreamAccumulator::new();
        acc.push(StreamChunk::Delta(b"caf".to_vec()));
        assert!(!acc.push(StreamChunk::Delta(vec![bytes[0]])));
        assert_eq!(acc.text(), "caf");
        assert!(acc.push(StreamChunk::Delta(vec![bytes[1]])));
        assert_eq!(acc.text(), "café");
    }

    #[test]
    fn snapshot_keeps_held_back_bytes() {
        let bytes = "é".as_bytes();
        let mut acc = StreamAccumulator::new();
        acc.push(StreamChunk::Delta(b"caf".to_vec()));
        acc.push(StreamChunk::Delta(vec![bytes[0]]));
        assert!(acc.push(StreamChunk::Snapshot("Le caf".to_string())));
        assert!(acc.push(StreamChunk::Delta(vec![bytes[1]])));
        assert_eq!(acc.text(), "Le café");
    }

    #[test]
    fn invalid_bytes_become_replacement_characters() {
        let mut acc = StreamAccumulator::new();
        assert!(acc.push(StreamChunk::Delta(vec![b'a', 0xFF, b'b'])));
        assert_eq!(acc.text(), "a\u{FFFD}b");
        assert!(acc.push(StreamChunk::Delta(b"c".to_vec())));
        assert_eq!(acc.text(), "a\u{FFFD}bc");
    }

    #[test]
    fn shorter_snapshot_is_ignored() {
        let mut acc = StreamAccumulator::new();
        acc.push(StreamChunk::Snapshot("The answer is".to_string()));
        assert!(!acc.push(StreamChunk::Snapshot("The".to_string())));
        assert_eq!(acc.text(), "The answer is");
    }

    #[test]
    fn snapshot_then_delta_continues_from_snapshot() {
        let mut acc = StreamAccumulator::new();
        acc.push(StreamChunk::Snapshot("Hello".to_string()));
        acc.push(StreamChunk::Delta(b", there".to_vec()));
        assert_eq!(acc.into_text(), "Hello, there");
    }
}
