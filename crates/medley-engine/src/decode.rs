//! Streaming UTF-8 decoding for chunked subprocess output.
//!
//! Subprocess pipes hand us arbitrary byte chunks; a multi-byte character
//! can be split across two of them. `Utf8Decoder` keeps the incomplete
//! tail (at most 3 bytes) and completes it once the continuation bytes
//! arrive. Invalid bytes in the middle of a chunk become U+FFFD; a still
//! incomplete sequence at end-of-stream is flushed as a single U+FFFD
//! rather than dropped silently.

/// Incremental UTF-8 decoder carrying state across chunk boundaries.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    /// Trailing bytes of an incomplete multi-byte sequence (max 3).
    pending: Vec<u8>,
}

impl Utf8Decoder {
    /// Create a decoder with no pending state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one chunk, returning all text that can be produced so far.
    ///
    /// Returns an empty string when the chunk only extends a still
    /// incomplete sequence (callers should skip emitting those).
    pub fn decode(&mut self, input: &[u8]) -> String {
        let joined;
        let mut rest: &[u8] = if self.pending.is_empty() {
            input
        } else {
            let mut buf = std::mem::take(&mut self.pending);
            buf.extend_from_slice(input);
            joined = buf;
            &joined
        };

        let mut out = String::with_capacity(rest.len());
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            // Invalid bytes with more input after them.
                            out.push('\u{FFFD}');
                            rest = &after[len..];
                        }
                        None => {
                            // Incomplete sequence at the end of the chunk;
                            // keep it for the next call.
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush at end-of-stream.
    ///
    /// Returns one replacement character if a multi-byte sequence was
    /// still incomplete, `None` otherwise.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            self.pending.clear();
            Some("\u{FFFD}".to_string())
        }
    }
}
