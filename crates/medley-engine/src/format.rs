//! Terminal output formatting: escape-sequence sanitization plus per-source
//! line buffering with a `[workspace:script]` prefix.
//!
//! Chunks do not align to line boundaries, so the formatter keeps one
//! pending-line buffer per source key and only emits complete lines. The
//! trailing fragment of each source is emitted by `flush` once its stream
//! is exhausted.
//!
//! Sanitization runs independently on each chunk before buffering. An
//! escape sequence that straddles a chunk boundary is therefore not seen
//! as one unit; in practice processes write whole sequences in one write.

use std::sync::Arc;

use medley_types::{ChunkMeta, TextChunk};

const RESET: &str = "\u{1b}[0m";

/// Strip everything a terminal would act on except colors and styles.
///
/// Newline forms (`\r\n`, `\r`, `\f`, `\v`) are normalized to `\n`, then
/// bell, backspace, and C1 controls are dropped, and escape sequences are
/// scanned: a CSI sequence survives only when its final byte is `m`
/// (a color/style sequence). String-terminated families (`ESC ]`, `ESC P`,
/// `ESC _`, `ESC ^`, `ESC X`) are dropped through their bell or `ESC \`
/// terminator. Any other two-byte escape is dropped as a pair, and a
/// trailing unterminated sequence is dropped entirely.
pub fn sanitize(input: &str) -> String {
    let mut norm = String::with_capacity(input.len());
    let mut it = input.chars().peekable();
    while let Some(c) = it.next() {
        match c {
            '\r' => {
                if it.peek() == Some(&'\n') {
                    it.next();
                }
                norm.push('\n');
            }
            '\u{0b}' | '\u{0c}' => norm.push('\n'),
            _ => norm.push(c),
        }
    }

    let chars: Vec<char> = norm.chars().collect();
    let mut out = String::with_capacity(norm.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\u{1b}' {
            match chars.get(i + 1) {
                Some('[') => {
                    let mut j = i + 2;
                    while j < chars.len() && !('\u{40}'..='\u{7e}').contains(&chars[j]) {
                        j += 1;
                    }
                    match chars.get(j) {
                        Some('m') => {
                            out.extend(&chars[i..=j]);
                            i = j + 1;
                        }
                        Some(_) => i = j + 1,
                        None => i = j,
                    }
                }
                Some(']' | 'P' | '_' | '^' | 'X') => {
                    let mut j = i + 2;
                    i = loop {
                        match chars.get(j) {
                            None => break chars.len(),
                            Some('\u{07}') => break j + 1,
                            Some('\u{1b}') if chars.get(j + 1) == Some(&'\\') => break j + 2,
                            Some(_) => j += 1,
                        }
                    };
                }
                Some(_) => i += 2,
                None => i += 1,
            }
            continue;
        }
        let disruptive =
            matches!(c, '\u{07}' | '\u{08}') || ('\u{80}'..='\u{9f}').contains(&c);
        if !disruptive {
            out.push(c);
        }
        i += 1;
    }
    out
}

/// Line-buffering formatter over the merged text stream.
pub struct OutputFormatter {
    // Small (sources × 2); linear lookup keeps first-seen order for flush.
    buffers: Vec<(Arc<ChunkMeta>, String)>,
    prefix: bool,
}

impl OutputFormatter {
    pub fn new() -> Self {
        Self {
            buffers: Vec::new(),
            prefix: true,
        }
    }

    /// Enable or disable the `[workspace:script]` line prefix.
    pub fn with_prefix(mut self, prefix: bool) -> Self {
        self.prefix = prefix;
        self
    }

    /// Feed one chunk; returns every line completed by it, in order.
    pub fn push(&mut self, chunk: &TextChunk) -> Vec<String> {
        let clean = sanitize(&chunk.text);
        let prefix = self.line_prefix(&chunk.meta);
        let key = chunk.meta.key();
        let idx = match self.buffers.iter().position(|(m, _)| m.key() == key) {
            Some(idx) => idx,
            None => {
                self.buffers.push((Arc::clone(&chunk.meta), String::new()));
                self.buffers.len() - 1
            }
        };
        let buf = &mut self.buffers[idx].1;
        buf.push_str(&clean);

        let mut lines = Vec::new();
        while let Some(pos) = buf.find('\n') {
            let line: String = buf.drain(..=pos).collect();
            let line = &line[..line.len() - 1];
            if line.is_empty() {
                continue;
            }
            lines.push(format!("{prefix}{line}{RESET}"));
        }
        lines
    }

    /// Emit every pending partial line. Call once the stream is exhausted.
    pub fn flush(&mut self) -> Vec<String> {
        let buffers = std::mem::take(&mut self.buffers);
        buffers
            .into_iter()
            .filter(|(_, buf)| !buf.is_empty())
            .map(|(meta, buf)| format!("{}{buf}{RESET}", self.line_prefix(&meta)))
            .collect()
    }

    fn line_prefix(&self, meta: &ChunkMeta) -> String {
        if self.prefix {
            format!("[{}] ", meta.tag.label())
        } else {
            String::new()
        }
    }
}

impl Default for OutputFormatter {
    fn default() -> Self {
        Self::new()
    }
}
