//! Output chunks — tagged pieces of subprocess output.
//!
//! Every chunk carries a shared `ChunkMeta` identifying which workspace,
//! script, and stream it came from, plus any caller metadata from the spec.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::spec::ScriptTag;

/// Which OS stream a chunk was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamName::Stdout => write!(f, "stdout"),
            StreamName::Stderr => write!(f, "stderr"),
        }
    }
}

/// Metadata shared by every chunk from one output channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    /// Which workspace/script produced the chunk.
    pub tag: ScriptTag,
    /// Which stream (stdout or stderr) the chunk was read from.
    pub stream: StreamName,
    /// Caller data carried over from the spec.
    pub metadata: serde_json::Value,
}

impl ChunkMeta {
    /// Create metadata for one channel.
    pub fn new(tag: ScriptTag, stream: StreamName) -> Self {
        Self {
            tag,
            stream,
            metadata: serde_json::Value::Null,
        }
    }

    /// Attach caller metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Stable key identifying this source (`workspace:script:stream`).
    ///
    /// Distinct per channel: stdout and stderr of the same script are
    /// separate sources for line buffering and text decoding.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.tag.workspace, self.tag.script, self.stream)
    }
}

/// One raw chunk of subprocess output.
#[derive(Debug, Clone)]
pub struct ByteChunk {
    /// Source metadata, shared across all chunks from the same channel.
    pub meta: Arc<ChunkMeta>,
    /// Raw bytes as read from the pipe.
    pub bytes: Vec<u8>,
}

/// One incrementally-decoded chunk of subprocess output.
///
/// Produced by the text consumption mode; multi-byte UTF-8 sequences split
/// across raw chunks are completed before emission, so `text` is always
/// valid whole-character content.
#[derive(Debug, Clone)]
pub struct TextChunk {
    /// Source metadata, shared across all chunks from the same channel.
    pub meta: Arc<ChunkMeta>,
    /// Decoded text.
    pub text: String,
}
