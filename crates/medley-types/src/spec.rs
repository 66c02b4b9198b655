//! ScriptSpec — the description of one script execution.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identifies which workspace/script a spec (and its output) belongs to.
///
/// Used as the output prefix label (`[workspace:script]`) and carried in
/// every chunk and exit record produced for the spec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScriptTag {
    /// Workspace (sub-package) name.
    pub workspace: String,
    /// Script name within the workspace.
    pub script: String,
}

impl ScriptTag {
    /// Create a new tag.
    pub fn new(workspace: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            script: script.into(),
        }
    }

    /// The `workspace:script` label used for output prefixes.
    pub fn label(&self) -> String {
        format!("{}:{}", self.workspace, self.script)
    }
}

impl std::fmt::Display for ScriptTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.workspace, self.script)
    }
}

/// The full description of one script execution.
///
/// Immutable once handed to the scheduler. The command is a shell command
/// line, run through `sh -c`; `args` become the shell's positional
/// parameters if non-empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptSpec {
    /// Which workspace/script this spec belongs to.
    pub tag: ScriptTag,
    /// Shell command line to execute.
    pub command: String,
    /// Positional parameters passed to the shell (`$1`, `$2`, ...).
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory; inherits the caller's when `None`.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Environment overrides applied on top of the caller environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Arbitrary caller data, carried through to chunks and records.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ScriptSpec {
    /// Create a spec with just a tag and a command line.
    pub fn new(tag: ScriptTag, command: impl Into<String>) -> Self {
        Self {
            tag,
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
            env: HashMap::new(),
            metadata: serde_json::Value::Null,
        }
    }

    /// Set the working directory.
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add one environment override.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Attach caller metadata.
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_label_joins_workspace_and_script() {
        let tag = ScriptTag::new("pkg-a", "build");
        assert_eq!(tag.label(), "pkg-a:build");
        assert_eq!(tag.to_string(), "pkg-a:build");
    }

    #[test]
    fn spec_builder_sets_fields() {
        let spec = ScriptSpec::new(ScriptTag::new("pkg", "test"), "cargo test")
            .with_dir("/tmp/pkg")
            .with_env("CI", "1");
        assert_eq!(spec.command, "cargo test");
        assert_eq!(spec.working_dir.as_deref(), Some(std::path::Path::new("/tmp/pkg")));
        assert_eq!(spec.env.get("CI").map(String::as_str), Some("1"));
        assert!(spec.metadata.is_null());
    }
}
