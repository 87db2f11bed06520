// ABOUTME: Core data models for structured diffs, working-tree status, and workflow results

use serde::{Deserialize, Serialize};

/// Per-file change classification as reported by a diff header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// Classification of a single diff body line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineKind {
    Context,
    Add,
    Delete,
}

/// One line inside a hunk, with its position on whichever side(s) it exists.
///
/// Context lines carry both numbers, deletions only the old-side number,
/// additions only the new-side number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffLine {
    pub kind: LineKind,
    pub content: String,
    pub old_line_number: Option<u32>,
    pub new_line_number: Option<u32>,
}

/// A contiguous block of changes anchored by old/new line numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hunk {
    pub old_start: u32,
    pub old_line_count: u32,
    pub new_start: u32,
    pub new_line_count: u32,
    pub lines: Vec<DiffLine>,
}

/// One file's parsed diff section.
///
/// `additions`/`deletions` are computed by walking the emitted hunk lines,
/// never taken from `--stat` text. Binary files always have empty `hunks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDiff {
    pub path: String,
    /// Present only when `status` is [`FileStatus::Renamed`].
    pub old_path: Option<String>,
    pub status: FileStatus,
    pub additions: u32,
    pub deletions: u32,
    pub is_binary: bool,
    pub hunks: Vec<Hunk>,
}

/// Aggregate statistics over a parsed diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files_changed: usize,
    pub insertions: u32,
    pub deletions: u32,
}

/// Working-tree change counts for quick status display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitChanges {
    pub added: u32,
    pub modified: u32,
    pub deleted: u32,
}

impl GitChanges {
    pub fn total(&self) -> u32 {
        self.added + self.modified + self.deleted
    }

    pub fn format(&self) -> String {
        if self.total() == 0 {
            "No changes".to_string()
        } else {
            format!("+{} ~{} -{}", self.added, self.modified, self.deleted)
        }
    }
}

/// Outcome of a compound workflow.
///
/// Anticipated git-level failure modes (divergence, conflicts, missing
/// tracking branch) are modeled as data here so callers can branch on them
/// without exception ceremony. Only precondition violations surface as `Err`
/// from the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompoundOperationResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub had_conflicts: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_stashed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
}

impl CompoundOperationResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            had_conflicts: false,
            auto_stashed: false,
            branch_name: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            had_conflicts: false,
            auto_stashed: false,
            branch_name: None,
        }
    }

    pub fn with_conflicts(mut self) -> Self {
        self.had_conflicts = true;
        self
    }

    pub fn with_auto_stash(mut self) -> Self {
        self.auto_stashed = true;
        self
    }

    pub fn with_branch(mut self, name: impl Into<String>) -> Self {
        self.branch_name = Some(name.into());
        self
    }
}
