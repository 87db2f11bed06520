// ABOUTME: Git mediation core - structured diff parsing, isolated repository contexts, sync workflows

#![allow(missing_docs)]

pub mod context_manager;
pub mod diff_parser;
pub mod executor;
pub mod models;
pub mod sync_orchestrator;

pub use context_manager::{ContextError, RepositoryContext, RepositoryContextManager, SyncCallback};
pub use executor::{CommandExecutor, CommandOutput, ExecError, GitCli};
pub use models::{
    CompoundOperationResult, DiffLine, DiffStats, FileDiff, FileStatus, GitChanges, Hunk, LineKind,
};
pub use sync_orchestrator::{SyncError, SyncOrchestrator};
