// ABOUTME: Repository context registry - explicit per-repository sessions replacing a global current-repo

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use git2::{Repository, Status, StatusOptions};
use thiserror::Error;
use tracing::{debug, info};

use crate::executor::{CommandExecutor, GitCli};
use crate::models::GitChanges;

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("No repository selected")]
    NoRepositorySelected,
    #[error("Not a git repository: {0}")]
    NotARepository(String),
    #[error("Git repository error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Callback invoked whenever the active context changes. Receives the new
/// active path, or `None` when no context is active anymore.
pub type SyncCallback = Box<dyn Fn(Option<&Path>) + Send>;

/// One open repository session: a working directory plus the command executor
/// bound to it.
///
/// The context never touches the process-wide current directory, so any
/// number of contexts can coexist without reading or mutating each other's
/// working trees.
pub struct RepositoryContext {
    path: PathBuf,
    executor: Box<dyn CommandExecutor>,
    workflow_lock: Mutex<()>,
}

impl RepositoryContext {
    fn new(path: PathBuf) -> Self {
        let executor = Box::new(GitCli::new(path.clone()));
        Self {
            path,
            executor,
            workflow_lock: Mutex::new(()),
        }
    }

    /// Build a context with a custom executor (scripted executors in tests,
    /// instrumented ones in embedders).
    pub fn with_executor(path: PathBuf, executor: Box<dyn CommandExecutor>) -> Self {
        Self {
            path,
            executor,
            workflow_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn executor(&self) -> &dyn CommandExecutor {
        self.executor.as_ref()
    }

    /// Exclusive-execution guard: at most one compound workflow runs against
    /// this working directory at a time. A second caller blocks here until
    /// the first workflow reaches a terminal state.
    pub(crate) fn lock_for_workflow(&self) -> MutexGuard<'_, ()> {
        self.workflow_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Name of the currently checked-out branch, or "HEAD" when detached.
    pub fn current_branch(&self) -> Result<String, ContextError> {
        let repo = Repository::open(&self.path)?;
        let head = repo.head()?;

        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    /// Working-tree change counts, staged and unstaged combined.
    pub fn status(&self) -> Result<GitChanges, ContextError> {
        let repo = Repository::open(&self.path)?;
        let mut opts = StatusOptions::new();
        opts.include_untracked(true);
        opts.include_ignored(false);

        let statuses = repo.statuses(Some(&mut opts))?;
        let mut changes = GitChanges::default();

        for entry in statuses.iter() {
            let status = entry.status();

            if status.contains(Status::WT_NEW) || status.contains(Status::INDEX_NEW) {
                changes.added += 1;
            }

            if status.contains(Status::WT_MODIFIED) || status.contains(Status::INDEX_MODIFIED) {
                changes.modified += 1;
            }

            if status.contains(Status::WT_DELETED) || status.contains(Status::INDEX_DELETED) {
                changes.deleted += 1;
            }

            // Renames count as modifications for display purposes
            if status.contains(Status::WT_RENAMED) || status.contains(Status::INDEX_RENAMED) {
                changes.modified += 1;
            }
        }

        debug!("{}: {}", self.path.display(), changes.format());
        Ok(changes)
    }

    pub fn is_clean(&self) -> Result<bool, ContextError> {
        Ok(self.status()?.total() == 0)
    }

    pub fn has_uncommitted_changes(&self) -> Result<bool, ContextError> {
        Ok(self.status()?.total() > 0)
    }
}

impl std::fmt::Debug for RepositoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryContext")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Owns every open [`RepositoryContext`] and tracks which one is "active"
/// for context-free callers.
///
/// Replaces the legacy single mutable current-repository session: callers
/// that need "the current repository" go through [`Self::require_active`]
/// instead of reading shared global state, and multi-repository callers hold
/// explicit context handles.
pub struct RepositoryContextManager {
    contexts: Mutex<HashMap<PathBuf, Arc<RepositoryContext>>>,
    active: Mutex<Option<PathBuf>>,
    sync_callback: Mutex<Option<SyncCallback>>,
}

impl RepositoryContextManager {
    pub fn new() -> Self {
        Self {
            contexts: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            sync_callback: Mutex::new(None),
        }
    }

    /// Open (or return the already-open context for) a repository path and
    /// make it the active context.
    pub fn open(&self, path: &Path) -> Result<Arc<RepositoryContext>, ContextError> {
        let canonical = path
            .canonicalize()
            .map_err(|_| ContextError::NotARepository(path.display().to_string()))?;

        // Validate before registering anything.
        Repository::open(&canonical)
            .map_err(|_| ContextError::NotARepository(canonical.display().to_string()))?;

        let context = {
            let mut contexts = self.lock_contexts();
            match contexts.get(&canonical) {
                Some(existing) => {
                    debug!("context already open: {}", canonical.display());
                    Arc::clone(existing)
                }
                None => {
                    info!("opening repository context: {}", canonical.display());
                    let context = Arc::new(RepositoryContext::new(canonical.clone()));
                    contexts.insert(canonical.clone(), Arc::clone(&context));
                    context
                }
            }
        };

        self.set_active(Some(canonical));
        Ok(context)
    }

    /// Release the context for a path. If it was active, no context is active
    /// afterwards until the next `open`.
    pub fn close(&self, path: &Path) {
        let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());

        let removed = self.lock_contexts().remove(&canonical).is_some();
        if removed {
            info!("closed repository context: {}", canonical.display());
        }

        let was_active = self
            .lock_active()
            .as_ref()
            .is_some_and(|active| *active == canonical);
        if was_active {
            self.set_active(None);
        }
    }

    pub fn active(&self) -> Option<Arc<RepositoryContext>> {
        let active = self.lock_active().clone()?;
        self.lock_contexts().get(&active).map(Arc::clone)
    }

    /// The active context, or `ContextError::NoRepositorySelected`. Callers
    /// must not fall back to a stale session when this fails.
    pub fn require_active(&self) -> Result<Arc<RepositoryContext>, ContextError> {
        self.active().ok_or(ContextError::NoRepositorySelected)
    }

    /// Register the single observer notified on active-context changes.
    /// Registering a new callback replaces the previous one.
    pub fn set_sync_callback(&self, callback: SyncCallback) {
        *self
            .sync_callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    fn set_active(&self, path: Option<PathBuf>) {
        let changed = {
            let mut active = self.lock_active();
            if *active == path {
                false
            } else {
                *active = path.clone();
                true
            }
        };

        if changed {
            let callback = self
                .sync_callback
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(callback) = callback.as_ref() {
                callback(path.as_deref());
            }
        }
    }

    fn lock_contexts(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<RepositoryContext>>> {
        self.contexts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<PathBuf>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RepositoryContextManager {
    fn default() -> Self {
        Self::new()
    }
}
