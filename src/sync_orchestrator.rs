// ABOUTME: Compound git workflows - pull with safety-net stash, behind-checked commit, workspace promotion

use std::io::Write;

use lazy_static::lazy_static;
use regex::Regex;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context_manager::{ContextError, RepositoryContext};
use crate::diff_parser;
use crate::executor::{CommandExecutor, CommandOutput, ExecError};
use crate::models::{CompoundOperationResult, FileDiff};

lazy_static! {
    static ref PATCH_FAILED_PATH: Regex = Regex::new(r"(?m)^error: patch failed: (.+):\d+$").unwrap();
    static ref UNMERGED_PATH: Regex = Regex::new(r"(?m)^U (.+)$").unwrap();
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Commit message cannot be empty")]
    EmptyCommitMessage,
    #[error("Invalid workspace name: {0}")]
    InvalidWorkspaceName(String),
}

/// Label of a stash created to protect uncommitted work during a risky step.
/// Consumed on completion, or reported to the caller when left behind.
struct StashSafetyNet {
    label: String,
}

impl StashSafetyNet {
    fn new(purpose: &str) -> Self {
        let short_uuid = Uuid::new_v4().to_string()[..8].to_string();
        Self {
            label: format!("repodeck-{purpose}-{short_uuid}"),
        }
    }
}

/// Outcome of comparing the current branch with its upstream.
///
/// `NoUpstream` is strictly the missing-tracking-branch case; every other
/// failure keeps its message so callers decide whether it is fatal.
enum BehindCheck {
    Behind(u32),
    NoUpstream,
    Failed(String),
}

/// Drives the compound workflows against a repository context's executor.
///
/// Every workflow returns a [`CompoundOperationResult`]; anticipated git
/// failure modes (divergence, conflicts, missing tracking branch) are data in
/// that result. `Err` is reserved for precondition violations and broken
/// infrastructure (git not launchable, tempfile IO).
///
/// Workflows on the same context are serialized by the context's workflow
/// lock; a second invocation blocks until the first reaches a terminal state.
/// There is no mid-workflow cancellation: once a safety-net stash exists the
/// workflow always runs to a defined terminal state.
pub struct SyncOrchestrator;

impl SyncOrchestrator {
    pub fn new() -> Self {
        Self
    }

    /// Pull the current branch with a safety-net stash for uncommitted work.
    ///
    /// Fetching → CheckDivergence → (UpToDate | Stashing → Pulling →
    /// Restoring) → Done.
    pub fn pull_with_safety_net(
        &self,
        context: &RepositoryContext,
    ) -> Result<CompoundOperationResult, SyncError> {
        let _workflow = context.lock_for_workflow();
        let exec = context.executor();

        debug!("pull: fetching");
        let fetch = exec.run(&["fetch"])?;
        if !fetch.success() {
            let message = fetch.combined_message();
            if is_missing_upstream(message) {
                return Ok(CompoundOperationResult::ok(
                    "No remote configured; nothing to pull yet",
                ));
            }
            return Ok(CompoundOperationResult::failed(format!(
                "Fetch failed: {message}"
            )));
        }

        debug!("pull: checking divergence");
        let behind = match self.behind_count(context)? {
            BehindCheck::Behind(n) => n,
            // No upstream tracking branch means there is nothing to pull yet.
            BehindCheck::NoUpstream => {
                return Ok(CompoundOperationResult::ok(
                    "No upstream tracking branch; nothing to pull yet",
                ))
            }
            BehindCheck::Failed(message) => {
                return Ok(CompoundOperationResult::failed(format!(
                    "Could not determine divergence from remote: {message}"
                )))
            }
        };
        if behind == 0 {
            return Ok(CompoundOperationResult::ok("Already up to date"));
        }

        let mut safety_net = None;
        let status = exec.run(&["status", "--porcelain"])?;
        if !status.success() {
            // An unreadable working tree must not be mistaken for a clean one.
            return Ok(CompoundOperationResult::failed(format!(
                "Could not inspect the working tree before pulling: {}",
                status.combined_message()
            )));
        }
        if !status.stdout.trim().is_empty() {
            debug!("pull: stashing uncommitted changes");
            let net = StashSafetyNet::new("safety-net");
            let stash = exec.run(&["stash", "push", "-u", "-m", &net.label])?;
            if !stash.success() {
                return Ok(CompoundOperationResult::failed(format!(
                    "Could not protect uncommitted changes before pulling: {}",
                    stash.combined_message()
                )));
            }
            info!("pull: created safety-net stash {}", net.label);
            safety_net = Some(net);
        }

        debug!("pull: rebasing onto remote");
        let pull = exec.run(&["pull", "--rebase"])?;
        if !pull.success() {
            return Ok(self.recover_failed_pull(context, &pull, safety_net));
        }

        let Some(net) = safety_net else {
            return Ok(CompoundOperationResult::ok(format!(
                "Pulled {behind} commit(s) from remote"
            )));
        };

        debug!("pull: restoring safety-net stash");
        let pop = exec.run(&["stash", "pop"])?;
        if pop.success() {
            return Ok(CompoundOperationResult::ok(format!(
                "Pulled {behind} commit(s) and restored local changes"
            ))
            .with_auto_stash());
        }

        let message = pop.combined_message().to_string();
        if is_conflict_shaped(&message) {
            // The conflicted content is already on disk; consume the entry so
            // the next pull does not try to apply it again.
            if let Err(e) = exec.run(&["stash", "drop"]) {
                warn!("pull: could not drop conflicted safety-net stash: {e}");
            }
            return Ok(CompoundOperationResult::ok(format!(
                "Pulled {behind} commit(s), but restoring local changes produced conflicts. \
                 Resolve the conflict markers in the affected files manually."
            ))
            .with_auto_stash()
            .with_conflicts());
        }

        // Losing the pull is worse than leaving stash cruft: the stash stays
        // in the list for manual recovery.
        warn!(
            "pull: stash restore failed for a non-conflict reason, leaving {} in the stash list: {}",
            net.label, message
        );
        Ok(CompoundOperationResult::ok(format!(
            "Pulled {behind} commit(s), but your local changes could not be restored \
             automatically. They are preserved in stash '{}'; recover them with \
             'git stash list' and 'git stash pop'.",
            net.label
        ))
        .with_auto_stash())
    }

    /// Commit staged-and-unstaged changes, refusing when the remote has
    /// advanced unless `force` is set.
    pub fn commit_with_behind_check(
        &self,
        context: &RepositoryContext,
        message: &str,
        force: bool,
    ) -> Result<CompoundOperationResult, SyncError> {
        if message.trim().is_empty() {
            return Err(SyncError::EmptyCommitMessage);
        }

        let _workflow = context.lock_for_workflow();
        let exec = context.executor();

        // Refresh the remote state; failing here (offline) degrades the
        // behind-check to the last-known remote rather than blocking commits.
        let fetch = exec.run(&["fetch"])?;
        if !fetch.success() {
            warn!(
                "commit: fetch failed, behind-check uses last-known remote state: {}",
                fetch.combined_message()
            );
        }

        if !force {
            match self.behind_count(context)? {
                BehindCheck::Behind(behind) if behind > 0 => {
                    return Ok(CompoundOperationResult::failed(format!(
                        "Branch is {behind} commit(s) behind its remote. \
                         Pull first, or commit anyway with force."
                    )));
                }
                // A broken behind-check degrades like a failed fetch: the
                // commit itself is local and must not be blocked by it.
                BehindCheck::Failed(message) => {
                    warn!("commit: behind-check failed, proceeding: {message}");
                }
                BehindCheck::Behind(_) | BehindCheck::NoUpstream => {}
            }
        }

        let add = exec.run(&["add", "-A"])?;
        if !add.success() {
            return Ok(CompoundOperationResult::failed(format!(
                "Staging changes failed: {}",
                add.combined_message()
            )));
        }

        // --no-gpg-sign so a GPG passphrase prompt can never hang the caller
        let commit = exec.run(&["commit", "--no-gpg-sign", "-m", message])?;
        if !commit.success() {
            return Ok(CompoundOperationResult::failed(format!(
                "Commit failed: {}",
                commit.combined_message()
            )));
        }

        let first_line = message.lines().next().unwrap_or(message);
        info!("committed: {first_line}");
        Ok(CompoundOperationResult::ok(format!("Committed: {first_line}")))
    }

    /// Promote a disposable workspace's working-tree delta onto a fresh
    /// branch cut from the repository's main-equivalent.
    ///
    /// The delta is parked in a labeled stash before switching branches, so a
    /// failed patch application never loses it; the new branch is left for
    /// manual inspection rather than auto-deleted.
    pub fn promote_workspace_to_branch(
        &self,
        context: &RepositoryContext,
        workspace_name: &str,
    ) -> Result<CompoundOperationResult, SyncError> {
        let safe_name = sanitize_name(workspace_name);
        if safe_name.is_empty() {
            return Err(SyncError::InvalidWorkspaceName(workspace_name.to_string()));
        }
        let branch_name = format!("workspace/{safe_name}");

        let _workflow = context.lock_for_workflow();
        let exec = context.executor();

        debug!("promote: discovering base branch");
        let Some(base) = self.find_base_branch(context)? else {
            return Ok(CompoundOperationResult::failed(
                "No main or master branch (remote or local) to base the new branch on",
            ));
        };

        debug!("promote: extracting workspace delta against HEAD");
        // Intent-to-add makes untracked files visible to `diff HEAD`.
        let mark = exec.run(&["add", "-N", "."])?;
        if !mark.success() {
            return Ok(CompoundOperationResult::failed(format!(
                "Could not register untracked files: {}",
                mark.combined_message()
            )));
        }
        let diff = exec.run(&["diff", "HEAD", "--binary"])?;
        if !diff.success() {
            return Ok(CompoundOperationResult::failed(format!(
                "Could not extract workspace changes: {}",
                diff.combined_message()
            )));
        }
        // Clear the intent-to-add marks again; stash does not cope with them.
        match exec.run(&["reset"]) {
            Ok(reset) if !reset.success() => {
                warn!("promote: reset failed: {}", reset.combined_message());
            }
            Err(e) => warn!("promote: reset failed: {e}"),
            Ok(_) => {}
        }
        if diff.stdout.trim().is_empty() {
            return Ok(CompoundOperationResult::failed(
                "Workspace has no changes to promote",
            ));
        }

        let net = StashSafetyNet::new("promote");
        let stash = exec.run(&["stash", "push", "-u", "-m", &net.label])?;
        if !stash.success() {
            return Ok(CompoundOperationResult::failed(format!(
                "Could not park workspace changes before switching branches: {}",
                stash.combined_message()
            )));
        }

        debug!("promote: creating branch {branch_name} from {base}");
        let checkout = exec.run(&["checkout", "-b", &branch_name, &base])?;
        if !checkout.success() {
            // Nothing applied yet; put the workspace back the way it was. If
            // that also fails, the caller must learn where the delta went.
            let mut message = format!(
                "Could not create branch '{branch_name}' from {base}: {}",
                checkout.combined_message()
            );
            if !try_restore_stash(exec, &net) {
                message.push_str(&format!(
                    " Your workspace changes are preserved in stash '{}'; \
                     recover them with 'git stash pop'.",
                    net.label
                ));
            }
            return Ok(CompoundOperationResult::failed(message));
        }

        debug!("promote: applying workspace delta");
        let mut patch_file = NamedTempFile::new()?;
        patch_file.write_all(diff.stdout.as_bytes())?;
        let patch_path = patch_file.path().to_string_lossy().to_string();

        let apply = exec.run(&["apply", "--3way", "--whitespace=nowarn", &patch_path])?;
        if !apply.success() {
            let stderr = apply.combined_message();
            let conflicting = conflicting_paths(stderr);
            let detail = if conflicting.is_empty() {
                stderr.to_string()
            } else {
                format!("conflicting paths: {}", conflicting.join(", "))
            };
            // Branch stays for inspection; the parked stash keeps the delta.
            return Ok(CompoundOperationResult::failed(format!(
                "Applying workspace changes onto '{branch_name}' failed ({detail}). \
                 The branch is left in place and the original changes are preserved \
                 in stash '{}'.",
                net.label
            ))
            .with_conflicts()
            .with_branch(branch_name));
        }

        let add = exec.run(&["add", "-A"])?;
        if !add.success() {
            return Ok(CompoundOperationResult::failed(format!(
                "Workspace changes applied, but staging them failed: {}",
                add.combined_message()
            ))
            .with_branch(branch_name));
        }

        // Delta now lives on the branch; the parked copy has served its purpose.
        if let Ok(drop) = exec.run(&["stash", "drop"]) {
            if !drop.success() {
                warn!("promote: could not drop parked stash {}", net.label);
            }
        }

        info!("promoted workspace '{workspace_name}' to branch {branch_name}");
        Ok(CompoundOperationResult::ok(format!(
            "Workspace promoted to branch '{branch_name}'; changes are staged and \
             ready to commit"
        ))
        .with_branch(branch_name))
    }

    /// Structured diff of the working tree against HEAD.
    pub fn working_tree_diff(
        &self,
        context: &RepositoryContext,
    ) -> Result<Vec<FileDiff>, SyncError> {
        let output = context.executor().run(&["diff", "HEAD"])?;
        Ok(diff_parser::parse(&output.stdout))
    }

    /// Structured diff between two committish refs (merge-base semantics,
    /// matching what a review surface shows for a branch).
    pub fn branch_diff(
        &self,
        context: &RepositoryContext,
        base: &str,
        target: &str,
    ) -> Result<Vec<FileDiff>, SyncError> {
        let range = format!("{base}...{target}");
        let output = context.executor().run(&["diff", &range])?;
        Ok(diff_parser::parse(&output.stdout))
    }

    /// Commits the current branch is behind its upstream.
    fn behind_count(&self, context: &RepositoryContext) -> Result<BehindCheck, SyncError> {
        let output = context
            .executor()
            .run(&["rev-list", "--count", "HEAD..@{u}"])?;
        if !output.success() {
            let message = output.combined_message().to_string();
            if is_missing_upstream(&message) {
                return Ok(BehindCheck::NoUpstream);
            }
            return Ok(BehindCheck::Failed(message));
        }

        Ok(BehindCheck::Behind(output.stdout.trim().parse::<u32>().unwrap_or(0)))
    }

    fn find_base_branch(&self, context: &RepositoryContext) -> Result<Option<String>, SyncError> {
        for candidate in ["origin/main", "origin/master", "main", "master"] {
            let probe = context
                .executor()
                .run(&["rev-parse", "--verify", "--quiet", candidate])?;
            if probe.success() {
                return Ok(Some(candidate.to_string()));
            }
        }
        Ok(None)
    }

    /// Best-effort recovery after a failed pull: abort a half-done rebase so
    /// the repository is not left mid-rebase, then try to give the user their
    /// stashed changes back. The primary pull error always wins; cleanup
    /// failures are logged, never propagated.
    fn recover_failed_pull(
        &self,
        context: &RepositoryContext,
        pull: &CommandOutput,
        safety_net: Option<StashSafetyNet>,
    ) -> CompoundOperationResult {
        let exec = context.executor();
        let message = pull.combined_message().to_string();

        if is_missing_upstream(&message) {
            // Benign: nothing to pull yet. Restore the stash we took.
            let mut benign = String::from("No upstream tracking branch; nothing to pull yet");
            if let Some(net) = &safety_net {
                if !try_restore_stash(exec, net) {
                    benign.push_str(&format!(
                        ". Your local changes remain in stash '{}'; \
                         recover them with 'git stash pop'",
                        net.label
                    ));
                }
            }
            return CompoundOperationResult::ok(benign);
        }

        let conflict = is_conflict_shaped(&message);
        if conflict {
            debug!("pull: aborting in-progress rebase after conflict");
            match exec.run(&["rebase", "--abort"]) {
                Ok(abort) if !abort.success() => {
                    warn!("pull: rebase --abort failed: {}", abort.combined_message());
                }
                Err(e) => warn!("pull: rebase --abort failed: {e}"),
                Ok(_) => {}
            }
        }

        let mut stash_note = String::new();
        if let Some(net) = safety_net {
            if try_restore_stash(exec, &net) {
                debug!("pull: restored safety-net stash after failed pull");
            } else {
                stash_note = format!(
                    " Your local changes are preserved in stash '{}'; \
                     recover them with 'git stash pop'.",
                    net.label
                );
            }
        }

        let result =
            CompoundOperationResult::failed(format!("Pull failed: {message}{stash_note}"));
        if conflict {
            result.with_conflicts()
        } else {
            result
        }
    }
}

impl Default for SyncOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

/// Best-effort `stash pop`; true only when the pop ran and exited cleanly.
/// Failures are logged here, the caller decides what to tell the user.
fn try_restore_stash(exec: &dyn CommandExecutor, net: &StashSafetyNet) -> bool {
    match exec.run(&["stash", "pop"]) {
        Ok(pop) if pop.success() => true,
        Ok(pop) => {
            warn!(
                "stash {} could not be restored: {}",
                net.label,
                pop.combined_message()
            );
            false
        }
        Err(e) => {
            warn!("stash {} could not be restored: {e}", net.label);
            false
        }
    }
}

fn is_conflict_shaped(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("conflict")
        || lower.contains("could not apply")
        || lower.contains("needs merge")
}

/// True only for git's no-upstream/no-remote-configured phrasings. Errors
/// about a remote that exists but cannot be reached must not match: those are
/// failures, not "nothing to pull yet".
fn is_missing_upstream(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("no upstream")
        || lower.contains("no tracking information")
        || lower.contains("does not point to a branch")
        || lower.contains("no remote repository specified")
}

/// Paths git names when a patch application fails, scraped from stderr.
fn conflicting_paths(stderr: &str) -> Vec<String> {
    let mut paths: Vec<String> = PATCH_FAILED_PATH
        .captures_iter(stderr)
        .chain(UNMERGED_PATH.captures_iter(stderr))
        .map(|c| c[1].trim().to_string())
        .collect();
    paths.sort();
    paths.dedup();
    paths
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '-',
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandExecutor;
    use std::collections::{HashMap, VecDeque};
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};

    /// Scripted executor: responses are queued per git subcommand and every
    /// invocation is logged in order.
    struct FakeGit {
        workdir: PathBuf,
        outputs: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
        log: Arc<Mutex<Vec<String>>>,
        delay: Option<std::time::Duration>,
    }

    impl FakeGit {
        fn new() -> Self {
            Self {
                workdir: PathBuf::from("/fake/repo"),
                outputs: Mutex::new(HashMap::new()),
                log: Arc::new(Mutex::new(Vec::new())),
                delay: None,
            }
        }

        fn expect(self, subcommand: &str, output: CommandOutput) -> Self {
            self.outputs
                .lock()
                .unwrap()
                .entry(subcommand.to_string())
                .or_default()
                .push_back(output);
            self
        }

        fn log_entries(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn ok_out(stdout: &str) -> CommandOutput {
        CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    fn err_out(stderr: &str) -> CommandOutput {
        CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: 1,
        }
    }

    impl CommandExecutor for FakeGit {
        fn run(&self, args: &[&str]) -> Result<CommandOutput, ExecError> {
            self.log.lock().unwrap().push(args.join(" "));
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }

            let output = self
                .outputs
                .lock()
                .unwrap()
                .get_mut(args[0])
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| panic!("unscripted git command: {}", args.join(" ")));
            Ok(output)
        }

        fn workdir(&self) -> &Path {
            &self.workdir
        }
    }

    fn context_with(fake: FakeGit) -> RepositoryContext {
        RepositoryContext::with_executor(PathBuf::from("/fake/repo"), Box::new(fake))
    }

    #[test]
    fn test_pull_already_up_to_date_is_a_noop() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect("rev-list", ok_out("0\n"));
        let log = Arc::clone(&fake.log);
        let context = context_with(fake);

        let result = SyncOrchestrator::new().pull_with_safety_net(&context).unwrap();

        assert!(result.success);
        assert!(!result.auto_stashed);
        assert!(!result.had_conflicts);
        // No stash, pull, or status commands were issued.
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["fetch", "rev-list --count HEAD..@{u}"]
        );
    }

    #[test]
    fn test_pull_without_upstream_is_benign() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect(
                "rev-list",
                err_out("fatal: no upstream configured for branch 'main'"),
            );
        let context = context_with(fake);

        let result = SyncOrchestrator::new().pull_with_safety_net(&context).unwrap();
        assert!(result.success);
        assert!(result.message.contains("nothing to pull"));
    }

    #[test]
    fn test_pull_clean_tree_skips_stash() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect("rev-list", ok_out("2\n"))
            .expect("status", ok_out(""))
            .expect("pull", ok_out("Fast-forwarded.\n"));
        let context = context_with(fake);

        let result = SyncOrchestrator::new().pull_with_safety_net(&context).unwrap();
        assert!(result.success);
        assert!(!result.auto_stashed);
        assert!(result.message.contains("2 commit(s)"));
    }

    #[test]
    fn test_pull_stashes_and_restores_dirty_tree() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect("rev-list", ok_out("1\n"))
            .expect("status", ok_out(" M src/main.rs\n"))
            .expect("stash", ok_out("Saved working directory\n"))
            .expect("pull", ok_out("Successfully rebased.\n"))
            .expect("stash", ok_out("Dropped refs/stash@{0}\n"));
        let log = Arc::clone(&fake.log);
        let context = context_with(fake);

        let result = SyncOrchestrator::new().pull_with_safety_net(&context).unwrap();

        assert!(result.success);
        assert!(result.auto_stashed);
        assert!(!result.had_conflicts);

        let entries = log.lock().unwrap().clone();
        assert!(entries[3].starts_with("stash push -u -m repodeck-safety-net-"));
        assert_eq!(entries[4], "pull --rebase");
        assert_eq!(entries[5], "stash pop");
    }

    #[test]
    fn test_pull_restore_conflict_reports_and_consumes_stash() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect("rev-list", ok_out("1\n"))
            .expect("status", ok_out(" M a.txt\n"))
            .expect("stash", ok_out(""))
            .expect("pull", ok_out(""))
            .expect(
                "stash",
                err_out("CONFLICT (content): Merge conflict in a.txt"),
            )
            .expect("stash", ok_out("Dropped refs/stash@{0}\n"));
        let log = Arc::clone(&fake.log);
        let context = context_with(fake);

        let result = SyncOrchestrator::new().pull_with_safety_net(&context).unwrap();

        // Pull itself succeeded, the restore conflicted.
        assert!(result.success);
        assert!(result.had_conflicts);
        assert!(result.auto_stashed);
        assert!(result.message.contains("manually"));
        assert_eq!(log.lock().unwrap().last().unwrap(), "stash drop");
    }

    #[test]
    fn test_pull_restore_failure_leaves_stash_in_list() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect("rev-list", ok_out("1\n"))
            .expect("status", ok_out(" M a.txt\n"))
            .expect("stash", ok_out(""))
            .expect("pull", ok_out(""))
            .expect("stash", err_out("error: unable to refresh index"));
        let log = Arc::clone(&fake.log);
        let context = context_with(fake);

        let result = SyncOrchestrator::new().pull_with_safety_net(&context).unwrap();

        assert!(result.success);
        assert!(!result.had_conflicts);
        assert!(result.auto_stashed);
        assert!(result.message.contains("git stash pop"));
        // No stash drop: the entry is deliberately left for manual recovery.
        assert!(!log.lock().unwrap().iter().any(|c| c == "stash drop"));
    }

    #[test]
    fn test_pull_conflict_aborts_rebase_and_restores_stash() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect("rev-list", ok_out("1\n"))
            .expect("status", ok_out(" M a.txt\n"))
            .expect("stash", ok_out(""))
            .expect(
                "pull",
                err_out("CONFLICT (content): Merge conflict in a.txt\nerror: could not apply abc123"),
            )
            .expect("rebase", ok_out(""))
            .expect("stash", ok_out(""));
        let log = Arc::clone(&fake.log);
        let context = context_with(fake);

        let result = SyncOrchestrator::new().pull_with_safety_net(&context).unwrap();

        assert!(!result.success);
        assert!(result.had_conflicts);
        assert!(result.message.contains("Pull failed"));

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries[5], "rebase --abort");
        assert_eq!(entries[6], "stash pop");
    }

    #[test]
    fn test_pull_unreachable_remote_is_a_failure() {
        let fake = FakeGit::new().expect(
            "fetch",
            err_out(
                "fatal: 'origin' does not appear to be a git repository\n\
                 fatal: Could not read from remote repository.",
            ),
        );
        let context = context_with(fake);

        let result = SyncOrchestrator::new().pull_with_safety_net(&context).unwrap();
        assert!(!result.success);
        assert!(result.message.contains("Fetch failed"));
        assert!(result.message.contains("does not appear to be a git repository"));
    }

    #[test]
    fn test_pull_broken_behind_check_is_a_failure() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect("rev-list", err_out("fatal: bad object HEAD"));
        let log = Arc::clone(&fake.log);
        let context = context_with(fake);

        let result = SyncOrchestrator::new().pull_with_safety_net(&context).unwrap();

        assert!(!result.success);
        assert!(result.message.contains("bad object HEAD"));
        // Neither a stash nor a pull was attempted on the broken repository.
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["fetch", "rev-list --count HEAD..@{u}"]
        );
    }

    #[test]
    fn test_pull_unreadable_status_aborts_before_stashing() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect("rev-list", ok_out("1\n"))
            .expect(
                "status",
                err_out("fatal: this operation must be run in a work tree"),
            );
        let log = Arc::clone(&fake.log);
        let context = context_with(fake);

        let result = SyncOrchestrator::new().pull_with_safety_net(&context).unwrap();

        assert!(!result.success);
        assert!(result.message.contains("working tree"));
        assert!(!log
            .lock()
            .unwrap()
            .iter()
            .any(|c| c.starts_with("stash") || c.starts_with("pull")));
    }

    #[test]
    fn test_pull_no_upstream_after_stash_names_unrestored_stash() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect("rev-list", ok_out("1\n"))
            .expect("status", ok_out(" M a.txt\n"))
            .expect("stash", ok_out(""))
            .expect(
                "pull",
                err_out("There is no tracking information for the current branch."),
            )
            .expect("stash", err_out("error: unable to refresh index"));
        let context = context_with(fake);

        let result = SyncOrchestrator::new().pull_with_safety_net(&context).unwrap();

        assert!(result.success);
        assert!(result.message.contains("nothing to pull"));
        assert!(result.message.contains("repodeck-safety-net-"));
        assert!(result.message.contains("git stash pop"));
    }

    #[test]
    fn test_pull_transient_failure_surfaces_raw_message() {
        let fake = FakeGit::new()
            .expect("fetch", err_out("fatal: unable to access remote: network unreachable"));
        let context = context_with(fake);

        let result = SyncOrchestrator::new().pull_with_safety_net(&context).unwrap();
        assert!(!result.success);
        assert!(result.message.contains("network unreachable"));
    }

    #[test]
    fn test_commit_refuses_when_behind() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect("rev-list", ok_out("3\n"));
        let log = Arc::clone(&fake.log);
        let context = context_with(fake);

        let result = SyncOrchestrator::new()
            .commit_with_behind_check(&context, "add feature", false)
            .unwrap();

        assert!(!result.success);
        assert!(result.message.contains("3 commit(s) behind"));
        // Nothing was staged or committed.
        assert!(!log.lock().unwrap().iter().any(|c| c.starts_with("commit")));
    }

    #[test]
    fn test_commit_force_skips_behind_check() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect("add", ok_out(""))
            .expect("commit", ok_out("[main abc123] add feature\n"));
        let log = Arc::clone(&fake.log);
        let context = context_with(fake);

        let result = SyncOrchestrator::new()
            .commit_with_behind_check(&context, "add feature", true)
            .unwrap();

        assert!(result.success);
        assert!(result.message.contains("add feature"));
        let entries = log.lock().unwrap().clone();
        assert!(!entries.iter().any(|c| c.starts_with("rev-list")));
        assert_eq!(entries[2], "commit --no-gpg-sign -m add feature");
    }

    #[test]
    fn test_commit_without_upstream_proceeds() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect(
                "rev-list",
                err_out("fatal: no upstream configured for branch 'main'"),
            )
            .expect("add", ok_out(""))
            .expect("commit", ok_out("[main abc123] msg\n"));
        let context = context_with(fake);

        let result = SyncOrchestrator::new()
            .commit_with_behind_check(&context, "msg", false)
            .unwrap();
        assert!(result.success);
    }

    #[test]
    fn test_commit_proceeds_when_behind_check_is_broken() {
        let fake = FakeGit::new()
            .expect("fetch", ok_out(""))
            .expect("rev-list", err_out("fatal: bad object HEAD"))
            .expect("add", ok_out(""))
            .expect("commit", ok_out("[main abc123] msg\n"));
        let context = context_with(fake);

        let result = SyncOrchestrator::new()
            .commit_with_behind_check(&context, "msg", false)
            .unwrap();
        assert!(result.success);
    }

    #[test]
    fn test_commit_empty_message_is_a_precondition_error() {
        let context = context_with(FakeGit::new());
        let result = SyncOrchestrator::new().commit_with_behind_check(&context, "  ", false);
        assert!(matches!(result, Err(SyncError::EmptyCommitMessage)));
    }

    #[test]
    fn test_promote_fails_without_base_branch() {
        let fake = FakeGit::new()
            .expect("rev-parse", err_out(""))
            .expect("rev-parse", err_out(""))
            .expect("rev-parse", err_out(""))
            .expect("rev-parse", err_out(""));
        let context = context_with(fake);

        let result = SyncOrchestrator::new()
            .promote_workspace_to_branch(&context, "scratch-1")
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("main or master"));
    }

    #[test]
    fn test_promote_rejects_unusable_name() {
        let context = context_with(FakeGit::new());
        let result = SyncOrchestrator::new().promote_workspace_to_branch(&context, "///");
        assert!(matches!(result, Err(SyncError::InvalidWorkspaceName(_))));
    }

    #[test]
    fn test_promote_empty_delta_is_reported() {
        let fake = FakeGit::new()
            .expect("rev-parse", ok_out("abc123\n"))
            .expect("add", ok_out(""))
            .expect("diff", ok_out(""))
            .expect("reset", ok_out(""));
        let context = context_with(fake);

        let result = SyncOrchestrator::new()
            .promote_workspace_to_branch(&context, "scratch-1")
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("no changes"));
    }

    #[test]
    fn test_promote_apply_failure_names_paths_and_keeps_branch() {
        let fake = FakeGit::new()
            .expect("rev-parse", ok_out("abc123\n"))
            .expect("add", ok_out(""))
            .expect(
                "diff",
                ok_out("diff --git a/a.txt b/a.txt\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-x\n+y\n"),
            )
            .expect("reset", ok_out(""))
            .expect("stash", ok_out(""))
            .expect("checkout", ok_out(""))
            .expect(
                "apply",
                err_out("error: patch failed: a.txt:1\nerror: a.txt: patch does not apply"),
            );
        let log = Arc::clone(&fake.log);
        let context = context_with(fake);

        let result = SyncOrchestrator::new()
            .promote_workspace_to_branch(&context, "scratch-1")
            .unwrap();

        assert!(!result.success);
        assert!(result.had_conflicts);
        assert_eq!(result.branch_name.as_deref(), Some("workspace/scratch-1"));
        assert!(result.message.contains("a.txt"));
        // The branch is not deleted and the parked stash is not dropped.
        let entries = log.lock().unwrap().clone();
        assert!(!entries.iter().any(|c| c.starts_with("branch -")));
        assert!(!entries.iter().any(|c| c == "stash drop"));
    }

    #[test]
    fn test_promote_checkout_failure_names_unrestored_stash() {
        let fake = FakeGit::new()
            .expect("rev-parse", ok_out("abc123\n"))
            .expect("add", ok_out(""))
            .expect(
                "diff",
                ok_out("diff --git a/a.txt b/a.txt\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-x\n+y\n"),
            )
            .expect("reset", ok_out(""))
            .expect("stash", ok_out(""))
            .expect(
                "checkout",
                err_out("fatal: a branch named 'workspace/scratch-1' already exists"),
            )
            .expect("stash", err_out("error: unable to refresh index"));
        let context = context_with(fake);

        let result = SyncOrchestrator::new()
            .promote_workspace_to_branch(&context, "scratch-1")
            .unwrap();

        assert!(!result.success);
        assert!(result.message.contains("already exists"));
        // The pop failed, so the message must point at the parked stash.
        assert!(result.message.contains("repodeck-promote-"));
        assert!(result.message.contains("git stash pop"));
    }

    #[test]
    fn test_promote_checkout_failure_with_clean_restore_stays_quiet() {
        let fake = FakeGit::new()
            .expect("rev-parse", ok_out("abc123\n"))
            .expect("add", ok_out(""))
            .expect(
                "diff",
                ok_out("diff --git a/a.txt b/a.txt\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-x\n+y\n"),
            )
            .expect("reset", ok_out(""))
            .expect("stash", ok_out(""))
            .expect(
                "checkout",
                err_out("fatal: a branch named 'workspace/scratch-1' already exists"),
            )
            .expect("stash", ok_out("Dropped refs/stash@{0}\n"));
        let context = context_with(fake);

        let result = SyncOrchestrator::new()
            .promote_workspace_to_branch(&context, "scratch-1")
            .unwrap();

        assert!(!result.success);
        // Workspace was put back in place: no stash instructions needed.
        assert!(!result.message.contains("stash"));
    }

    #[test]
    fn test_promote_happy_path_stages_without_committing() {
        let fake = FakeGit::new()
            .expect("rev-parse", ok_out("abc123\n"))
            .expect("add", ok_out(""))
            .expect(
                "diff",
                ok_out("diff --git a/a.txt b/a.txt\n--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-x\n+y\n"),
            )
            .expect("reset", ok_out(""))
            .expect("stash", ok_out(""))
            .expect("checkout", ok_out(""))
            .expect("apply", ok_out(""))
            .expect("add", ok_out(""))
            .expect("stash", ok_out(""));
        let log = Arc::clone(&fake.log);
        let context = context_with(fake);

        let result = SyncOrchestrator::new()
            .promote_workspace_to_branch(&context, "my scratch pad")
            .unwrap();

        assert!(result.success);
        assert_eq!(result.branch_name.as_deref(), Some("workspace/my-scratch-pad"));

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries[0], "rev-parse --verify --quiet origin/main");
        assert!(entries
            .iter()
            .any(|c| c == "checkout -b workspace/my-scratch-pad origin/main"));
        assert_eq!(entries.last().unwrap(), "stash drop");
        // No commit was issued: the human keeps control of the message.
        assert!(!entries.iter().any(|c| c.starts_with("commit")));
    }

    #[test]
    fn test_workflows_on_same_context_serialize() {
        let mut fake = FakeGit::new();
        fake.delay = Some(std::time::Duration::from_millis(10));
        // Two up-to-date pulls, scripted back to back.
        let fake = fake
            .expect("fetch", ok_out(""))
            .expect("rev-list", ok_out("0\n"))
            .expect("fetch", ok_out(""))
            .expect("rev-list", ok_out("0\n"));
        let log = Arc::clone(&fake.log);
        let context = Arc::new(context_with(fake));

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let context = Arc::clone(&context);
                std::thread::spawn(move || {
                    SyncOrchestrator::new().pull_with_safety_net(&context).unwrap()
                })
            })
            .collect();
        for t in threads {
            assert!(t.join().unwrap().success);
        }

        // One workflow's commands fully precede the other's.
        assert_eq!(
            log.lock().unwrap().as_slice(),
            [
                "fetch",
                "rev-list --count HEAD..@{u}",
                "fetch",
                "rev-list --count HEAD..@{u}"
            ]
        );
    }

    #[test]
    fn test_conflicting_path_scrape() {
        let stderr = "error: patch failed: src/lib.rs:10\n\
                      Applied patch to 'src/other.rs' with conflicts.\n\
                      U src/other.rs\n\
                      error: patch failed: src/lib.rs:42";
        let paths = conflicting_paths(stderr);
        assert_eq!(paths, vec!["src/lib.rs".to_string(), "src/other.rs".to_string()]);
    }

    #[test]
    fn test_error_text_classification() {
        assert!(is_conflict_shaped("CONFLICT (content): Merge conflict in x"));
        assert!(is_conflict_shaped("error: could not apply abc123"));
        assert!(!is_conflict_shaped("fatal: network unreachable"));

        assert!(is_missing_upstream(
            "There is no tracking information for the current branch."
        ));
        assert!(is_missing_upstream("fatal: no upstream configured for branch 'main'"));
        assert!(is_missing_upstream(
            "fatal: No remote repository specified as default."
        ));
        assert!(!is_missing_upstream("CONFLICT (content)"));
        // Unreachable-remote errors are real failures, never "no upstream".
        assert!(!is_missing_upstream(
            "fatal: 'origin' does not appear to be a git repository"
        ));
        assert!(!is_missing_upstream(
            "fatal: Could not read from remote repository."
        ));
    }
}
