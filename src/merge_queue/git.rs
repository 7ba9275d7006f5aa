//! Git probes used by the merge queue: freshness, conflict detection and
//! rebasing. Conflict probes and rebases run in memory. A successful rebase
//! then moves the branch and brings any worktree that has it checked out
//! along with it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use git2::{
    ErrorCode, Index, Oid, RebaseOptions, Repository, ResetType, Signature, StatusOptions,
};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::MergeQueueError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Freshness {
    /// True when the branch's merge-base with main is main's tip.
    pub fresh: bool,
    pub commits_behind: usize,
    pub merge_base: String,
    pub main_tip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConflictReport {
    pub has_conflicts: bool,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum RebaseOutcome {
    /// The branch now sits on main's tip.
    Rebased { new_head: String },
    /// The rebase hit conflicts and was aborted; the branch is unchanged.
    Conflicted { files: Vec<String> },
}

pub struct GitRepo {
    repo: Repository,
}

impl GitRepo {
    pub fn open(path: &Path) -> Result<Self, MergeQueueError> {
        Ok(Self {
            repo: Repository::discover(path)?,
        })
    }

    pub fn from_repository(repo: Repository) -> Self {
        Self { repo }
    }

    fn commit_id(&self, rev: &str) -> Result<Oid, MergeQueueError> {
        Ok(self.repo.revparse_single(rev)?.peel_to_commit()?.id())
    }

    pub fn check_freshness(&self, branch: &str, main: &str) -> Result<Freshness, MergeQueueError> {
        let branch_id = self.commit_id(branch)?;
        let main_id = self.commit_id(main)?;
        let base = self.repo.merge_base(branch_id, main_id)?;
        let (_ahead, behind) = self.repo.graph_ahead_behind(branch_id, main_id)?;
        Ok(Freshness {
            fresh: base == main_id,
            commits_behind: behind,
            merge_base: base.to_string(),
            main_tip: main_id.to_string(),
        })
    }

    /// Three-way merge of `branch` into `main` in memory.
    pub fn detect_conflicts(&self, branch: &str, main: &str) -> Result<ConflictReport, MergeQueueError> {
        let ours = self.repo.find_commit(self.commit_id(main)?)?;
        let theirs = self.repo.find_commit(self.commit_id(branch)?)?;
        let index = self.repo.merge_commits(&ours, &theirs, None)?;
        let files = conflict_paths(&index)?;
        Ok(ConflictReport {
            has_conflicts: !files.is_empty(),
            files,
        })
    }

    /// Every checkout (the main working tree and linked worktrees) whose
    /// HEAD is `refs/heads/<branch>`.
    fn checkouts_of(&self, branch: &str) -> Result<Vec<Repository>, MergeQueueError> {
        let refname = format!("refs/heads/{}", branch);
        let on_branch = |repo: &Repository| {
            !repo.is_bare()
                && repo
                    .find_reference("HEAD")
                    .ok()
                    .and_then(|head| head.symbolic_target().map(|t| t == refname))
                    .unwrap_or(false)
        };

        let mut checkouts = Vec::new();
        if on_branch(&self.repo) {
            checkouts.push(Repository::open(self.repo.path())?);
        }
        for name in self.repo.worktrees()?.iter().flatten() {
            let worktree = self.repo.find_worktree(name)?;
            if worktree.validate().is_err() {
                continue;
            }
            let repo = Repository::open_from_worktree(&worktree)?;
            if on_branch(&repo) {
                checkouts.push(repo);
            }
        }
        Ok(checkouts)
    }

    /// Replay `branch` onto `main`. On conflict the rebase is aborted and the
    /// branch ref is left where it was.
    ///
    /// A checkout of `branch` with uncommitted changes to tracked files
    /// refuses the rebase; clean checkouts are reset to the new head.
    pub fn rebase(&self, branch: &str, main: &str) -> Result<RebaseOutcome, MergeQueueError> {
        let branch_id = self.commit_id(branch)?;
        let main_id = self.commit_id(main)?;

        if self.repo.merge_base(branch_id, main_id)? == main_id {
            debug!(branch, main, "branch already on main tip, nothing to rebase");
            return Ok(RebaseOutcome::Rebased {
                new_head: branch_id.to_string(),
            });
        }

        let checkouts = self.checkouts_of(branch)?;
        for checkout in &checkouts {
            let mut opts = StatusOptions::new();
            opts.include_untracked(false).include_ignored(false);
            if !checkout.statuses(Some(&mut opts))?.is_empty() {
                return Err(MergeQueueError::DirtyWorktree {
                    branch: branch.to_string(),
                    path: checkout
                        .workdir()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| PathBuf::from(checkout.path())),
                });
            }
        }

        let signature = self
            .repo
            .signature()
            .or_else(|_| Signature::now("foreman", "foreman@localhost"))?;
        let branch_commit = self.repo.find_annotated_commit(branch_id)?;
        let upstream = self.repo.find_annotated_commit(main_id)?;

        let mut opts = RebaseOptions::new();
        opts.inmemory(true);

        let new_head = {
            let mut rebase =
                self.repo
                    .rebase(Some(&branch_commit), Some(&upstream), None, Some(&mut opts))?;
            let mut last = None;
            while let Some(op) = rebase.next() {
                if let Err(e) = op {
                    rebase.abort()?;
                    return Err(e.into());
                }
                let index = rebase.inmemory_index()?;
                if index.has_conflicts() {
                    let files = conflict_paths(&index)?;
                    rebase.abort()?;
                    info!(branch, ?files, "rebase aborted on conflict");
                    return Ok(RebaseOutcome::Conflicted { files });
                }
                match rebase.commit(None, &signature, None) {
                    Ok(oid) => last = Some(oid),
                    // Patch already present upstream.
                    Err(e) if e.code() == ErrorCode::Applied => {}
                    Err(e) => {
                        rebase.abort()?;
                        return Err(e.into());
                    }
                }
            }
            rebase.finish(Some(&signature))?;
            last.unwrap_or(main_id)
        };

        let refname = format!("refs/heads/{}", branch);
        self.repo
            .reference(&refname, new_head, true, &format!("foreman: rebase onto {}", main))?;
        for checkout in &checkouts {
            let commit = checkout.find_commit(new_head)?;
            checkout.reset(commit.as_object(), ResetType::Hard, None)?;
            debug!(branch, path = ?checkout.workdir(), "checkout moved to rebased head");
        }
        info!(branch, main, new_head = %new_head, "rebased branch");
        Ok(RebaseOutcome::Rebased {
            new_head: new_head.to_string(),
        })
    }
}

fn conflict_paths(index: &Index) -> Result<Vec<String>, MergeQueueError> {
    if !index.has_conflicts() {
        return Ok(Vec::new());
    }
    let mut files = BTreeSet::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        for entry in [conflict.our, conflict.their, conflict.ancestor]
            .into_iter()
            .flatten()
        {
            files.insert(String::from_utf8_lossy(&entry.path).into_owned());
        }
    }
    Ok(files.into_iter().collect())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stale_branch_reports_commits_behind() {
        let dir = tempdir().unwrap();
        let repo = diverged_repo(dir.path(), ("main.txt", "m\n"), ("feat.txt", "f\n"));
        let git = GitRepo::from_repository(repo);

        let freshness = git.check_freshness("feature", "main").unwrap();
        assert!(!freshness.fresh);
        assert_eq!(freshness.commits_behind, 1);
        assert_ne!(freshness.merge_base, freshness.main_tip);
    }

    #[test]
    fn clean_merge_has_no_conflicts() {
        let dir = tempdir().unwrap();
        let repo = diverged_repo(dir.path(), ("main.txt", "m\n"), ("feat.txt", "f\n"));
        let git = GitRepo::from_repository(repo);

        let report = git.detect_conflicts("feature", "main").unwrap();
        assert!(!report.has_conflicts);
        assert!(report.files.is_empty());
    }

    #[test]
    fn conflicting_edits_are_reported_by_path() {
        let dir = tempdir().unwrap();
        let repo = diverged_repo(
            dir.path(),
            ("shared.txt", "main version\n"),
            ("shared.txt", "feature version\n"),
        );
        let git = GitRepo::from_repository(repo);

        let report = git.detect_conflicts("feature", "main").unwrap();
        assert!(report.has_conflicts);
        assert_eq!(report.files, vec!["shared.txt"]);
    }

    #[test]
    fn rebase_moves_branch_onto_main() {
        let dir = tempdir().unwrap();
        let repo = diverged_repo(dir.path(), ("main.txt", "m\n"), ("feat.txt", "f\n"));
        let git = GitRepo::from_repository(repo);

        let outcome = git.rebase("feature", "main").unwrap();
        assert!(matches!(outcome, RebaseOutcome::Rebased { .. }));

        let freshness = git.check_freshness("feature", "main").unwrap();
        assert!(freshness.fresh);
        assert_eq!(freshness.commits_behind, 0);

        // Rebasing again is a no-op.
        let again = git.rebase("feature", "main").unwrap();
        assert_eq!(again, outcome);
    }

    fn add_worktree(repo: &Repository, branch: &str, path: &Path) -> Repository {
        let reference = repo
            .find_reference(&format!("refs/heads/{}", branch))
            .unwrap();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&reference));
        let worktree = repo.worktree("task-wt", path, Some(&opts)).unwrap();
        Repository::open_from_worktree(&worktree).unwrap()
    }

    fn is_clean(repo: &Repository) -> bool {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true);
        repo.statuses(Some(&mut opts)).unwrap().is_empty()
    }

    #[test]
    fn rebase_keeps_checked_out_worktree_in_sync() {
        let dir = tempdir().unwrap();
        let repo = diverged_repo(
            &dir.path().join("repo"),
            ("main.txt", "m\n"),
            ("feat.txt", "f\n"),
        );
        let wt_path = dir.path().join("wt");
        let worktree = add_worktree(&repo, "feature", &wt_path);
        assert!(is_clean(&worktree));
        assert!(!wt_path.join("main.txt").exists());

        let git = GitRepo::from_repository(repo);
        let new_head = match git.rebase("feature", "main").unwrap() {
            RebaseOutcome::Rebased { new_head } => new_head,
            other => panic!("expected rebase, got {:?}", other),
        };

        assert!(is_clean(&worktree));
        assert_eq!(
            worktree.head().unwrap().target().unwrap().to_string(),
            new_head
        );
        assert_eq!(std::fs::read_to_string(wt_path.join("main.txt")).unwrap(), "m\n");
        assert_eq!(std::fs::read_to_string(wt_path.join("feat.txt")).unwrap(), "f\n");
    }

    #[test]
    fn rebase_refuses_dirty_worktree() {
        let dir = tempdir().unwrap();
        let repo = diverged_repo(
            &dir.path().join("repo"),
            ("main.txt", "m\n"),
            ("feat.txt", "f\n"),
        );
        let wt_path = dir.path().join("wt");
        add_worktree(&repo, "feature", &wt_path);
        std::fs::write(wt_path.join("feat.txt"), "uncommitted\n").unwrap();

        let git = GitRepo::from_repository(repo);
        let before = git.commit_id("feature").unwrap();
        assert!(matches!(
            git.rebase("feature", "main"),
            Err(MergeQueueError::DirtyWorktree { .. })
        ));
        assert_eq!(git.commit_id("feature").unwrap(), before);
        assert_eq!(
            std::fs::read_to_string(wt_path.join("feat.txt")).unwrap(),
            "uncommitted\n"
        );
    }

    #[test]
    fn conflicting_rebase_is_aborted_and_branch_untouched() {
        let dir = tempdir().unwrap();
        let repo = diverged_repo(
            dir.path(),
            ("shared.txt", "main version\n"),
            ("shared.txt", "feature version\n"),
        );
        let git = GitRepo::from_repository(repo);
        let before = git.commit_id("feature").unwrap();

        match git.rebase("feature", "main").unwrap() {
            RebaseOutcome::Conflicted { files } => assert_eq!(files, vec!["shared.txt"]),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(git.commit_id("feature").unwrap(), before);
    }
}
