// SPDX-License-Identifier: MIT

//! Per-repository git driver.
//!
//! The orchestrator talks to every repository through the [`GitAccess`]
//! trait. The concrete driver is a hybrid: libgit2 for local object, index,
//! status, and branch work, and the `git` binary for checkout and the
//! network verbs, each invocation scoped to its repository through `git -C`
//! so the orchestrating process never changes its own working directory.
//!
//! # Branch-Scoped Reads
//!
//! Project repositories keep their web configuration on a branch disjoint
//! from their development history, so reading one file from another branch
//! is a routine operation. [`GitAccess::read_on_branch`] guarantees that the
//! repository is back on its original branch when the call returns, on the
//! error path included, and performs zero checkouts when the repository is
//! already on the requested branch.

use crate::interrupt;

use git2::{BranchType, ErrorCode, Repository, RepositoryInitOptions, StatusOptions};
use std::{
    cell::Cell,
    ffi::OsStr,
    fs,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, warn};

/// Counts of pending changes in a working tree.
///
/// Both must be consulted: a repository with only new untracked files is
/// not clean.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChangeCounts {
    /// Tracked files with staged or unstaged modifications.
    pub modified: usize,

    /// Untracked files not excluded by ignore rules.
    pub untracked: usize,

    /// Files whose index entry differs from head. These are what an
    /// immediate commit would actually record.
    pub staged: usize,
}

impl ChangeCounts {
    /// Whether there is nothing to commit.
    pub fn is_clean(&self) -> bool {
        self.modified == 0 && self.untracked == 0
    }
}

/// Layer of indirection between the orchestrator and git.
pub trait GitAccess: Sized {
    /// Open an existing repository at a resolved path.
    fn open(path: &Path) -> Result<Self>;

    /// Initialize a new repository with `main` as the initial head.
    fn init(path: &Path) -> Result<Self>;

    /// Name of the currently checked out branch.
    ///
    /// `None` for a detached head or an unborn branch.
    fn current_branch(&self) -> Result<Option<String>>;

    /// Short hash of the head commit, `None` for an unborn branch.
    fn short_hash(&self) -> Result<Option<String>>;

    /// Full message of the head commit, `None` for an unborn branch.
    fn head_message(&self) -> Result<Option<String>>;

    /// Pending modified and untracked counts.
    fn change_counts(&self) -> Result<ChangeCounts>;

    /// Whether a local branch with this name exists.
    fn branch_exists(&self, name: &str) -> Result<bool>;

    /// Create a local branch at the current head.
    fn create_branch(&self, name: &str) -> Result<()>;

    /// Delete a local branch.
    fn delete_branch(&self, name: &str) -> Result<()>;

    /// Names of all local branches.
    fn list_branches(&self) -> Result<Vec<String>>;

    /// Check out a branch.
    fn checkout(&self, branch: &str) -> Result<()>;

    /// How many checkouts this handle has performed.
    fn checkout_count(&self) -> usize;

    /// Stage tracked modifications and eligible untracked files.
    ///
    /// Symlinks are never staged: a symlink in this ecosystem points at
    /// another managed repository, and committing it would corrupt the
    /// structure the symlink exists to express.
    fn stage_changes(&self) -> Result<usize>;

    /// Commit the staged index, returning the new short hash.
    fn commit(&self, message: &str, amend: bool) -> Result<String>;

    /// Read one file as it exists on a branch, restoring the original
    /// branch before returning. Absent files are `Ok(None)`, not errors.
    fn read_on_branch(&self, branch: &str, path: &Path) -> Result<Option<Vec<u8>>>;

    /// Push a branch to origin.
    fn push(&self, branch: &str, force: bool, set_upstream: bool) -> Result<String>;

    /// Pull a branch from origin.
    fn pull(&self, branch: &str, rebase: bool) -> Result<String>;

    /// Merge a source branch into the current branch.
    fn merge(&self, source: &str, ff_only: bool) -> Result<String>;

    /// Rebase the current branch onto a target.
    fn rebase_onto(&self, target: &str) -> Result<String>;

    /// Reset the working tree against head.
    fn reset(&self, hard: bool) -> Result<String>;
}

/// Git access through libgit2 plus the git binary.
pub struct Git2Repo {
    repo: Repository,
    workdir: PathBuf,
    checkouts: Cell<usize>,
}

impl Git2Repo {
    /// Working tree path of this repository.
    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn read_worktree(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match fs::read(self.workdir.join(path)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(RepoError::Io(err)),
        }
    }

    fn head_commit(&self) -> Result<Option<git2::Commit<'_>>> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?)),
            Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn git_call(&self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> Result<String> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.workdir)
            .args(args)
            .output()?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let mut message = String::new();

        if !stdout.is_empty() {
            message.push_str(&stdout);
        }

        if !stderr.is_empty() {
            message.push_str(&stderr);
        }

        // Chomp trailing newlines.
        let message = message
            .strip_suffix("\r\n")
            .or(message.strip_suffix('\n'))
            .map(ToString::to_string)
            .unwrap_or(message);

        if !output.status.success() {
            if message.contains("CONFLICT") {
                return Err(RepoError::MergeConflict { message });
            }

            return Err(RepoError::GitCommand { message });
        }

        Ok(message)
    }
}

impl GitAccess for Git2Repo {
    fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| RepoError::Bare {
                path: path.to_path_buf(),
            })?
            .to_path_buf();

        Ok(Self {
            repo,
            workdir,
            checkouts: Cell::new(0),
        })
    }

    fn init(path: &Path) -> Result<Self> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path, &opts)?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| RepoError::Bare {
                path: path.to_path_buf(),
            })?
            .to_path_buf();

        Ok(Self {
            repo,
            workdir,
            checkouts: Cell::new(0),
        })
    }

    fn current_branch(&self) -> Result<Option<String>> {
        match self.repo.head() {
            Ok(head) if head.is_branch() => Ok(head.shorthand().map(str::to_owned)),
            Ok(_) => Ok(None),
            Err(err) if matches!(err.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn short_hash(&self) -> Result<Option<String>> {
        Ok(self
            .head_commit()?
            .map(|commit| commit.id().to_string()[..7].to_owned()))
    }

    fn head_message(&self) -> Result<Option<String>> {
        Ok(self
            .head_commit()?
            .and_then(|commit| commit.message().map(str::to_owned)))
    }

    fn change_counts(&self) -> Result<ChangeCounts> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .exclude_submodules(true);

        let mut counts = ChangeCounts::default();
        for entry in self.repo.statuses(Some(&mut opts))?.iter() {
            let status = entry.status();
            if status.is_wt_new() {
                counts.untracked += 1;
            } else if !status.is_ignored() {
                counts.modified += 1;
            }

            if status.is_index_new()
                || status.is_index_modified()
                || status.is_index_deleted()
                || status.is_index_renamed()
                || status.is_index_typechange()
            {
                counts.staged += 1;
            }
        }

        Ok(counts)
    }

    fn branch_exists(&self, name: &str) -> Result<bool> {
        match self.repo.find_branch(name, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(err) if err.code() == ErrorCode::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn create_branch(&self, name: &str) -> Result<()> {
        let commit = self.head_commit()?.ok_or_else(|| RepoError::NoHistory {
            path: self.workdir.clone(),
        })?;
        self.repo.branch(name, &commit, false)?;

        Ok(())
    }

    fn delete_branch(&self, name: &str) -> Result<()> {
        let mut branch = self.repo.find_branch(name, BranchType::Local)?;
        branch.delete()?;

        Ok(())
    }

    fn list_branches(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for branch in self.repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(name) = branch.name()? {
                names.push(name.to_owned());
            }
        }

        Ok(names)
    }

    fn checkout(&self, branch: &str) -> Result<()> {
        self.checkouts.set(self.checkouts.get() + 1);
        debug!("checkout {branch} in {}", self.workdir.display());
        self.git_call(["checkout", branch])?;

        Ok(())
    }

    fn checkout_count(&self) -> usize {
        self.checkouts.get()
    }

    fn stage_changes(&self) -> Result<usize> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .exclude_submodules(true);

        let mut index = self.repo.index()?;
        let mut staged = 0;
        for entry in self.repo.statuses(Some(&mut opts))?.iter() {
            let Some(path) = entry.path() else {
                warn!("skipping non-utf8 path in {}", self.workdir.display());
                continue;
            };
            let status = entry.status();
            let relative = Path::new(path);

            if status.is_wt_new() {
                let full = self.workdir.join(relative);
                let is_symlink = full
                    .symlink_metadata()
                    .map(|meta| meta.file_type().is_symlink())
                    .unwrap_or(false);
                if is_symlink {
                    debug!("never staging symlink {path}");
                    continue;
                }

                index.add_path(relative)?;
                staged += 1;
            } else if status.is_wt_deleted() {
                index.remove_path(relative)?;
                staged += 1;
            } else if status.is_wt_modified() || status.is_wt_typechange() || status.is_wt_renamed()
            {
                index.add_path(relative)?;
                staged += 1;
            }
        }

        if staged > 0 {
            index.write()?;
        }

        Ok(staged)
    }

    fn commit(&self, message: &str, amend: bool) -> Result<String> {
        let mut index = self.repo.index()?;
        let tree_oid = index.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;
        let signature = self.repo.signature()?;

        let oid = if amend {
            let head = self.head_commit()?.ok_or_else(|| RepoError::NoHistory {
                path: self.workdir.clone(),
            })?;
            head.amend(Some("HEAD"), None, None, None, Some(message), Some(&tree))?
        } else {
            let parents = self.head_commit()?.into_iter().collect::<Vec<_>>();
            let parents = parents.iter().collect::<Vec<_>>();
            self.repo.commit(
                Some("HEAD"),
                &signature,
                &signature,
                message,
                &tree,
                &parents,
            )?
        };

        Ok(oid.to_string()[..7].to_owned())
    }

    fn read_on_branch(&self, branch: &str, path: &Path) -> Result<Option<Vec<u8>>> {
        let original = self.current_branch()?.ok_or_else(|| RepoError::Detached {
            path: self.workdir.clone(),
        })?;

        // No churn when already in place: read directly, zero checkouts.
        if original == branch {
            return self.read_worktree(path);
        }

        self.checkout(branch)?;
        let _restore = BranchRestore::arm(self, &original);

        self.read_worktree(path)
    }

    fn push(&self, branch: &str, force: bool, set_upstream: bool) -> Result<String> {
        let mut args = vec!["push"];
        if force {
            args.push("--force");
        }
        if set_upstream {
            args.push("--set-upstream");
        }
        args.extend(["origin", branch]);

        self.git_call(args)
    }

    fn pull(&self, branch: &str, rebase: bool) -> Result<String> {
        let mut args = vec!["pull"];
        if rebase {
            args.push("--rebase");
        }
        args.extend(["origin", branch]);

        self.git_call(args)
    }

    fn merge(&self, source: &str, ff_only: bool) -> Result<String> {
        let mut args = vec!["merge"];
        if ff_only {
            args.push("--ff-only");
        }
        args.push(source);

        self.git_call(args)
    }

    fn rebase_onto(&self, target: &str) -> Result<String> {
        self.git_call(["rebase", target])
    }

    fn reset(&self, hard: bool) -> Result<String> {
        let mode = if hard { "--hard" } else { "--mixed" };
        self.git_call(["reset", mode])
    }
}

/// Scope guard restoring the original branch of a repository.
///
/// Armed after a successful checkout away from the original branch. Runs in
/// three situations: the normal return path, an error in the read step, and
/// process interrupt (through a registered cleanup action). The drop path
/// deregisters the interrupt action so it cannot fire twice.
struct BranchRestore<'a> {
    repo: &'a Git2Repo,
    original: String,
    _token: interrupt::CleanupToken,
}

impl<'a> BranchRestore<'a> {
    fn arm(repo: &'a Git2Repo, original: &str) -> Self {
        let workdir = repo.workdir.clone();
        let branch = original.to_owned();
        let token = interrupt::defer(move || {
            let _ = Command::new("git")
                .arg("-C")
                .arg(&workdir)
                .args(["checkout", &branch])
                .output();
        });

        Self {
            repo,
            original: original.to_owned(),
            _token: token,
        }
    }
}

impl Drop for BranchRestore<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.repo.checkout(&self.original) {
            warn!(
                "failed to restore branch {} in {}: {error}",
                self.original,
                self.repo.workdir.display()
            );
        }
    }
}

/// Git driver error types.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// The git binary cannot be spawned.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The git binary exited unsuccessfully.
    #[error("git command failed:\n{message}")]
    GitCommand { message: String },

    /// A merge or rebase hit conflicts that need manual resolution.
    #[error("merge conflict, resolve manually:\n{message}")]
    MergeConflict { message: String },

    /// Repository has no working tree to operate on.
    #[error("repository at {:?} is bare", path.display())]
    Bare { path: PathBuf },

    /// Repository is not on any branch.
    #[error("repository at {:?} is not on a branch", path.display())]
    Detached { path: PathBuf },

    /// Operation needs at least one commit.
    #[error("repository at {:?} has no commits yet", path.display())]
    NoHistory { path: PathBuf },
}

/// Friendly result alias.
pub type Result<T, E = RepoError> = std::result::Result<T, E>;
