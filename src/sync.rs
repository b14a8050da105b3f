// SPDX-License-Identifier: MIT

//! Atomic multi-repository git orchestration.
//!
//! A personal site ecosystem is not one repository. The orchestration root,
//! the engine, every domain, blog, and project, and the shared content
//! repository all version independently, yet a coherent site snapshot needs
//! them committed and pushed as synchronized units. This module is the layer
//! that makes many repositories behave like one.
//!
//! # Sync Groups
//!
//! Repositories fall into exactly one of three groups, determined by kind:
//!
//! - __Engine__: the orchestration root and the engine repository.
//! - __Output__: every domain, blog, and project.
//! - __Content__: the independent content repository.
//!
//! Grouped commits process Engine, then Output, then Content. Output commits
//! carry a [`SyncReference`] trailer recording the engine hashes and branch
//! at commit time, so any site snapshot can be traced back to the
//! orchestration code that produced it. Git history is the only store for
//! that link.
//!
//! # Failure Semantics
//!
//! Multi-repository operations are best-effort batches: one repository
//! failing is logged in its outcome line and the batch moves on. Three
//! things are hard refusals that happen before any repository is touched:
//! branch-name validation, force-pushing a protected branch, and the
//! restore contract of branch-scoped reads.
//!
//! The loop is deliberately sequential. A repository's current branch is
//! shared mutable state and concurrent mutation within one process would
//! race against itself.

pub mod ignorefile;
pub mod reference;
pub mod repo;

use crate::context::Context;
use crate::discover::{classify, RepoKind, RepoRef, ROOT_ID};
use crate::sync::{
    ignorefile::ensure_ignored,
    reference::SyncReference,
    repo::{ChangeCounts, GitAccess, Git2Repo, RepoError},
};

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
    marker::PhantomData,
    path::Path,
};
use tracing::{debug, info, instrument, warn};

/// Branches that may never be force-pushed.
pub const PROTECTED_BRANCHES: &[&str] = &["main", "master"];

/// Branch names the `branch` operation accepts verbatim.
const ALLOWED_BRANCH_NAMES: &[&str] = &["main", "develop", "site"];

/// Branch name prefixes the `branch` operation accepts.
const ALLOWED_BRANCH_PREFIXES: &[&str] = &["feature/", "fix/", "chore/", "docs/"];

/// The three fixed synchronization groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncGroup {
    /// Orchestration root plus engine repository.
    Engine,

    /// Every domain, blog, and project.
    Output,

    /// The independent content repository.
    Content,
}

impl SyncGroup {
    /// All groups in processing order.
    pub const ALL: [SyncGroup; 3] = [SyncGroup::Engine, SyncGroup::Output, SyncGroup::Content];

    /// Group a repository kind belongs to. Exactly one per kind.
    pub fn of(kind: RepoKind) -> SyncGroup {
        match kind {
            RepoKind::Engine => SyncGroup::Engine,
            RepoKind::Domain | RepoKind::Blog | RepoKind::Project => SyncGroup::Output,
            RepoKind::Content => SyncGroup::Content,
        }
    }
}

impl Display for SyncGroup {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            SyncGroup::Engine => "engine",
            SyncGroup::Output => "output",
            SyncGroup::Content => "content",
        };
        fmt.write_str(name)
    }
}

/// Sync classification of an output-group repository's latest commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    /// Latest commit carries a parseable sync reference.
    Synced(SyncReference),

    /// Latest commit has no sync reference at all.
    ManualCommit,

    /// A sync reference is present but mangled.
    SyncError,

    /// No commits, or not a git repository yet.
    Uninitialized,
}

/// Status report for one repository.
#[derive(Debug, Clone)]
pub struct RepoStatus {
    pub identifier: String,
    pub kind: RepoKind,
    pub branch: Option<String>,
    pub short_hash: Option<String>,
    pub counts: ChangeCounts,
    /// Present only for output-group repositories.
    pub sync: Option<SyncState>,
}

/// Health comparison of one output repository against current engine state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncHealth {
    /// Latest sync reference matches the engine's current hashes.
    InSync,

    /// Sync reference parses but points at older engine hashes.
    Behind,

    /// Latest commit was made outside the orchestrator.
    Manual,

    /// Sync reference is mangled.
    Broken,

    /// Repository has no history to judge.
    Uninitialized,
}

/// One line of a `sync-health` report.
#[derive(Debug, Clone)]
pub struct HealthLine {
    pub identifier: String,
    pub health: SyncHealth,
}

/// What happened to one repository in a batch.
#[derive(Debug)]
pub enum Outcome {
    /// Operation ran; the string is a short human summary.
    Done(String),

    /// Nothing to do for this repository.
    Skipped(String),
}

/// Per-repository outcome line of a batch operation.
#[derive(Debug)]
pub struct RepoOutcome {
    pub identifier: String,
    pub result: Result<Outcome, SyncError>,
}

/// Aggregate result of one multi-repository operation.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub outcomes: Vec<RepoOutcome>,
}

impl BatchReport {
    fn record(&mut self, identifier: &str, result: Result<Outcome, SyncError>) {
        if let Err(error) = &result {
            warn!("{identifier}: {error}");
        }

        self.outcomes.push(RepoOutcome {
            identifier: identifier.to_owned(),
            result,
        });
    }

    /// How many repositories completed the operation.
    pub fn completed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.result, Ok(Outcome::Done(_))))
            .count()
    }

    /// How many repositories failed.
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result.is_err())
            .count()
    }

    /// Whether nothing at all had to be done.
    pub fn is_noop(&self) -> bool {
        self.outcomes
            .iter()
            .all(|outcome| matches!(outcome.result, Ok(Outcome::Skipped(_))))
    }

    /// First merge conflict in the batch, if any. Drives the exit code.
    pub fn has_conflict(&self) -> bool {
        self.outcomes.iter().any(|outcome| {
            matches!(
                outcome.result,
                Err(SyncError::Repo(RepoError::MergeConflict { .. }))
            )
        })
    }
}

/// Actions of the `site-branch` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SiteBranchAction {
    /// Report whether each project has a `site` branch.
    Status,

    /// Create missing `site` branches.
    Create,

    /// Switch each project onto its `site` branch.
    Switch,
}

/// The multi-repository orchestrator.
///
/// Generic over [`GitAccess`] so orchestration logic can be exercised
/// without a real git binding.
pub struct Orchestrator<G = Git2Repo>
where
    G: GitAccess,
{
    repos: BTreeMap<String, RepoRef>,
    _access: PhantomData<G>,
}

impl<G> Orchestrator<G>
where
    G: GitAccess,
{
    /// Construct an orchestrator over one discovery pass.
    pub fn new(repos: BTreeMap<String, RepoRef>) -> Self {
        Self {
            repos,
            _access: PhantomData,
        }
    }

    /// Construct an orchestrator over a discovery pass plus the ecosystem
    /// root itself.
    ///
    /// The orchestration root is part of the engine group and leads its
    /// processing order, but discovery never reports it: it is not a
    /// pattern-matched entry, it is the directory discovery ran over. It
    /// gets attached here instead.
    pub fn with_ecosystem(ctx: &Context, mut repos: BTreeMap<String, RepoRef>) -> Self {
        let resolved = ctx
            .root()
            .canonicalize()
            .unwrap_or_else(|_| ctx.root().to_path_buf());
        repos.insert(
            ROOT_ID.to_owned(),
            RepoRef {
                identifier: ROOT_ID.to_owned(),
                kind: RepoKind::Engine,
                resolved_path: resolved,
            },
        );

        Self::new(repos)
    }

    /// Discovered repositories, keyed by identifier.
    pub fn repos(&self) -> &BTreeMap<String, RepoRef> {
        &self.repos
    }

    /// Members of one group, in deterministic processing order.
    ///
    /// The orchestration root leads the engine group; everything else is
    /// identifier order.
    fn members(&self, group: SyncGroup) -> Vec<&RepoRef> {
        let mut members: Vec<&RepoRef> = self
            .repos
            .values()
            .filter(|repo| SyncGroup::of(repo.kind) == group)
            .collect();
        members.sort_by_key(|repo| (repo.identifier != ROOT_ID, repo.identifier.clone()));

        members
    }

    fn open(&self, repo: &RepoRef) -> Result<G, RepoError> {
        G::open(&repo.resolved_path)
    }

    /// Per-repository status for the requested groups.
    #[instrument(skip(self), level = "debug")]
    pub fn status(&self, groups: &[SyncGroup]) -> Vec<RepoStatus> {
        let mut report = Vec::new();
        for group in SyncGroup::ALL.iter().filter(|group| groups.contains(group)) {
            for repo in self.members(*group) {
                report.push(self.status_of(repo, *group));
            }
        }

        report
    }

    fn status_of(&self, repo: &RepoRef, group: SyncGroup) -> RepoStatus {
        let uninitialized = |sync: bool| RepoStatus {
            identifier: repo.identifier.clone(),
            kind: repo.kind,
            branch: None,
            short_hash: None,
            counts: ChangeCounts::default(),
            sync: sync.then_some(SyncState::Uninitialized),
        };
        let wants_sync = group == SyncGroup::Output;

        let Ok(access) = self.open(repo) else {
            return uninitialized(wants_sync);
        };

        let branch = access.current_branch().ok().flatten();
        let short_hash = access.short_hash().ok().flatten();
        let counts = access.change_counts().unwrap_or_default();

        let sync = wants_sync.then(|| match access.head_message() {
            Ok(Some(message)) => match SyncReference::parse(&message) {
                Ok(Some(reference)) => SyncState::Synced(reference),
                Ok(None) => SyncState::ManualCommit,
                Err(_) => SyncState::SyncError,
            },
            _ => SyncState::Uninitialized,
        });

        RepoStatus {
            identifier: repo.identifier.clone(),
            kind: repo.kind,
            branch,
            short_hash,
            counts,
            sync,
        }
    }

    /// Compare each output repository's recorded sync reference against the
    /// engine group's current state.
    pub fn sync_health(&self) -> Vec<HealthLine> {
        let engine = self.engine_reference();

        self.members(SyncGroup::Output)
            .into_iter()
            .map(|repo| {
                let health = match self.status_of(repo, SyncGroup::Output).sync {
                    Some(SyncState::Synced(recorded)) => match &engine {
                        Some(current) if *current == recorded => SyncHealth::InSync,
                        Some(_) => SyncHealth::Behind,
                        None => SyncHealth::Behind,
                    },
                    Some(SyncState::ManualCommit) => SyncHealth::Manual,
                    Some(SyncState::SyncError) => SyncHealth::Broken,
                    _ => SyncHealth::Uninitialized,
                };

                HealthLine {
                    identifier: repo.identifier.clone(),
                    health,
                }
            })
            .collect()
    }

    /// Snapshot of the engine group's current hashes and branch.
    ///
    /// `None` when no engine repository has any history yet, in which case
    /// output commits go out unannotated and show up as manual.
    fn engine_reference(&self) -> Option<SyncReference> {
        let mut branch = None;
        let mut hashes = BTreeMap::new();

        for repo in self.members(SyncGroup::Engine) {
            let Ok(access) = self.open(repo) else {
                continue;
            };

            if let Ok(Some(hash)) = access.short_hash() {
                hashes.insert(repo.identifier.clone(), hash);
            }

            if repo.identifier == ROOT_ID {
                branch = access.current_branch().ok().flatten();
            }
        }

        if hashes.is_empty() {
            return None;
        }

        Some(SyncReference {
            branch: branch.unwrap_or_else(|| "main".to_owned()),
            hashes,
        })
    }

    /// Grouped commit: Engine, then Output, then Content.
    ///
    /// Output commits are annotated with a sync reference built from the
    /// engine group's just-committed state. Repositories without changes are
    /// skipped, so a group with nothing to do produces no empty commits.
    #[instrument(skip(self, message), level = "debug")]
    pub fn commit(&self, message: &str, amend: bool, groups: &[SyncGroup]) -> BatchReport {
        let mut report = BatchReport::default();

        for group in SyncGroup::ALL.iter().filter(|group| groups.contains(group)) {
            // Built after the engine group commits so output trailers point
            // at the state that actually landed.
            let annotated = match group {
                SyncGroup::Output => self
                    .engine_reference()
                    .map(|reference| reference.annotate(message)),
                _ => None,
            };
            let group_message = annotated.as_deref().unwrap_or(message);

            for repo in self.members(*group) {
                let result = self.commit_one(repo, group_message, amend, *group);
                report.record(&repo.identifier, result);
            }
        }

        report
    }

    fn commit_one(
        &self,
        repo: &RepoRef,
        message: &str,
        amend: bool,
        group: SyncGroup,
    ) -> Result<Outcome, SyncError> {
        let access = self.open(repo)?;
        let counts = access.change_counts()?;
        if counts.is_clean() && !amend {
            return Ok(Outcome::Skipped("clean".into()));
        }

        // Output repositories are pinned to their required branch; switch
        // before staging so the commit lands where it must.
        if group == SyncGroup::Output {
            let required = repo.required_branch();
            let current = access.current_branch()?;
            if current.as_deref() != Some(required) {
                if !access.branch_exists(required)? {
                    access.create_branch(required)?;
                }

                info!("{}: switching to required branch {required}", repo.identifier);
                access.checkout(required)?;
            }
        }

        ensure_ignored(&repo.resolved_path)?;
        access.stage_changes()?;
        // Gate on what the index holds against head, not on how much this
        // pass staged: work the user staged by hand must still be committed.
        if access.change_counts()?.staged == 0 && !amend {
            return Ok(Outcome::Skipped("nothing to stage".into()));
        }

        let hash = access.commit(message, amend)?;
        Ok(Outcome::Done(format!("committed {hash}")))
    }

    /// Grouped push against each repository's required branch.
    ///
    /// A caller-supplied branch only applies to engine and content
    /// repositories; output repositories never push it unless it matches
    /// their required branch. Force-pushing a protected branch is refused
    /// before any repository is touched.
    pub fn push(
        &self,
        branch: Option<&str>,
        force: bool,
        set_upstream: bool,
        groups: &[SyncGroup],
    ) -> Result<BatchReport, SyncError> {
        let plan = self.branch_plan(branch, groups);

        if force {
            for (repo, target) in &plan {
                if PROTECTED_BRANCHES.contains(&target.as_str()) {
                    debug!("refusing force-push of {target} in {}", repo.identifier);
                    return Err(SyncError::ProtectedBranch {
                        branch: target.clone(),
                    });
                }
            }
        }

        let mut report = BatchReport::default();
        for (repo, target) in plan {
            let result = self
                .open(repo)
                .and_then(|access| access.push(&target, force, set_upstream))
                .map(|_| Outcome::Done(format!("pushed {target}")))
                .map_err(SyncError::from);
            report.record(&repo.identifier, result);
        }

        Ok(report)
    }

    /// Grouped pull against each repository's required branch.
    pub fn pull(&self, branch: Option<&str>, rebase: bool, groups: &[SyncGroup]) -> BatchReport {
        let mut report = BatchReport::default();
        for (repo, target) in self.branch_plan(branch, groups) {
            let result = self
                .open(repo)
                .and_then(|access| access.pull(&target, rebase))
                .map(|_| Outcome::Done(format!("pulled {target}")))
                .map_err(SyncError::from);
            report.record(&repo.identifier, result);
        }

        report
    }

    /// Which branch each repository in the requested groups syncs against.
    fn branch_plan<'a>(
        &'a self,
        branch: Option<&str>,
        groups: &[SyncGroup],
    ) -> Vec<(&'a RepoRef, String)> {
        let mut plan = Vec::new();
        for group in SyncGroup::ALL.iter().filter(|group| groups.contains(group)) {
            for repo in self.members(*group) {
                let target = match group {
                    // Output repositories are pinned to their required
                    // branch no matter what the caller asked for.
                    SyncGroup::Output => repo.required_branch().to_owned(),
                    _ => branch
                        .map(str::to_owned)
                        .unwrap_or_else(|| repo.required_branch().to_owned()),
                };
                plan.push((repo, target));
            }
        }

        plan
    }

    /// Branch-scoped read that always restores the original branch.
    pub fn atomic_read(
        &self,
        identifier: &str,
        branch: &str,
        path: &Path,
    ) -> Result<Option<Vec<u8>>, SyncError> {
        let repo = self.repos.get(identifier).ok_or_else(|| {
            SyncError::UnknownRepository {
                identifier: identifier.to_owned(),
            }
        })?;

        Ok(self.open(repo)?.read_on_branch(branch, path)?)
    }

    /// Switch (or create) a branch across the engine group only.
    ///
    /// Output repositories are deliberately pinned to their required
    /// branches and never subject to ad-hoc switching. The name is validated
    /// before any repository is touched.
    pub fn branch(&self, name: &str, create: bool) -> Result<BatchReport, SyncError> {
        validate_branch_name(name)?;

        let mut report = BatchReport::default();
        for repo in self.members(SyncGroup::Engine) {
            let result = self.branch_one(repo, name, create);
            report.record(&repo.identifier, result);
        }

        Ok(report)
    }

    fn branch_one(&self, repo: &RepoRef, name: &str, create: bool) -> Result<Outcome, SyncError> {
        let access = self.open(repo)?;

        if !access.branch_exists(name)? {
            if !create {
                return Err(SyncError::Repo(RepoError::GitCommand {
                    message: format!("branch {name} does not exist (use --create)"),
                }));
            }

            access.create_branch(name)?;
        }

        access.checkout(name)?;
        Ok(Outcome::Done(format!("on {name}")))
    }

    /// Delete a branch across the engine group.
    pub fn delete_branch(&self, name: &str) -> Result<BatchReport, SyncError> {
        validate_branch_name(name)?;
        if PROTECTED_BRANCHES.contains(&name) {
            return Err(SyncError::ProtectedBranch {
                branch: name.to_owned(),
            });
        }

        let mut report = BatchReport::default();
        for repo in self.members(SyncGroup::Engine) {
            let result = self
                .open(repo)
                .and_then(|access| access.delete_branch(name))
                .map(|()| Outcome::Done(format!("deleted {name}")))
                .map_err(SyncError::from);
            report.record(&repo.identifier, result);
        }

        Ok(report)
    }

    /// Local branches of every engine-group repository.
    pub fn list_branches(&self) -> Result<Vec<(String, Vec<String>)>, SyncError> {
        let mut listing = Vec::new();
        for repo in self.members(SyncGroup::Engine) {
            let branches = self.open(repo)?.list_branches()?;
            listing.push((repo.identifier.clone(), branches));
        }

        Ok(listing)
    }

    /// Merge each engine repository's current branch into `main`.
    pub fn merge_to_main(&self, fasttrack: bool) -> BatchReport {
        let mut report = BatchReport::default();
        for repo in self.members(SyncGroup::Engine) {
            let result = self.merge_one(repo, fasttrack);
            report.record(&repo.identifier, result);
        }

        report
    }

    fn merge_one(&self, repo: &RepoRef, fasttrack: bool) -> Result<Outcome, SyncError> {
        let access = self.open(repo)?;
        let Some(current) = access.current_branch()? else {
            return Err(SyncError::Repo(RepoError::Detached {
                path: repo.resolved_path.clone(),
            }));
        };

        if current == "main" {
            return Ok(Outcome::Skipped("already on main".into()));
        }

        access.checkout("main")?;
        access.merge(&current, fasttrack)?;
        Ok(Outcome::Done(format!("merged {current} into main")))
    }

    /// Rebase each engine repository's current branch onto a target.
    pub fn rebase(&self, target: &str) -> BatchReport {
        let mut report = BatchReport::default();
        for repo in self.members(SyncGroup::Engine) {
            let result = self
                .open(repo)
                .and_then(|access| access.rebase_onto(target))
                .map(|_| Outcome::Done(format!("rebased onto {target}")))
                .map_err(SyncError::from);
            report.record(&repo.identifier, result);
        }

        report
    }

    /// Manage the `site` branch across project repositories.
    pub fn site_branch(&self, action: SiteBranchAction) -> BatchReport {
        let mut report = BatchReport::default();
        for repo in self.members(SyncGroup::Output) {
            if repo.kind != RepoKind::Project {
                continue;
            }

            let result = self.site_branch_one(repo, action);
            report.record(&repo.identifier, result);
        }

        report
    }

    fn site_branch_one(
        &self,
        repo: &RepoRef,
        action: SiteBranchAction,
    ) -> Result<Outcome, SyncError> {
        let access = self.open(repo)?;
        let exists = access.branch_exists("site")?;

        match action {
            SiteBranchAction::Status => {
                let current = access.current_branch()?;
                let state = if current.as_deref() == Some("site") {
                    "on site"
                } else if exists {
                    "site exists"
                } else {
                    "no site branch"
                };
                Ok(Outcome::Done(state.into()))
            }
            SiteBranchAction::Create => {
                if exists {
                    return Ok(Outcome::Skipped("site exists".into()));
                }

                access.create_branch("site")?;
                Ok(Outcome::Done("created site".into()))
            }
            SiteBranchAction::Switch => {
                if access.current_branch()?.as_deref() == Some("site") {
                    return Ok(Outcome::Skipped("already on site".into()));
                }

                if !exists {
                    access.create_branch("site")?;
                }

                access.checkout("site")?;
                Ok(Outcome::Done("on site".into()))
            }
        }
    }

    /// Initialize a fresh repository under the ecosystem root.
    ///
    /// The name must classify as a valid ecosystem identifier. The new
    /// repository starts on `main` with upkept ignore rules as its first
    /// commit.
    pub fn init_repo(&self, root: &Path, name: &str) -> Result<RepoRef, SyncError> {
        let kind = classify(name).ok_or_else(|| SyncError::UnknownRepository {
            identifier: name.to_owned(),
        })?;

        let path = root.join(name);
        let access = G::init(&path)?;
        ensure_ignored(&path)?;
        access.stage_changes()?;
        let hash = access.commit(&format!("chore: initialize {name}"), false)?;
        info!("initialized {name} at {} ({hash})", path.display());

        Ok(RepoRef {
            identifier: name.to_owned(),
            kind,
            resolved_path: path,
        })
    }

    /// Reset working trees across the engine group.
    pub fn reset(&self, hard: bool) -> BatchReport {
        let mut report = BatchReport::default();
        for repo in self.members(SyncGroup::Engine) {
            let result = self
                .open(repo)
                .and_then(|access| access.reset(hard))
                .map(|_| Outcome::Done(if hard { "reset --hard" } else { "reset" }.into()))
                .map_err(SyncError::from);
            report.record(&repo.identifier, result);
        }

        report
    }
}

/// Validate a branch name against the fixed allowed set.
///
/// Rejection happens before any repository is mutated.
///
/// # Errors
///
/// - Return [`SyncError::InvalidBranch`] for names outside the allowed
///   names and prefixes.
pub fn validate_branch_name(name: &str) -> Result<(), SyncError> {
    let allowed = ALLOWED_BRANCH_NAMES.contains(&name)
        || ALLOWED_BRANCH_PREFIXES
            .iter()
            .any(|prefix| name.len() > prefix.len() && name.starts_with(prefix));

    if allowed {
        Ok(())
    } else {
        Err(SyncError::InvalidBranch {
            name: name.to_owned(),
        })
    }
}

/// Orchestration error types.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Branch name outside the allowed set.
    #[error("invalid branch name {name:?}")]
    InvalidBranch { name: String },

    /// Force-push targeted a protected branch.
    #[error("refusing to force-push protected branch {branch:?}")]
    ProtectedBranch { branch: String },

    /// Identifier does not exist in this discovery pass.
    #[error("unknown repository {identifier:?}")]
    UnknownRepository { identifier: String },

    /// Git driver failure.
    #[error(transparent)]
    Repo(#[from] RepoError),

    /// Ignore-file upkeep failure.
    #[error(transparent)]
    Ignore(#[from] ignorefile::IgnoreFileError),
}

/// Friendly result alias.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::path::PathBuf;

    #[test_case(RepoKind::Engine, SyncGroup::Engine; "engine kind")]
    #[test_case(RepoKind::Domain, SyncGroup::Output; "domain kind")]
    #[test_case(RepoKind::Blog, SyncGroup::Output; "blog kind")]
    #[test_case(RepoKind::Project, SyncGroup::Output; "project kind")]
    #[test_case(RepoKind::Content, SyncGroup::Content; "content kind")]
    #[test]
    fn every_kind_belongs_to_exactly_one_group(kind: RepoKind, expect: SyncGroup) {
        self::assert_eq!(SyncGroup::of(kind), expect);
    }

    #[test_case("main"; "main allowed")]
    #[test_case("develop"; "develop allowed")]
    #[test_case("site"; "site allowed")]
    #[test_case("feature/nav"; "feature prefix")]
    #[test_case("fix/links"; "fix prefix")]
    #[test]
    fn branch_names_in_allowed_set_pass(name: &str) {
        assert!(validate_branch_name(name).is_ok());
    }

    #[test_case("trunk"; "unknown name")]
    #[test_case("feature/"; "empty suffix")]
    #[test_case("wip/stuff"; "unknown prefix")]
    #[test_case(""; "empty name")]
    #[test]
    fn branch_names_outside_allowed_set_fail(name: &str) {
        assert!(matches!(
            validate_branch_name(name),
            Err(SyncError::InvalidBranch { .. })
        ));
    }

    fn repo_ref(identifier: &str, kind: RepoKind) -> RepoRef {
        RepoRef {
            identifier: identifier.to_owned(),
            kind,
            resolved_path: PathBuf::from("/nowhere").join(identifier),
        }
    }

    #[test]
    fn engine_members_lead_with_orchestration_root() {
        let repos: BTreeMap<String, RepoRef> = [
            ("engine", RepoKind::Engine),
            ("root", RepoKind::Engine),
            ("a.in", RepoKind::Domain),
        ]
        .into_iter()
        .map(|(id, kind)| (id.to_owned(), repo_ref(id, kind)))
        .collect();

        let orchestrator: Orchestrator = Orchestrator::new(repos);
        let members: Vec<&str> = orchestrator
            .members(SyncGroup::Engine)
            .into_iter()
            .map(|repo| repo.identifier.as_str())
            .collect();

        assert_eq!(members, vec!["root", "engine"]);
    }

    #[test]
    fn with_ecosystem_attaches_root_to_engine_group() {
        // Discovery hands back only pattern-matched entries; the root joins
        // the engine group at construction.
        let repos: BTreeMap<String, RepoRef> =
            [("engine", RepoKind::Engine), ("a.in", RepoKind::Domain)]
                .into_iter()
                .map(|(id, kind)| (id.to_owned(), repo_ref(id, kind)))
                .collect();

        let ctx = crate::context::Context::with_root("/nowhere/eco", crate::context::Mode::Local);
        let orchestrator: Orchestrator = Orchestrator::with_ecosystem(&ctx, repos);

        let root = &orchestrator.repos()[ROOT_ID];
        assert_eq!(root.kind, RepoKind::Engine);
        let members: Vec<&str> = orchestrator
            .members(SyncGroup::Engine)
            .into_iter()
            .map(|repo| repo.identifier.as_str())
            .collect();
        assert_eq!(members, vec!["root", "engine"]);
    }

    #[test]
    fn force_push_to_protected_branch_is_refused_before_mutation() {
        let repos: BTreeMap<String, RepoRef> = [("a.in", RepoKind::Domain)]
            .into_iter()
            .map(|(id, kind)| (id.to_owned(), repo_ref(id, kind)))
            .collect();

        let orchestrator: Orchestrator = Orchestrator::new(repos);
        // Domains push `main`; a forced push must be refused outright even
        // though the repository path does not even exist.
        let result = orchestrator.push(None, true, false, &SyncGroup::ALL);

        assert!(matches!(
            result,
            Err(SyncError::ProtectedBranch { .. })
        ));
    }

    #[test]
    fn atomic_read_unknown_repository_is_an_error() {
        let orchestrator: Orchestrator = Orchestrator::new(BTreeMap::new());
        let result = orchestrator.atomic_read("ghost.in", "site", Path::new("x"));

        assert!(matches!(
            result,
            Err(SyncError::UnknownRepository { .. })
        ));
    }
}
