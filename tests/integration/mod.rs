// SPDX-License-Identifier: MIT

use crate::RepoFixture;

use anyhow::Result;
use pretty_assertions::assert_eq;
use sealed_test::prelude::*;
use siteherd::{
    context::{Context, Mode},
    discover::{discover, RepoKind, RepoRef},
    sync::{
        ignorefile::REQUIRED_RULES,
        reference::SyncReference,
        repo::{Git2Repo, GitAccess},
        Orchestrator, Outcome, SyncGroup, SyncState,
    },
};
use std::{collections::BTreeMap, fs, path::Path};
use tempfile::TempDir;

fn repo_ref(identifier: &str, kind: RepoKind, path: &Path) -> (String, RepoRef) {
    (
        identifier.to_owned(),
        RepoRef {
            identifier: identifier.to_owned(),
            kind,
            resolved_path: path.to_path_buf(),
        },
    )
}

#[test]
fn branch_scoped_read_restores_original_branch() -> Result<()> {
    let dir = TempDir::new()?;
    let fixture = RepoFixture::init(dir.path().join("causality.in"))?;
    fixture.commit_file("index.md", "home", "chore: add index")?;
    fixture.branch("site")?;
    fixture.checkout("site")?;
    fixture.commit_file("config.yml", "port: 1", "chore: add config")?;
    fixture.checkout("main")?;

    let access = Git2Repo::open(fixture.workdir())?;
    let bytes = access.read_on_branch("site", Path::new("config.yml"))?;

    assert_eq!(bytes, Some(b"port: 1".to_vec()));
    assert_eq!(fixture.current_branch()?, "main");
    // One checkout to the target branch and one back.
    assert_eq!(access.checkout_count(), 2);

    Ok(())
}

#[test]
fn branch_scoped_read_of_absent_file_still_restores() -> Result<()> {
    let dir = TempDir::new()?;
    let fixture = RepoFixture::init(dir.path().join("causality.in"))?;
    fixture.commit_file("index.md", "home", "chore: add index")?;
    fixture.branch("site")?;

    let access = Git2Repo::open(fixture.workdir())?;
    let bytes = access.read_on_branch("site", Path::new("missing.yml"))?;

    assert_eq!(bytes, None);
    assert_eq!(fixture.current_branch()?, "main");

    Ok(())
}

#[test]
fn branch_scoped_read_with_failing_checkout_leaves_branch_unchanged() -> Result<()> {
    let dir = TempDir::new()?;
    let fixture = RepoFixture::init(dir.path().join("causality.in"))?;
    fixture.commit_file("index.md", "home", "chore: add index")?;

    let access = Git2Repo::open(fixture.workdir())?;
    let result = access.read_on_branch("no-such-branch", Path::new("index.md"));

    assert!(result.is_err());
    assert_eq!(fixture.current_branch()?, "main");

    Ok(())
}

#[test]
fn same_branch_read_performs_zero_checkouts() -> Result<()> {
    let dir = TempDir::new()?;
    let fixture = RepoFixture::init(dir.path().join("causality.in"))?;
    fixture.commit_file("index.md", "home", "chore: add index")?;

    let access = Git2Repo::open(fixture.workdir())?;
    let bytes = access.read_on_branch("main", Path::new("index.md"))?;

    assert_eq!(bytes, Some(b"home".to_vec()));
    assert_eq!(access.checkout_count(), 0);

    Ok(())
}

#[cfg(unix)]
#[test]
fn symlinks_are_never_staged() -> Result<()> {
    let dir = TempDir::new()?;
    let fixture = RepoFixture::init(dir.path().join("causality.in"))?;
    fixture.commit_file("index.md", "home", "chore: add index")?;

    let target = dir.path().join("elsewhere");
    fs::create_dir(&target)?;
    std::os::unix::fs::symlink(&target, fixture.workdir().join("linked.in"))?;
    fs::write(fixture.workdir().join("notes.md"), "notes")?;

    let access = Git2Repo::open(fixture.workdir())?;
    let staged = access.stage_changes()?;
    access.commit("feat: add notes", false)?;

    assert_eq!(staged, 1);
    assert!(fixture.head_tree_has("notes.md")?);
    assert!(!fixture.head_tree_has("linked.in")?);

    Ok(())
}

#[test]
fn grouped_commit_annotates_output_with_engine_state() -> Result<()> {
    let dir = TempDir::new()?;
    let root = RepoFixture::init(dir.path().join("root"))?;
    let engine = RepoFixture::init(dir.path().join("engine"))?;
    let domain = RepoFixture::init(dir.path().join("causality.in"))?;

    root.commit_file("herd.yml", "v: 1", "chore: seed")?;
    engine.commit_file("build.sh", "true", "chore: seed")?;
    domain.commit_file("index.md", "home", "chore: seed")?;

    // Pending changes everywhere so every group actually commits.
    fs::write(root.workdir().join("herd.yml"), "v: 2")?;
    fs::write(engine.workdir().join("build.sh"), "false")?;
    fs::write(domain.workdir().join("index.md"), "updated")?;

    let repos: BTreeMap<String, RepoRef> = [
        repo_ref("root", RepoKind::Engine, root.workdir()),
        repo_ref("engine", RepoKind::Engine, engine.workdir()),
        repo_ref("causality.in", RepoKind::Domain, domain.workdir()),
    ]
    .into_iter()
    .collect();

    let orchestrator: Orchestrator = Orchestrator::new(repos);
    let report = orchestrator.commit("feat: refresh everything", false, &SyncGroup::ALL);
    assert_eq!(report.failed(), 0);
    assert_eq!(report.completed(), 3);

    // The trailer must record the engine state that just landed.
    let message = domain.head_message()?;
    let reference = SyncReference::parse(&message)?.expect("output commit carries a trailer");
    assert_eq!(reference.branch, "main");
    assert_eq!(
        reference.hashes.get("root").cloned(),
        Git2Repo::open(root.workdir())?.short_hash()?
    );
    assert_eq!(
        reference.hashes.get("engine").cloned(),
        Git2Repo::open(engine.workdir())?.short_hash()?
    );

    // And status must classify the domain as synced.
    let status = orchestrator.status(&[SyncGroup::Output]);
    assert_eq!(status.len(), 1);
    assert!(matches!(status[0].sync, Some(SyncState::Synced(_))));

    Ok(())
}

#[test]
fn commit_switches_projects_onto_site_branch() -> Result<()> {
    let dir = TempDir::new()?;
    let project = RepoFixture::init(dir.path().join("causality.in/PROJECTS/HENA"))?;
    project.commit_file("main.c", "int main(void) { return 0; }", "chore: seed")?;
    fs::write(project.workdir().join("main.c"), "int main(void) { return 1; }")?;

    let repos: BTreeMap<String, RepoRef> = [repo_ref(
        "causality.in/PROJECTS/HENA",
        RepoKind::Project,
        project.workdir(),
    )]
    .into_iter()
    .collect();

    let orchestrator: Orchestrator = Orchestrator::new(repos);
    let report = orchestrator.commit("feat: update", false, &[SyncGroup::Output]);

    assert_eq!(report.failed(), 0);
    assert_eq!(project.current_branch()?, "site");

    Ok(())
}

#[test]
fn hand_staged_changes_are_committed() -> Result<()> {
    let dir = TempDir::new()?;
    let domain = RepoFixture::init(dir.path().join("causality.in"))?;
    // Required ignore rules already present, so upkeep stages nothing new.
    domain.commit_file(
        ".gitignore",
        REQUIRED_RULES.join("\n") + "\n",
        "chore: seed",
    )?;
    domain.commit_file("index.md", "home", "chore: seed")?;

    // A modification staged by hand, with a clean working tree on top of
    // it, leaves selective staging nothing fresh to add.
    domain.stage_file("index.md", "updated")?;

    let repos: BTreeMap<String, RepoRef> = [repo_ref(
        "causality.in",
        RepoKind::Domain,
        domain.workdir(),
    )]
    .into_iter()
    .collect();

    let orchestrator: Orchestrator = Orchestrator::new(repos);
    let report = orchestrator.commit("feat: refresh index", false, &[SyncGroup::Output]);

    assert_eq!(report.failed(), 0);
    assert_eq!(report.completed(), 1);
    assert!(domain.head_message()?.starts_with("feat: refresh index"));
    assert!(Git2Repo::open(domain.workdir())?.change_counts()?.is_clean());

    Ok(())
}

#[test]
fn clean_repositories_produce_a_noop_batch() -> Result<()> {
    let dir = TempDir::new()?;
    let domain = RepoFixture::init(dir.path().join("causality.in"))?;
    domain.commit_file("index.md", "home", "chore: seed")?;

    let repos: BTreeMap<String, RepoRef> = [repo_ref(
        "causality.in",
        RepoKind::Domain,
        domain.workdir(),
    )]
    .into_iter()
    .collect();

    let orchestrator: Orchestrator = Orchestrator::new(repos);
    let report = orchestrator.commit("feat: nothing", false, &SyncGroup::ALL);

    assert!(report.is_noop());
    assert_eq!(report.completed(), 0);
    assert!(matches!(
        report.outcomes[0].result,
        Ok(Outcome::Skipped(_))
    ));

    Ok(())
}

#[sealed_test]
fn init_repo_starts_on_main_with_committed_ignore_rules() -> Result<()> {
    // The initial commit needs a signature. Point the global git config at
    // this test's scratch home so the test passes on unconfigured machines.
    let home = std::env::current_dir()?;
    fs::write(
        home.join(".gitconfig"),
        "[user]\n\tname = John Doe\n\temail = john@doe.com\n",
    )?;
    std::env::set_var("HOME", &home);

    let dir = TempDir::new()?;
    let orchestrator: Orchestrator = Orchestrator::new(BTreeMap::new());

    let repo = orchestrator.init_repo(dir.path(), "newsite.in")?;
    assert_eq!(repo.kind, RepoKind::Domain);

    let access = Git2Repo::open(&repo.resolved_path)?;
    assert_eq!(access.current_branch()?.as_deref(), Some("main"));
    assert!(access.change_counts()?.is_clean());

    let rules = fs::read_to_string(repo.resolved_path.join(".gitignore"))?;
    assert!(rules.contains("site_local/"));

    Ok(())
}

#[test]
fn discovery_feeds_status_end_to_end() -> Result<()> {
    let dir = TempDir::new()?;
    let root = RepoFixture::init(dir.path())?;
    let engine = RepoFixture::init(dir.path().join("engine"))?;
    let content = RepoFixture::init(dir.path().join("content"))?;
    let domain = RepoFixture::init(dir.path().join("causality.in"))?;

    // The orchestration root ignores its nested repositories, exactly like
    // a real ecosystem root does.
    root.commit_file(".gitignore", "engine/\ncontent/\n*.in/\n", "chore: seed")?;
    engine.commit_file("build.sh", "true", "chore: seed")?;
    content.commit_file("essay.md", "words", "chore: seed")?;
    domain.commit_file("index.md", "home", "chore: seed")?;

    let ctx = Context::with_root(dir.path(), Mode::Local);
    let repos = discover(&ctx);
    // Discovery reports pattern-matched entries only; the root is attached
    // by the orchestrator.
    assert_eq!(
        repos.keys().cloned().collect::<Vec<_>>(),
        vec!["causality.in", "content", "engine"]
    );

    let orchestrator: Orchestrator = Orchestrator::with_ecosystem(&ctx, repos);
    let status = orchestrator.status(&SyncGroup::ALL);

    assert_eq!(status.len(), 4);
    // Root leads the report; everything starts on main and clean.
    assert_eq!(status[0].identifier, "root");
    for line in &status {
        assert_eq!(line.branch.as_deref(), Some("main"));
        assert!(line.counts.is_clean());
    }

    Ok(())
}
