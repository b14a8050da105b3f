// SPDX-License-Identifier: MIT

mod integration;

use anyhow::Result;
use git2::{build::CheckoutBuilder, Repository, RepositoryInitOptions};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub(crate) struct RepoFixture {
    repo: Repository,
    workdir: PathBuf,
}

impl RepoFixture {
    pub(crate) fn init(path: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(path.as_ref())?;
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path.as_ref(), &opts)?;

        // INVARIANT: Always provide valid name and email.
        //   - Git will complain if this is not set in CI/CD environments.
        let mut config = repo.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        let workdir = repo
            .workdir()
            .expect("fixture repositories are never bare")
            .to_path_buf();

        Ok(Self { repo, workdir })
    }

    pub(crate) fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Write a file into the working tree and commit it to HEAD.
    pub(crate) fn commit_file(
        &self,
        filename: impl AsRef<Path>,
        contents: impl AsRef<str>,
        message: &str,
    ) -> Result<()> {
        let full = self.workdir.join(filename.as_ref());
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, contents.as_ref())?;

        let mut index = self.repo.index()?;
        index.add_path(filename.as_ref())?;
        index.write()?;
        let tree = self.repo.find_tree(index.write_tree()?)?;

        // INVARIANT: Always determine latest parent commits to append to.
        let signature = self.repo.signature()?;
        let mut parents = Vec::new();
        if let Ok(head) = self.repo.head() {
            parents.push(head.peel_to_commit()?);
        }
        let parents = parents.iter().collect::<Vec<_>>();

        self.repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;

        Ok(())
    }

    /// Write a file and stage it without committing.
    pub(crate) fn stage_file(
        &self,
        filename: impl AsRef<Path>,
        contents: impl AsRef<str>,
    ) -> Result<()> {
        fs::write(self.workdir.join(filename.as_ref()), contents.as_ref())?;

        let mut index = self.repo.index()?;
        index.add_path(filename.as_ref())?;
        index.write()?;

        Ok(())
    }

    pub(crate) fn branch(&self, name: &str) -> Result<()> {
        let head = self.repo.head()?.peel_to_commit()?;
        self.repo.branch(name, &head, false)?;

        Ok(())
    }

    pub(crate) fn checkout(&self, name: &str) -> Result<()> {
        self.repo.set_head(&format!("refs/heads/{name}"))?;
        let mut builder = CheckoutBuilder::new();
        builder.force();
        self.repo.checkout_head(Some(&mut builder))?;

        Ok(())
    }

    pub(crate) fn current_branch(&self) -> Result<String> {
        let head = self.repo.head()?;
        Ok(head
            .shorthand()
            .expect("fixture branches always have utf8 names")
            .to_owned())
    }

    pub(crate) fn head_message(&self) -> Result<String> {
        let commit = self.repo.head()?.peel_to_commit()?;
        Ok(commit
            .message()
            .expect("fixture commit messages are always utf8")
            .to_owned())
    }

    pub(crate) fn head_tree_has(&self, name: &str) -> Result<bool> {
        let tree = self.repo.head()?.peel_to_tree()?;
        let found = tree.get_name(name).is_some();
        Ok(found)
    }
}
