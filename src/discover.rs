// SPDX-License-Identifier: MIT

//! Repository discovery and classification.
//!
//! The ecosystem root is a directory of symlinks: domain entries (`*.in`),
//! blog entries (`blog.*.in`), a fixed `engine` directory, and a fixed
//! `content` directory. Each domain or blog may in turn carry a `PROJECTS/`
//! child whose entries are independently versioned project repositories,
//! again reachable through symlinks.
//!
//! # Classification Is Identifier Shape
//!
//! A repository's kind is a pure function of its identifier string, never of
//! where that identifier resolves on disk. Resolved paths live under an
//! external storage layout that does not preserve the `PROJECTS/` marker or
//! the domain suffix, so patterns must survive symlink indirection. This is
//! what makes classification unit-testable without a filesystem.
//!
//! # Partial Ecosystems Are Normal
//!
//! A dangling symlink or a missing expected directory is a per-entry warning,
//! never an abort. Some machines only sync a subset of the ecosystem, and
//! discovery must hand back whatever actually exists.

use crate::context::Context;

use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

/// Directory name of the engine repository inside the ecosystem root.
pub const ENGINE_DIR: &str = "engine";

/// Directory name of the content repository inside the ecosystem root.
pub const CONTENT_DIR: &str = "content";

/// Identifier of the orchestration root repository itself.
pub const ROOT_ID: &str = "root";

/// Child directory holding project symlinks inside a domain or blog.
pub const PROJECTS_DIR: &str = "PROJECTS";

const DOMAIN_SUFFIX: &str = ".in";
const BLOG_PREFIX: &str = "blog.";
const PROJECT_MARKER: &str = "/PROJECTS/";

/// The five repository kinds, derived purely from identifier shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    /// Orchestration root or the engine repository.
    Engine,

    /// A top-level domain (`causality.in`).
    Domain,

    /// A blog subdomain (`blog.causality.in`).
    Blog,

    /// An independently versioned project (`causality.in/PROJECTS/HENA`).
    Project,

    /// The shared content repository.
    Content,
}

/// One managed repository, constructed fresh on every discovery pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoRef {
    /// Stable logical name, unique within a discovery run.
    pub identifier: String,

    /// Kind derived from the identifier's shape.
    pub kind: RepoKind,

    /// Absolute path after following every symlink level.
    pub resolved_path: PathBuf,
}

impl RepoRef {
    /// Branch this repository must be on for web-content operations.
    ///
    /// Projects keep development history on arbitrary branches and publish
    /// web content from `site`. Every other kind lives on `main`.
    pub fn required_branch(&self) -> &'static str {
        match self.kind {
            RepoKind::Project => "site",
            _ => "main",
        }
    }
}

/// Classify an identifier by its string shape.
///
/// Returns `None` for names that are not part of the ecosystem. Order
/// matters: the project marker and the blog prefix are both checked before
/// the bare domain suffix.
pub fn classify(identifier: &str) -> Option<RepoKind> {
    if identifier == ROOT_ID || identifier == ENGINE_DIR {
        return Some(RepoKind::Engine);
    }

    if identifier == CONTENT_DIR {
        return Some(RepoKind::Content);
    }

    if identifier.contains(PROJECT_MARKER) {
        return Some(RepoKind::Project);
    }

    if is_blog_identifier(identifier) {
        return Some(RepoKind::Blog);
    }

    if is_domain_identifier(identifier) {
        return Some(RepoKind::Domain);
    }

    None
}

/// Whether a name is shaped like a domain entry (`*.in`, not `blog.*`).
pub fn is_domain_identifier(name: &str) -> bool {
    name.ends_with(DOMAIN_SUFFIX)
        && !name.starts_with(BLOG_PREFIX)
        && name.len() > DOMAIN_SUFFIX.len()
}

/// Whether a name is shaped like a blog entry (`blog.*.in`).
pub fn is_blog_identifier(name: &str) -> bool {
    name.starts_with(BLOG_PREFIX)
        && name.ends_with(DOMAIN_SUFFIX)
        && name.len() > BLOG_PREFIX.len() + DOMAIN_SUFFIX.len()
}

/// Discover every repository reachable from the ecosystem root.
///
/// Scans the root for domain and blog shaped entries, resolves each through
/// all symlink levels to the real directory containing files, recurses into
/// each discovered domain or blog for a `PROJECTS/` child, and resolves the
/// `engine` and `content` singletons. The orchestration root itself is not
/// a discovery result; the orchestrator attaches it to the engine group.
///
/// Never aborts: unresolvable entries are skipped with a warning and the
/// rest of the pass continues. An unreadable root yields an empty map, which
/// is how a missing configuration surfaces.
#[instrument(skip(ctx), level = "debug")]
pub fn discover(ctx: &Context) -> BTreeMap<String, RepoRef> {
    let root = ctx.root();
    let mut repos = BTreeMap::new();

    record(&mut repos, ENGINE_DIR, &root.join(ENGINE_DIR));
    record(&mut repos, CONTENT_DIR, &root.join(CONTENT_DIR));

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(error) => {
            warn!("cannot read ecosystem root {}: {error}", root.display());
            return repos;
        }
    };

    for entry in entries.filter_map(|entry| entry.ok()) {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };

        match classify(&name) {
            Some(RepoKind::Domain) | Some(RepoKind::Blog) => {
                let Some(resolved) = record(&mut repos, &name, &entry.path()) else {
                    continue;
                };
                discover_projects(&mut repos, &name, &resolved);
            }
            // Singletons were already resolved directly above.
            _ => continue,
        }
    }

    debug!("discovered {} repositories", repos.len());
    repos
}

/// Enumerate `PROJECTS/` children of one resolved domain or blog.
fn discover_projects(repos: &mut BTreeMap<String, RepoRef>, owner: &str, resolved: &Path) {
    let projects = resolved.join(PROJECTS_DIR);
    if !projects.exists() {
        return;
    }

    let entries = match fs::read_dir(&projects) {
        Ok(entries) => entries,
        Err(error) => {
            warn!("cannot read {}: {error}", projects.display());
            return;
        }
    };

    for entry in entries.filter_map(|entry| entry.ok()) {
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };

        let identifier = format!("{owner}{PROJECT_MARKER}{name}");
        record(repos, &identifier, &entry.path());
    }
}

/// Resolve one entry through every symlink level and record it.
///
/// The contract is "return the real directory actually containing files",
/// not "return a valid path", so resolution never stops at the first link.
/// Returns the resolved path on success so callers can recurse into it.
fn record(repos: &mut BTreeMap<String, RepoRef>, identifier: &str, path: &Path) -> Option<PathBuf> {
    let resolved = match fs::canonicalize(path) {
        Ok(resolved) => resolved,
        Err(error) => {
            warn!("skipping {identifier}: {} ({error})", path.display());
            return None;
        }
    };

    if !resolved.is_dir() {
        warn!("skipping {identifier}: {} is not a directory", resolved.display());
        return None;
    }

    let kind = classify(identifier)?;
    repos.insert(
        identifier.to_owned(),
        RepoRef {
            identifier: identifier.to_owned(),
            kind,
            resolved_path: resolved.clone(),
        },
    );

    Some(resolved)
}
