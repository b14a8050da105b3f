// SPDX-License-Identifier: MIT

//! `.gitignore` upkeep for managed repositories.
//!
//! Local-mode builds drop their output into `site_local/`, which must never
//! be committed, and every platform sprinkles its own editor and OS
//! artifacts around. Rather than trusting each repository's `.gitignore` to
//! stay correct by hand, the orchestrator tops it up with the rules the
//! ecosystem requires before staging anything.
//!
//! Upkeep is idempotent and conservative: existing rules are preserved
//! verbatim, a candidate rule is only appended when no existing rule already
//! covers a path it would ignore, and nothing is written when there is
//! nothing to add.

use ignore::gitignore::GitignoreBuilder;
use std::{
    fs::{read_to_string, write},
    path::{Path, PathBuf},
};
use tracing::debug;

/// Rules every managed repository must carry.
///
/// `site_local/` is the local-mode output directory. The rest are the usual
/// OS and editor droppings.
pub const REQUIRED_RULES: &[&str] = &["site_local/", ".DS_Store", "Thumbs.db", "*.swp", ".siteherd/"];

/// Probe paths used to decide whether an existing rule set already covers a
/// required rule. Index-aligned with [`REQUIRED_RULES`].
const PROBE_PATHS: &[&str] = &[
    "site_local/index.html",
    ".DS_Store",
    "Thumbs.db",
    "draft.swp",
    ".siteherd/ports.json",
];

/// In-memory edit over one repository's `.gitignore`.
///
/// Appends only. Lines are kept in file order, duplicates are never added,
/// and the `changed` flag gates the write-back so untouched files keep their
/// timestamps.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IgnoreEdit {
    lines: Vec<String>,
    changed: bool,
}

impl IgnoreEdit {
    /// Parse an existing `.gitignore` body.
    pub fn parse(content: &str) -> Self {
        Self {
            lines: content.lines().map(str::to_owned).collect(),
            changed: false,
        }
    }

    /// Append a rule unless an identical line is already present.
    pub fn append_rule(&mut self, rule: impl Into<String>) {
        let rule = rule.into();
        if self.lines.iter().any(|line| line.trim() == rule) {
            return;
        }

        self.lines.push(rule);
        self.changed = true;
    }

    /// Whether any rule was appended since parsing.
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Render the file body, terminated with a newline when non-empty.
    pub fn render(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }

        let mut out = self.lines.join("\n");
        out.push('\n');
        out
    }
}

/// Ensure a repository's `.gitignore` carries the required rules.
///
/// Returns how many rules were appended.
///
/// # Errors
///
/// - Return [`IgnoreFileError::Read`] if an existing `.gitignore` cannot be
///   read.
/// - Return [`IgnoreFileError::Write`] if the updated file cannot be
///   written.
pub fn ensure_ignored(repo_path: &Path) -> Result<usize> {
    let ignore_path = repo_path.join(".gitignore");
    let content = if ignore_path.exists() {
        read_to_string(&ignore_path).map_err(|err| IgnoreFileError::Read {
            source: err,
            path: ignore_path.clone(),
        })?
    } else {
        String::new()
    };

    let mut edit = IgnoreEdit::parse(&content);
    let mut appended = 0;
    for (rule, probe) in REQUIRED_RULES.iter().zip(PROBE_PATHS) {
        if covered(repo_path, &content, probe) {
            debug!("{rule} already covered by existing rules");
            continue;
        }

        edit.append_rule(*rule);
        appended += 1;
    }

    if edit.changed() {
        write(&ignore_path, edit.render()).map_err(|err| IgnoreFileError::Write {
            source: err,
            path: ignore_path,
        })?;
    }

    Ok(appended)
}

/// Whether the existing rule set already ignores a probe path.
fn covered(repo_path: &Path, content: &str, probe: &str) -> bool {
    let mut builder = GitignoreBuilder::new(repo_path);
    for line in content.lines() {
        let _ = builder.add_line(None, line);
    }

    let Ok(matcher) = builder.build() else {
        return false;
    };

    matcher
        .matched_path_or_any_parents(repo_path.join(probe), false)
        .is_ignore()
}

/// Ignore file upkeep error types.
#[derive(Debug, thiserror::Error)]
pub enum IgnoreFileError {
    /// Existing `.gitignore` cannot be read.
    #[error("failed to read ignore file at {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Updated `.gitignore` cannot be written.
    #[error("failed to write ignore file at {:?}", path.display())]
    Write {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias.
pub type Result<T, E = IgnoreFileError> = std::result::Result<T, E>;
