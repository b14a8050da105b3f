// SPDX-License-Identifier: MIT

//! Sync reference trailers.
//!
//! Every commit made to an output-group repository carries a trailer line
//! recording the engine-group commit hashes and branch at the moment the
//! commit was produced. Git history is the only store: the trailer is
//! written into the commit message and parsed back out of it for status
//! reporting, establishing a traceable link from any site snapshot to the
//! orchestration code that built it.

use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter, Result as FmtResult},
};

/// Trailer key marking a sync reference line in a commit message.
pub const TRAILER: &str = "Engine-Sync:";

/// Engine state recorded inside an output-group commit message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReference {
    /// Engine branch at commit time.
    pub branch: String,

    /// Short commit hash per engine-group repository identifier.
    pub hashes: BTreeMap<String, String>,
}

impl SyncReference {
    /// Construct a reference from an engine branch and its repo hashes.
    pub fn new(
        branch: impl Into<String>,
        hashes: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        Self {
            branch: branch.into(),
            hashes: hashes
                .into_iter()
                .map(|(id, hash)| (id.into(), hash.into()))
                .collect(),
        }
    }

    /// Extract the sync reference from a full commit message.
    ///
    /// `Ok(None)` means no trailer is present, which is how a manual commit
    /// looks. A trailer that is present but does not parse is an error so
    /// status reporting can distinguish "manual" from "mangled".
    ///
    /// # Errors
    ///
    /// - Return [`ReferenceError::Malformed`] if the trailer line cannot be
    ///   parsed back into a reference.
    pub fn parse(message: &str) -> Result<Option<Self>> {
        let Some(line) = message
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with(TRAILER))
        else {
            return Ok(None);
        };

        let malformed = || ReferenceError::Malformed {
            line: line.to_owned(),
        };

        let mut branch = None;
        let mut hashes = BTreeMap::new();
        for pair in line[TRAILER.len()..].split_whitespace() {
            let (key, value) = pair.split_once('=').ok_or_else(malformed)?;
            if value.is_empty() {
                return Err(malformed());
            }

            if key == "branch" {
                branch = Some(value.to_owned());
            } else {
                hashes.insert(key.to_owned(), value.to_owned());
            }
        }

        let branch = branch.ok_or_else(malformed)?;
        if hashes.is_empty() {
            return Err(malformed());
        }

        Ok(Some(Self { branch, hashes }))
    }

    /// Append this reference as a trailer block to a commit message.
    pub fn annotate(&self, message: &str) -> String {
        format!("{}\n\n{self}", message.trim_end())
    }
}

impl Display for SyncReference {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        write!(fmt, "{TRAILER} branch={}", self.branch)?;
        for (identifier, hash) in &self.hashes {
            write!(fmt, " {identifier}={hash}")?;
        }

        Ok(())
    }
}

/// Sync reference error types.
#[derive(Debug, thiserror::Error)]
pub enum ReferenceError {
    /// Trailer line exists but cannot be parsed.
    #[error("malformed sync reference trailer: {line:?}")]
    Malformed { line: String },
}

/// Friendly result alias.
pub type Result<T, E = ReferenceError> = std::result::Result<T, E>;
