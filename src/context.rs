// SPDX-License-Identifier: MIT

//! Ecosystem root, mode, and path convention resolution.
//!
//! Everything downstream of this module operates relative to two facts that
//! are established exactly once at startup: where the ecosystem root lives on
//! disk, and whether we are running in local development or production mode.
//! Both are captured in an immutable [`Context`] that gets passed explicitly
//! to every component. There are no ambient globals.
//!
//! # Mode Resolution
//!
//! Mode is resolved from the highest-priority source that answers:
//!
//! 1. An explicit `--mode` argument.
//! 2. The `SITEHERD_MODE` environment variable.
//! 3. The generic `DEV_ENV` development-environment hint, unless `CI` is set.
//! 4. Default: production.
//!
//! Resolution is deterministic given identical inputs, so the same invocation
//! in the same shell always lands in the same mode.
//!
//! # Path Conventions
//!
//! Mode governs naming, never structure: a domain's rendered output lives in
//! `<domain>/site` (production) or `<domain>/site_local` (local), and its
//! build configuration in `<domain>/config/production` or
//! `<domain>/config/local`. The directories are created on first request and
//! the functions are otherwise pure.

use serde::Serialize;
use std::{
    env,
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

/// Lowest port handed out to any domain.
pub const BASE_PORT: u16 = 4000;

/// Number of port slots above [`BASE_PORT`] available to the ecosystem.
pub const PORT_SLOTS: u16 = 1000;

/// Environment variable that overrides ecosystem root resolution.
pub const ROOT_ENV: &str = "SITEHERD_ROOT";

/// Environment variable that overrides mode detection.
pub const MODE_ENV: &str = "SITEHERD_MODE";

/// Generic development-environment hint honored by mode detection.
pub const DEV_HINT_ENV: &str = "DEV_ENV";

/// CI marker variable. Suppresses the development-environment heuristic.
pub const CI_ENV: &str = "CI";

/// How far `resolve_root` walks upward before giving up.
const ROOT_SEARCH_DEPTH: usize = 6;

/// Runtime mode of the whole process.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Local development: localhost URLs, `site_local` output.
    Local,

    /// Deployed: real domain URLs, `site` output, CNAME markers.
    #[default]
    Production,
}

impl Mode {
    /// Detect mode from an optional explicit flag and the environment.
    ///
    /// Priority: explicit flag, `SITEHERD_MODE`, `DEV_ENV` hint (ignored when
    /// `CI` is set), then production.
    pub fn detect(flag: Option<Mode>) -> Mode {
        if let Some(mode) = flag {
            return mode;
        }

        if let Ok(value) = env::var(MODE_ENV) {
            match value.to_lowercase().as_str() {
                "local" => return Mode::Local,
                "production" => return Mode::Production,
                other => warn!("ignoring unrecognized {MODE_ENV}={other:?}"),
            }
        }

        let in_ci = env::var_os(CI_ENV).is_some_and(|value| !value.is_empty());
        let dev_hint = env::var_os(DEV_HINT_ENV).is_some_and(|value| !value.is_empty());
        if dev_hint && !in_ci {
            return Mode::Local;
        }

        Mode::Production
    }

    /// Whether this is local development mode.
    pub fn is_local(&self) -> bool {
        matches!(self, Mode::Local)
    }

    /// Whether the build step should emit a CNAME marker file.
    ///
    /// Emission itself is the build's job. We only expose the decision.
    pub fn emits_cname(&self) -> bool {
        matches!(self, Mode::Production)
    }

    /// Output directory name under a domain for this mode.
    pub fn output_dir_name(&self) -> &'static str {
        match self {
            Mode::Local => "site_local",
            Mode::Production => "site",
        }
    }

    /// Configuration directory name under a domain's `config/` for this mode.
    pub fn config_dir_name(&self) -> &'static str {
        match self {
            Mode::Local => "local",
            Mode::Production => "production",
        }
    }
}

/// Immutable per-invocation context.
///
/// Constructed once in `main` and passed by reference to every component
/// call. Holds the resolved ecosystem root and the detected mode.
#[derive(Debug, Clone)]
pub struct Context {
    root: PathBuf,
    mode: Mode,
}

impl Context {
    /// Construct context by resolving the root and detecting the mode.
    pub fn resolve(mode_flag: Option<Mode>) -> Self {
        Self {
            root: resolve_root(),
            mode: Mode::detect(mode_flag),
        }
    }

    /// Construct context over an explicit root. Used by tests and `--root`.
    pub fn with_root(root: impl Into<PathBuf>, mode: Mode) -> Self {
        Self {
            root: root.into(),
            mode,
        }
    }

    /// Resolved ecosystem root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Detected mode.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Public URL for a domain under the current mode.
    pub fn url_for(&self, domain: &str) -> String {
        match self.mode {
            Mode::Local => format!("http://localhost:{}", preferred_port(domain)),
            Mode::Production => format!("https://{domain}"),
        }
    }

    /// Rendered-output directory for a domain under the current mode.
    ///
    /// Creates the directory on first request.
    ///
    /// # Errors
    ///
    /// - Return [`ContextError::CreateDir`] if the directory cannot be
    ///   created.
    pub fn output_dir_for(&self, domain: &str) -> Result<PathBuf> {
        let path = self.root.join(domain).join(self.mode.output_dir_name());
        ensure_dir(&path)?;
        Ok(path)
    }

    /// Build-configuration directory for a domain under the current mode.
    ///
    /// Creates the directory on first request. The orchestrator never
    /// interprets the files inside, it only hands the path to the build.
    ///
    /// # Errors
    ///
    /// - Return [`ContextError::CreateDir`] if the directory cannot be
    ///   created.
    pub fn config_dir_for(&self, domain: &str) -> Result<PathBuf> {
        let path = self
            .root
            .join(domain)
            .join("config")
            .join(self.mode.config_dir_name());
        ensure_dir(&path)?;
        Ok(path)
    }

    /// Location of the port registry file for this ecosystem.
    pub fn registry_path(&self) -> PathBuf {
        dirs::data_dir()
            .map(|path| path.join("siteherd"))
            .unwrap_or_else(|| self.root.join(".siteherd"))
            .join("ports.json")
    }
}

/// Deterministic preferred port for a domain.
///
/// Sum of the identifier's bytes mapped into the fixed slot range above
/// [`BASE_PORT`]. Collisions are possible and expected; actual allocation
/// with bind probing and fallback is the port manager's job.
pub fn preferred_port(domain: &str) -> u16 {
    let sum: u32 = domain.bytes().map(u32::from).sum();
    BASE_PORT + (sum % u32::from(PORT_SLOTS)) as u16
}

/// Resolve the ecosystem root directory.
///
/// Honors the `SITEHERD_ROOT` override (with shell expansion), otherwise
/// walks upward from the current directory for a bounded number of levels
/// looking for a directory that contains at least one domain-shaped entry.
/// Fails soft: when nothing matches, the current directory is returned and
/// the absence of a real root surfaces later as discovery finding zero
/// repositories.
pub fn resolve_root() -> PathBuf {
    if let Ok(value) = env::var(ROOT_ENV) {
        match shellexpand::full(&value) {
            Ok(expanded) => return PathBuf::from(expanded.into_owned()),
            Err(error) => warn!("ignoring {ROOT_ENV}={value:?}: {error}"),
        }
    }

    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let mut candidate = cwd.clone();
    for _ in 0..=ROOT_SEARCH_DEPTH {
        if contains_domain_entry(&candidate) {
            debug!("resolved ecosystem root: {}", candidate.display());
            return candidate;
        }

        match candidate.parent() {
            Some(parent) => candidate = parent.to_path_buf(),
            None => break,
        }
    }

    debug!("no ecosystem root found, falling back to {}", cwd.display());
    cwd
}

fn contains_domain_entry(dir: &Path) -> bool {
    let Ok(entries) = dir.read_dir() else {
        return false;
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .any(|name| crate::discover::is_domain_identifier(&name))
}

fn ensure_dir(path: &Path) -> Result<()> {
    mkdirp::mkdirp(path).map_err(|err| ContextError::CreateDir {
        source: err,
        path: path.to_path_buf(),
    })?;

    Ok(())
}

/// Path and mode resolution error types.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    /// Convention directory cannot be created on first request.
    #[error("failed to create directory at {:?}", path.display())]
    CreateDir {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Friendly result alias.
pub type Result<T, E = ContextError> = std::result::Result<T, E>;
