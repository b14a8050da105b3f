// SPDX-License-Identifier: MIT

//! Orchestration layer for a personal multi-repository static-site
//! ecosystem.
//!
//! Domains, blog subdomains, and independently versioned projects are wired
//! together on disk through symlinks, and must be operated on as coherent
//! groups. Siteherd does not build sites; it prepares the ground state a
//! separate build step consumes: which repositories exist and where they
//! really live, which branch each must be on, which local preview port each
//! domain gets, and which output and config directories the current mode
//! implies.
//!
//! # Components
//!
//! - [`context`]: ecosystem root, mode, and path/URL conventions.
//! - [`discover`]: symlink-aware repository discovery and classification.
//! - [`ports`]: deterministic port assignment with a locked registry.
//! - [`sync`]: atomic multi-repository git orchestration.
//! - [`interrupt`]: guaranteed cleanup on interrupt.
//!
//! Data flows one direction: context feeds discovery, discovery feeds both
//! the port manager and the git orchestrator.

pub mod context;
pub mod discover;
pub mod interrupt;
pub mod ports;
pub mod sync;

pub use context::{Context, Mode};
pub use discover::{discover, RepoKind, RepoRef};
pub use ports::{PortAllocation, PortRegistry};
pub use sync::{Orchestrator, SyncGroup, SyncState};
