// SPDX-License-Identifier: MIT

//! Local preview port lifecycle management.
//!
//! Every domain gets a deterministic preferred port, but preference is not
//! possession: actual allocation probes the operating system for bind
//! availability and records the result in a registry file shared by all
//! siteherd processes on the machine.
//!
//! # Registry
//!
//! The registry is a single JSON object keyed by domain. Every mutation
//! happens under a short-lived exclusive file lock acquired with bounded
//! retries, so concurrent invocations either serialize or fail loudly. The
//! lock is held by an RAII guard and the operating system drops it with the
//! file descriptor, so even a hard interrupt cannot leave it stuck.
//!
//! # Staleness
//!
//! An allocation whose owning process has exited is stale, not sacred. Every
//! `allocate` and `list` call reclaims stale entries first so a crashed
//! preview server never blocks the next one.

use crate::{
    context::{self, BASE_PORT, PORT_SLOTS},
    discover::RepoRef,
};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    net::TcpListener,
    path::PathBuf,
    thread,
    time::Duration,
};
use tracing::{debug, info, instrument, warn};

/// Bound on forward probing when the preferred port is busy.
const MAX_PORT_PROBES: u16 = 100;

/// Bound on lock acquisition attempts before failing loudly.
const MAX_LOCK_ATTEMPTS: u32 = 50;

/// Pause between lock acquisition attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How many polls to wait for a graceful termination before escalating.
const KILL_WAIT_POLLS: u32 = 20;

/// Pause between termination polls.
const KILL_POLL_DELAY: Duration = Duration::from_millis(100);

/// One live allocation in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    /// Allocated TCP port.
    pub port: u16,

    /// Process that owns the allocation.
    pub pid: u32,

    /// When the allocation was made.
    pub started_at: DateTime<Utc>,

    /// Short label of what the owner is doing, for `list` output.
    pub command: String,
}

/// Handle on the registry file.
#[derive(Debug, Clone)]
pub struct PortRegistry {
    path: PathBuf,
}

impl PortRegistry {
    /// Registry at its conventional location for an ecosystem.
    pub fn new(ctx: &crate::context::Context) -> Self {
        Self {
            path: ctx.registry_path(),
        }
    }

    /// Registry at an explicit path. Used by tests.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Allocate a port for a domain.
    ///
    /// Reclaims stale entries, refuses when a live allocation already exists
    /// (unless `force`, which terminates the previous owner first), then
    /// probes from the domain's preferred port forward, wrapping within the
    /// slot range, for a bounded number of attempts.
    ///
    /// # Errors
    ///
    /// - Return [`PortError::UnknownDomain`] if the domain was not discovered.
    /// - Return [`PortError::AlreadyRunning`] on a live allocation without
    ///   `force`.
    /// - Return [`PortError::NoPortsAvailable`] when probing exhausts its
    ///   attempt budget.
    #[instrument(skip(self, known), level = "debug")]
    pub fn allocate(
        &self,
        domain: &str,
        known: &BTreeMap<String, RepoRef>,
        force: bool,
        command: &str,
    ) -> Result<u16> {
        if !known.contains_key(domain) {
            return Err(PortError::UnknownDomain {
                domain: domain.to_owned(),
            });
        }

        let _lock = self.lock()?;
        let mut entries = self.load()?;
        reclaim_stale(&mut entries);

        if let Some(existing) = entries.get(domain) {
            if !force {
                return Err(PortError::AlreadyRunning {
                    domain: domain.to_owned(),
                    pid: existing.pid,
                });
            }

            info!("force: terminating previous owner pid {}", existing.pid);
            terminate(existing.pid);
            entries.remove(domain);
        }

        let taken: Vec<u16> = entries.values().map(|entry| entry.port).collect();
        let preferred = context::preferred_port(domain);
        let port = probe_forward(preferred, &taken).ok_or(PortError::NoPortsAvailable {
            domain: domain.to_owned(),
            attempts: MAX_PORT_PROBES,
        })?;

        entries.insert(
            domain.to_owned(),
            PortAllocation {
                port,
                pid: std::process::id(),
                started_at: Utc::now(),
                command: command.to_owned(),
            },
        );
        self.save(&entries)?;

        info!("allocated port {port} for {domain}");
        Ok(port)
    }

    /// Release a domain's allocation.
    ///
    /// With `kill`, terminates the owning process first (graceful, then
    /// forceful on a short timer). The registry entry is removed regardless
    /// of process state.
    ///
    /// # Errors
    ///
    /// - Return [`PortError::NotAllocated`] if the domain has no entry.
    #[instrument(skip(self), level = "debug")]
    pub fn release(&self, domain: &str, kill: bool) -> Result<PortAllocation> {
        let _lock = self.lock()?;
        let mut entries = self.load()?;

        let entry = entries.remove(domain).ok_or(PortError::NotAllocated {
            domain: domain.to_owned(),
        })?;

        if kill && pid_alive(entry.pid) {
            info!("terminating pid {} for {domain}", entry.pid);
            terminate(entry.pid);
        }

        self.save(&entries)?;
        Ok(entry)
    }

    /// Remove every entry whose owning process no longer exists.
    ///
    /// Returns how many entries were reclaimed.
    pub fn reclaim(&self) -> Result<usize> {
        let _lock = self.lock()?;
        let mut entries = self.load()?;
        let before = entries.len();
        reclaim_stale(&mut entries);
        let reclaimed = before - entries.len();

        if reclaimed > 0 {
            self.save(&entries)?;
        }

        Ok(reclaimed)
    }

    /// Current live allocations, after implicit reclamation.
    pub fn list(&self) -> Result<BTreeMap<String, PortAllocation>> {
        let _lock = self.lock()?;
        let mut entries = self.load()?;
        let before = entries.len();
        reclaim_stale(&mut entries);

        if entries.len() != before {
            self.save(&entries)?;
        }

        Ok(entries)
    }

    /// Release every allocation, terminating the owners.
    ///
    /// Returns how many allocations were released.
    pub fn killall(&self) -> Result<usize> {
        let _lock = self.lock()?;
        let entries = self.load()?;

        for (domain, entry) in &entries {
            if pid_alive(entry.pid) {
                info!("terminating pid {} for {domain}", entry.pid);
                terminate(entry.pid);
            }
        }

        let released = entries.len();
        self.save(&BTreeMap::new())?;
        Ok(released)
    }

    /// Acquire the registry lock with bounded retry.
    fn lock(&self) -> Result<RegistryLock> {
        if let Some(parent) = self.path.parent() {
            mkdirp::mkdirp(parent).map_err(|err| PortError::WriteRegistry {
                source: err,
                path: self.path.clone(),
            })?;
        }

        let lock_path = self.path.with_extension("lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|err| PortError::WriteRegistry {
                source: err,
                path: lock_path.clone(),
            })?;

        for attempt in 0..MAX_LOCK_ATTEMPTS {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(RegistryLock { file }),
                Err(_) if attempt + 1 < MAX_LOCK_ATTEMPTS => {
                    debug!("registry lock busy, retry {}", attempt + 1);
                    thread::sleep(LOCK_RETRY_DELAY);
                }
                Err(_) => break,
            }
        }

        Err(PortError::LockTimeout { path: lock_path })
    }

    fn load(&self) -> Result<BTreeMap<String, PortAllocation>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(&self.path).map_err(|err| PortError::ReadRegistry {
            source: err,
            path: self.path.clone(),
        })?;

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        serde_json::from_str(&content).map_err(|err| {
            warn!("registry at {} is corrupt: {err}", self.path.display());
            PortError::Corrupt {
                source: err,
                path: self.path.clone(),
            }
        })
    }

    fn save(&self, entries: &BTreeMap<String, PortAllocation>) -> Result<()> {
        let content = serde_json::to_string_pretty(entries).map_err(|err| PortError::Corrupt {
            source: err,
            path: self.path.clone(),
        })?;

        fs::write(&self.path, content).map_err(|err| PortError::WriteRegistry {
            source: err,
            path: self.path.clone(),
        })
    }
}

/// RAII guard over the registry lock file.
///
/// The lock travels with the file descriptor, so dropping the guard, or the
/// process dying with it, releases the lock either way.
#[derive(Debug)]
struct RegistryLock {
    file: File,
}

impl Drop for RegistryLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn reclaim_stale(entries: &mut BTreeMap<String, PortAllocation>) {
    entries.retain(|domain, entry| {
        let alive = pid_alive(entry.pid);
        if !alive {
            info!("reclaiming stale allocation for {domain} (pid {})", entry.pid);
        }
        alive
    });
}

/// Search forward from the preferred port, wrapping within the slot range.
fn probe_forward(preferred: u16, taken: &[u16]) -> Option<u16> {
    let offset = preferred - BASE_PORT;
    for attempt in 0..MAX_PORT_PROBES {
        let port = BASE_PORT + (offset + attempt) % PORT_SLOTS;
        if taken.contains(&port) {
            continue;
        }

        if bind_available(port) {
            return Some(port);
        }

        debug!("port {port} busy, probing forward");
    }

    None
}

/// Best-effort OS-level availability check, not mere registry bookkeeping.
fn bind_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

/// Whether a process exists, by signal 0.
#[cfg(unix)]
pub(crate) fn pid_alive(pid: u32) -> bool {
    use nix::{sys::signal::kill, unistd::Pid};

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub(crate) fn pid_alive(_pid: u32) -> bool {
    false
}

/// Graceful-then-forceful termination of an allocation owner.
#[cfg(unix)]
fn terminate(pid: u32) {
    use nix::{
        sys::signal::{kill, Signal},
        unistd::Pid,
    };

    let target = Pid::from_raw(pid as i32);
    if kill(target, Signal::SIGTERM).is_err() {
        return;
    }

    for _ in 0..KILL_WAIT_POLLS {
        thread::sleep(KILL_POLL_DELAY);
        if !pid_alive(pid) {
            return;
        }
    }

    warn!("pid {pid} ignored SIGTERM, escalating to SIGKILL");
    let _ = kill(target, Signal::SIGKILL);
}

#[cfg(not(unix))]
fn terminate(_pid: u32) {
    warn!("process termination is only supported on unix");
}

/// Port lifecycle error types.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// Domain is not part of the discovered ecosystem.
    #[error("unknown domain {domain:?}")]
    UnknownDomain { domain: String },

    /// A live allocation already exists for the domain.
    #[error("{domain} is already running under pid {pid} (use force to replace)")]
    AlreadyRunning { domain: String, pid: u32 },

    /// No allocation exists for the domain.
    #[error("{domain} has no allocated port")]
    NotAllocated { domain: String },

    /// Bounded forward probing found nothing bindable.
    #[error("no ports available for {domain} after {attempts} attempts")]
    NoPortsAvailable { domain: String, attempts: u16 },

    /// Lock acquisition exhausted its retry budget.
    #[error("timed out waiting for registry lock at {:?}", path.display())]
    LockTimeout { path: PathBuf },

    /// Registry file cannot be read.
    #[error("failed to read port registry at {:?}", path.display())]
    ReadRegistry {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Registry file cannot be written.
    #[error("failed to write port registry at {:?}", path.display())]
    WriteRegistry {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Registry file is not valid JSON.
    #[error("port registry at {:?} is corrupt", path.display())]
    Corrupt {
        #[source]
        source: serde_json::Error,
        path: PathBuf,
    },
}

/// Friendly result alias.
pub type Result<T, E = PortError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discover::{RepoKind, RepoRef};
    use pretty_assertions::assert_eq;

    // A pid far above any real pid ceiling, guaranteed dead.
    const DEAD_PID: u32 = 999_999_999;

    fn known(domains: &[&str]) -> BTreeMap<String, RepoRef> {
        domains
            .iter()
            .map(|domain| {
                (
                    (*domain).to_owned(),
                    RepoRef {
                        identifier: (*domain).to_owned(),
                        kind: RepoKind::Domain,
                        resolved_path: "/tmp".into(),
                    },
                )
            })
            .collect()
    }

    fn scratch_registry() -> (tempfile::TempDir, PortRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = PortRegistry::with_path(dir.path().join("ports.json"));
        (dir, registry)
    }

    #[test]
    fn allocate_returns_preferred_port_when_free() -> Result<()> {
        let (_dir, registry) = scratch_registry();
        let port = registry.allocate("a.in", &known(&["a.in"]), false, "serve")?;

        // The preferred slot may legitimately be busy on a loaded machine,
        // but the result always lands in range.
        assert!(port >= BASE_PORT && port < BASE_PORT + PORT_SLOTS);

        Ok(())
    }

    #[test]
    fn allocate_rejects_unknown_domain() {
        let (_dir, registry) = scratch_registry();
        let result = registry.allocate("nope.in", &known(&["a.in"]), false, "serve");

        assert!(matches!(result, Err(PortError::UnknownDomain { .. })));
    }

    #[test]
    fn second_allocate_without_force_is_already_running() -> Result<()> {
        let (_dir, registry) = scratch_registry();
        let domains = known(&["a.in"]);

        // First allocation is owned by this live test process.
        registry.allocate("a.in", &domains, false, "serve")?;
        let result = registry.allocate("a.in", &domains, false, "serve");

        assert!(matches!(result, Err(PortError::AlreadyRunning { .. })));

        Ok(())
    }

    #[test]
    fn allocate_skips_busy_port() -> Result<()> {
        let (_dir, registry) = scratch_registry();
        let preferred = crate::context::preferred_port("a.in");

        // Squat on the preferred port to force the linear probe forward.
        let _squatter = TcpListener::bind(("127.0.0.1", preferred)).ok();
        let port = registry.allocate("a.in", &known(&["a.in"]), false, "serve")?;

        if _squatter.is_some() {
            assert_ne!(port, preferred);
        }
        assert!(port >= BASE_PORT && port < BASE_PORT + PORT_SLOTS);

        Ok(())
    }

    #[test]
    fn stale_entries_are_reclaimed_before_allocation() -> Result<()> {
        let (_dir, registry) = scratch_registry();
        let mut entries = BTreeMap::new();
        entries.insert(
            "a.in".to_owned(),
            PortAllocation {
                port: BASE_PORT,
                pid: DEAD_PID,
                started_at: Utc::now(),
                command: "serve".into(),
            },
        );
        registry.save(&entries)?;

        // The dead owner must not block a fresh allocation.
        registry.allocate("a.in", &known(&["a.in"]), false, "serve")?;
        let listing = registry.list()?;

        assert_eq!(listing.len(), 1);
        assert_eq!(listing["a.in"].pid, std::process::id());

        Ok(())
    }

    #[test]
    fn list_drops_dead_owners() -> Result<()> {
        let (_dir, registry) = scratch_registry();
        let mut entries = BTreeMap::new();
        entries.insert(
            "a.in".to_owned(),
            PortAllocation {
                port: BASE_PORT + 1,
                pid: DEAD_PID,
                started_at: Utc::now(),
                command: "serve".into(),
            },
        );
        entries.insert(
            "b.in".to_owned(),
            PortAllocation {
                port: BASE_PORT + 2,
                pid: std::process::id(),
                started_at: Utc::now(),
                command: "serve".into(),
            },
        );
        registry.save(&entries)?;

        let listing = registry.list()?;
        assert_eq!(listing.len(), 1);
        assert!(listing.contains_key("b.in"));

        Ok(())
    }

    #[test]
    fn release_removes_entry() -> Result<()> {
        let (_dir, registry) = scratch_registry();
        let domains = known(&["a.in"]);

        registry.allocate("a.in", &domains, false, "serve")?;
        registry.release("a.in", false)?;
        let result = registry.release("a.in", false);

        assert!(matches!(result, Err(PortError::NotAllocated { .. })));

        Ok(())
    }

    #[test]
    fn registry_round_trips_as_json_object() -> Result<()> {
        let (_dir, registry) = scratch_registry();
        let mut entries = BTreeMap::new();
        entries.insert(
            "a.in".to_owned(),
            PortAllocation {
                port: 4321,
                pid: 42,
                started_at: Utc::now(),
                command: "serve".into(),
            },
        );

        registry.save(&entries)?;
        let loaded = registry.load()?;

        assert_eq!(loaded, entries);

        Ok(())
    }
}
