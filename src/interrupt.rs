// SPDX-License-Identifier: MIT

//! Interrupt-time cleanup.
//!
//! RAII guards handle the normal and error paths, but a Ctrl-C in the middle
//! of a branch-switched read or a registry mutation kills the process before
//! any destructor runs. This module keeps a registry of pending cleanup
//! actions that a `ctrlc` handler drains before exiting, so an interrupt can
//! never strand a repository on the wrong branch.
//!
//! Guards register an action on entry and deregister it on drop; the handler
//! only ever sees actions that are still pending.

use std::{
    collections::BTreeMap,
    process::exit,
    sync::{
        atomic::{AtomicU64, Ordering},
        LazyLock, Mutex, Once,
    },
};
use tracing::warn;

type CleanupFn = Box<dyn FnOnce() + Send>;

static PENDING: LazyLock<Mutex<BTreeMap<u64, CleanupFn>>> =
    LazyLock::new(|| Mutex::new(BTreeMap::new()));
static NEXT_TICKET: AtomicU64 = AtomicU64::new(0);
static INSTALL: Once = Once::new();

/// Install the interrupt handler. Safe to call more than once.
pub fn install() {
    INSTALL.call_once(|| {
        let result = ctrlc::set_handler(|| {
            warn!("interrupted, running pending cleanup");
            drain();
            exit(130);
        });

        if let Err(error) = result {
            warn!("cannot install interrupt handler: {error}");
        }
    });
}

/// Register a cleanup action to run if the process is interrupted.
///
/// Dropping the returned token deregisters the action without running it.
/// The caller remains responsible for the normal-path cleanup itself.
pub fn defer(action: impl FnOnce() + Send + 'static) -> CleanupToken {
    let ticket = NEXT_TICKET.fetch_add(1, Ordering::Relaxed);
    if let Ok(mut pending) = PENDING.lock() {
        pending.insert(ticket, Box::new(action));
    }

    CleanupToken { ticket }
}

/// Handle on one registered cleanup action.
#[derive(Debug)]
pub struct CleanupToken {
    ticket: u64,
}

impl Drop for CleanupToken {
    fn drop(&mut self) {
        if let Ok(mut pending) = PENDING.lock() {
            pending.remove(&self.ticket);
        }
    }
}

/// Run every pending action, newest first.
fn drain() {
    let actions = match PENDING.lock() {
        Ok(mut pending) => std::mem::take(&mut *pending),
        Err(_) => return,
    };

    for (_, action) in actions.into_iter().rev() {
        action();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    // Single test because the pending-action registry is process-global and
    // parallel tests would observe each other's drains.
    #[test]
    fn tokens_gate_pending_actions() {
        let ran = Arc::new(AtomicUsize::new(0));

        // A dropped token deregisters its action without running it.
        let counter = Arc::clone(&ran);
        let token = defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(token);
        drain();
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // A live token's action runs exactly once, even across two drains.
        let counter = Arc::clone(&ran);
        let token = defer(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drain();
        drain();
        drop(token);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
