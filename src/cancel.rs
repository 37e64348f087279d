//! Cancellation tokens fanning out from OS signals to every phase subprocess.
//!
//! A single run owns one root token, cancelled by SIGINT/SIGTERM/SIGHUP (or by
//! tests directly). Derived child tokens let the parallel coordinator cancel a
//! sibling worker without tearing down the whole run: a child observes its
//! parent's cancellation, but cancelling a child never propagates upward.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

/// Cooperative cancellation flag shared between the runner, dispatchers, and
/// subprocess supervisors. Cheap to clone; clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    own: Arc<AtomicBool>,
    parents: Vec<Arc<AtomicBool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark this token cancelled. Children of this token see the cancellation;
    /// parents do not.
    pub fn cancel(&self) {
        self.own.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.own.load(Ordering::SeqCst)
            || self.parents.iter().any(|flag| flag.load(Ordering::SeqCst))
    }

    /// Derive a child token: cancelled when either this token or any of its
    /// ancestors is cancelled, while its own `cancel` stays local.
    pub fn child(&self) -> CancelToken {
        let mut parents = self.parents.clone();
        parents.push(Arc::clone(&self.own));
        CancelToken {
            own: Arc::new(AtomicBool::new(false)),
            parents,
        }
    }

    /// Flip this token on SIGINT, SIGTERM, or SIGHUP.
    pub fn register_signals(&self) -> Result<()> {
        for signal in [SIGINT, SIGTERM, SIGHUP] {
            signal_hook::flag::register(signal, Arc::clone(&self.own))
                .with_context(|| format!("register handler for signal {signal}"))?;
        }
        Ok(())
    }
}
