//! Init guard: bounds how many times a lifecycle's `init` may run.
//!
//! `init` runs once at construction and, only if that first run had no
//! handle, at most once more after a handle attaches. The reinit slot is
//! claimed before `init` runs, so rapid or concurrent reinit requests cannot
//! both win.

use parking_lot::Mutex;

/// How the construction-time `init` ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMode {
    WithoutHandle,
    WithHandle,
}

#[derive(Debug, Default, Clone, Copy)]
struct GuardState {
    constructed: Option<InitMode>,
    reinitialized: bool,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct InitGuard {
    state: Mutex<GuardState>,
}

impl InitGuard {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the construction-time run. Returns `false` if construction was
    /// already recorded (the first record wins).
    pub fn mark_constructed(&self, has_handle: bool) -> bool {
        let mut state = self.state.lock();
        if state.constructed.is_some() || state.closed {
            return false;
        }
        state.constructed = Some(if has_handle {
            InitMode::WithHandle
        } else {
            InitMode::WithoutHandle
        });
        true
    }

    /// Claim the single handle-triggered rerun.
    ///
    /// Succeeds only once, only after a construction run without a handle, and
    /// never after [`close`](Self::close).
    pub fn try_claim_reinit(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed
            || state.reinitialized
            || state.constructed != Some(InitMode::WithoutHandle)
        {
            return false;
        }
        state.reinitialized = true;
        true
    }

    /// Whether [`try_claim_reinit`](Self::try_claim_reinit) would succeed now.
    #[must_use]
    pub fn reinit_due(&self) -> bool {
        let state = self.state.lock();
        !state.closed
            && !state.reinitialized
            && state.constructed == Some(InitMode::WithoutHandle)
    }

    /// Refuse every later claim (disposal).
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    #[must_use]
    pub fn constructed(&self) -> Option<InitMode> {
        self.state.lock().constructed
    }

    #[must_use]
    pub fn is_reinitialized(&self) -> bool {
        self.state.lock().reinitialized
    }
}
