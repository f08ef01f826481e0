//! Per-index lifecycle tracking.
//!
//! ```text
//! absent -> creating -> open -> closing -> closed -> reopening -> open
//!                        open | closed -> deleting -> absent
//! ```
//!
//! States are this process's last known view of each index. Transitions on
//! one index are serialised by a per-index lock; the backend remains the
//! source of truth and engines refresh the view with [`IndexLifecycle::observe`]
//! whenever they learn it.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::error::{Result, SiftError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexState {
    Absent,
    Creating,
    Open,
    Closing,
    Closed,
    Reopening,
    Deleting,
}

impl std::fmt::Display for IndexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IndexState::Absent => "absent",
            IndexState::Creating => "creating",
            IndexState::Open => "open",
            IndexState::Closing => "closing",
            IndexState::Closed => "closed",
            IndexState::Reopening => "reopening",
            IndexState::Deleting => "deleting",
        };
        f.write_str(s)
    }
}

impl IndexState {
    pub fn can_transition_to(self, next: IndexState) -> bool {
        use IndexState::*;
        matches!(
            (self, next),
            (Absent, Creating)
                | (Creating, Open)
                | (Open, Closing)
                | (Closing, Closed)
                | (Closed, Reopening)
                | (Reopening, Open)
                | (Open, Deleting)
                | (Closed, Deleting)
                | (Deleting, Absent)
        )
    }

    /// Whether the index is mid-transition.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            IndexState::Creating
                | IndexState::Closing
                | IndexState::Reopening
                | IndexState::Deleting
        )
    }
}

/// Known index states plus per-index locks.
#[derive(Default)]
pub struct IndexLifecycle {
    states: DashMap<String, IndexState>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl IndexLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last known state, `None` if this process has not seen the index.
    pub fn state(&self, index: &str) -> Option<IndexState> {
        self.states.get(index).map(|s| *s.value())
    }

    /// Record backend truth without validating a transition.
    pub fn observe(&self, index: &str, state: IndexState) {
        debug!(index, %state, "observed index state");
        self.states.insert(index.to_string(), state);
    }

    /// Serialise lifecycle operations on one index.
    pub async fn lock(&self, index: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(index.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        lock.lock_owned().await
    }

    /// Drop what is known about a deleted index. The state entry survives
    /// if the index was recreated meanwhile; the lock entry survives while
    /// another task holds or awaits it.
    pub fn forget(&self, index: &str) {
        self.states
            .remove_if(index, |_, state| *state == IndexState::Absent);
        self.locks
            .remove_if(index, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of indices with a known state.
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Enter a transient state. An unseen index is assumed to be in
    /// `assumed`. The returned guard restores the previous state unless
    /// committed, so a failed or cancelled operation leaves no transient
    /// state behind.
    pub fn begin(
        &self,
        index: &str,
        next: IndexState,
        assumed: IndexState,
    ) -> Result<TransitionGuard<'_>> {
        let previous = self.state(index).unwrap_or(assumed);
        if !previous.can_transition_to(next) {
            return Err(SiftError::InvalidTransition {
                index: index.to_string(),
                from: previous,
                to: next,
            });
        }
        self.states.insert(index.to_string(), next);
        debug!(index, from = %previous, to = %next, "index transition started");
        Ok(TransitionGuard {
            lifecycle: self,
            index: index.to_string(),
            previous,
            current: next,
            committed: false,
        })
    }
}

pub struct TransitionGuard<'a> {
    lifecycle: &'a IndexLifecycle,
    index: String,
    previous: IndexState,
    current: IndexState,
    committed: bool,
}

impl TransitionGuard<'_> {
    pub fn commit(mut self, state: IndexState) -> Result<()> {
        if !self.current.can_transition_to(state) {
            return Err(SiftError::InvalidTransition {
                index: self.index.clone(),
                from: self.current,
                to: state,
            });
        }
        self.lifecycle.states.insert(self.index.clone(), state);
        self.committed = true;

        crate::metrics::INDEX_TRANSITIONS_TOTAL
            .with_label_values(&[&state.to_string()])
            .inc();
        info!(index = %self.index, from = %self.previous, to = %state, "index transition complete");
        Ok(())
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            debug!(index = %self.index, restored = %self.previous, "index transition rolled back");
            self.lifecycle
                .states
                .insert(self.index.clone(), self.previous);
        }
    }
}
