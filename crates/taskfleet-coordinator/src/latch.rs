//! Completion latch for a group of tasks.
//!
//! A latch tracks a membership set of (worker, signature) pairs. The task
//! queue resolves members as their tasks reach a terminal state; waiters are
//! woken through a [`Notify`] instead of polling. The first resolution of a
//! member wins; later ones are ignored.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use taskfleet_core::{Signature, TabletId, TaskState, WorkerId};

/// Why a task did not finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// The worker refused the task.
    Rejected(String),
    /// The submit RPC failed.
    Transport(String),
    /// The deadline elapsed before completion was observed.
    TimedOut,
    /// The worker stopped reporting the task and resends were exhausted.
    Unacknowledged { attempts: u32 },
    /// A task with the same signature was already outstanding.
    Duplicate,
    /// The task was never shipped because the build stopped early.
    NotSubmitted,
}

/// Terminal outcome applied to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Finished,
    Failed(FailureReason),
}

impl Resolution {
    /// Terminal task state this resolution maps to.
    pub fn state(&self) -> TaskState {
        match self {
            Self::Finished => TaskState::Finished,
            Self::Failed(FailureReason::TimedOut) => TaskState::TimedOut,
            Self::Failed(_) => TaskState::Failed,
        }
    }
}

/// One member of a latch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub worker_id: WorkerId,
    pub signature: Signature,
    pub tablet_id: Option<TabletId>,
    pub resolution: Option<Resolution>,
}

/// Counts over a latch's members.
#[derive(Debug, Default)]
pub struct LatchState {
    members: HashMap<(WorkerId, Signature), Member>,
    unresolved: usize,
    failed: usize,
}

impl LatchState {
    pub fn all_resolved(&self) -> bool {
        self.unresolved == 0
    }

    pub fn has_failure(&self) -> bool {
        self.failed > 0
    }

    /// Whether no member has resolved yet.
    pub fn none_resolved(&self) -> bool {
        self.unresolved == self.members.len()
    }

    /// Whether every member in `keys` has resolved.
    pub fn resolved_all_of(&self, keys: &[(WorkerId, Signature)]) -> bool {
        keys.iter().all(|key| {
            self.members
                .get(key)
                .map_or(true, |m| m.resolution.is_some())
        })
    }
}

/// Group completion signal.
#[derive(Debug, Default)]
pub struct CompletionLatch {
    state: Mutex<LatchState>,
    notify: Notify,
}

impl CompletionLatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a member. Re-adding an existing member is a no-op.
    pub fn add_member(
        &self,
        worker_id: WorkerId,
        signature: Signature,
        tablet_id: Option<TabletId>,
    ) {
        let mut state = self.lock();
        let key = (worker_id.clone(), signature);
        if state.members.contains_key(&key) {
            return;
        }
        state.members.insert(
            key,
            Member {
                worker_id,
                signature,
                tablet_id,
                resolution: None,
            },
        );
        state.unresolved += 1;
    }

    /// Resolve a member. Returns false if it is unknown or already resolved.
    pub fn resolve(
        &self,
        worker_id: &WorkerId,
        signature: Signature,
        resolution: Resolution,
    ) -> bool {
        let resolved = {
            let mut guard = self.lock();
            let state = &mut *guard;
            let failed = matches!(resolution, Resolution::Failed(_));
            match state.members.get_mut(&(worker_id.clone(), signature)) {
                Some(member) if member.resolution.is_none() => {
                    member.resolution = Some(resolution);
                    state.unresolved -= 1;
                    if failed {
                        state.failed += 1;
                    }
                    true
                }
                _ => false,
            }
        };
        if resolved {
            self.notify.notify_waiters();
        }
        resolved
    }

    /// Wait until `done` holds or `deadline` passes. Returns whether `done`
    /// held.
    pub async fn wait_until<F>(&self, deadline: Instant, done: F) -> bool
    where
        F: Fn(&LatchState) -> bool,
    {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a resolve in between is not lost.
            notified.as_mut().enable();

            let ready = done(&self.lock());
            if ready {
                return true;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return done(&self.lock());
            }
        }
    }

    /// Inspect the current state.
    pub fn with_state<R>(&self, f: impl FnOnce(&LatchState) -> R) -> R {
        f(&self.lock())
    }

    /// All members, resolved or not, ordered by (worker, signature).
    pub fn members(&self) -> Vec<Member> {
        let state = self.lock();
        let mut members: Vec<Member> = state.members.values().cloned().collect();
        members.sort_by(|a, b| {
            (&a.worker_id, a.signature).cmp(&(&b.worker_id, b.signature))
        });
        members
    }
}
