//! Group scheduler: a FIFO of ready groups with round-robin fairness and
//! an at-most-one-worker-per-group guarantee.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

struct SchedState {
    /// Groups waiting to be handed to a worker, in arrival order.
    ready: VecDeque<String>,
    /// Groups that are either in `ready` or currently held by a worker.
    /// Membership here is what makes `notify_group` idempotent and keeps a
    /// held group from being handed out twice.
    active: HashSet<String>,
}

/// Hands ready groups to workers.
///
/// A group enters via [`notify_group`](Self::notify_group), is held by
/// exactly one worker between [`acquire`](Self::acquire) and
/// [`release`](Self::release), and re-enters at the tail when released
/// with work remaining -- so groups with deep backlogs alternate with
/// everyone else instead of monopolizing workers.
pub struct GroupScheduler {
    state: Mutex<SchedState>,
    notify: Notify,
}

impl GroupScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SchedState {
                ready: VecDeque::new(),
                active: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Mark a group as having pending work. No-op while the group is
    /// already queued or held by a worker.
    pub fn notify_group(&self, group_id: &str) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        if state.active.insert(group_id.to_owned()) {
            state.ready.push_back(group_id.to_owned());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Wait for a ready group and take exclusive hold of it.
    ///
    /// The group stays in the active set while held, so no other worker
    /// can acquire it until it is released.
    pub async fn acquire(&self) -> String {
        loop {
            // Register interest before checking, so a notify between the
            // check and the await is not lost.
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("scheduler lock poisoned");
                if let Some(group) = state.ready.pop_front() {
                    return group;
                }
            }
            notified.await;
        }
    }

    /// Return a held group. With `still_has_work` it goes to the tail of
    /// the ready queue; otherwise it leaves the active set and a future
    /// `notify_group` can re-admit it.
    pub fn release(&self, group_id: &str, still_has_work: bool) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        if still_has_work {
            if state.active.contains(group_id) {
                state.ready.push_back(group_id.to_owned());
                drop(state);
                self.notify.notify_one();
            }
        } else {
            state.active.remove(group_id);
        }
    }

    /// Number of groups waiting in the ready queue.
    pub fn ready_len(&self) -> usize {
        self.state
            .lock()
            .expect("scheduler lock poisoned")
            .ready
            .len()
    }
}

impl Default for GroupScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GroupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("scheduler lock poisoned");
        f.debug_struct("GroupScheduler")
            .field("ready", &state.ready)
            .field("active", &state.active.len())
            .finish()
    }
}
