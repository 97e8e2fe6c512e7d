//! Per-session admission gate
//!
//! Requests for one session are served strictly in ticket order, one at
//! a time; different sessions never wait on each other. A ticket stamps
//! the arrival sequence while the session entry is locked, so ticket
//! order and arrival order always agree.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::types::SessionId;

#[derive(Debug, Default)]
struct GateState {
    next_ticket: u64,
    serving: u64,
    /// Tickets dropped before their turn came
    abandoned: BTreeSet<u64>,
}

#[derive(Debug, Default)]
struct Gate {
    state: Mutex<GateState>,
    notify: Notify,
}

impl Gate {
    fn is_idle(&self) -> bool {
        let st = self.state.lock();
        st.serving == st.next_ticket
    }
}

/// Place in one session's queue; dropping it lets the next request in
#[derive(Debug)]
pub struct Ticket {
    gate: Arc<Gate>,
    number: u64,
    arrival_sequence: u64,
}

impl Ticket {
    pub fn arrival_sequence(&self) -> u64 {
        self.arrival_sequence
    }

    /// Wait until every earlier ticket of the session has been dropped
    pub async fn wait(&self) {
        loop {
            let notified = self.gate.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.gate.state.lock().serving == self.number {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut guard = self.gate.state.lock();
        let st = &mut *guard;
        if st.serving == self.number {
            st.serving += 1;
            while st.abandoned.remove(&st.serving) {
                st.serving += 1;
            }
            drop(guard);
            self.gate.notify.notify_waiters();
        } else {
            st.abandoned.insert(self.number);
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionGates {
    gates: DashMap<SessionId, Arc<Gate>>,
}

impl SessionGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next ticket for `session_id`, stamping it with `stamp()`
    pub fn ticket(&self, session_id: &SessionId, stamp: impl FnOnce() -> u64) -> Ticket {
        let entry = self.gates.entry(session_id.clone()).or_default();
        let gate = Arc::clone(entry.value());

        let (number, arrival_sequence) = {
            let mut st = gate.state.lock();
            let number = st.next_ticket;
            st.next_ticket += 1;
            (number, stamp())
        };
        drop(entry);

        Ticket {
            gate,
            number,
            arrival_sequence,
        }
    }

    /// Forget an idle session's gate; a busy gate is kept
    pub fn remove_idle(&self, session_id: &SessionId) -> bool {
        self.gates.remove_if(session_id, |_, gate| gate.is_idle()).is_some()
    }

    pub fn len(&self) -> usize {
        self.gates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }
}
