//! Counted rendezvous shared by the processes of a job.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, TesseraError};

struct BarrierState {
    arrived: usize,
    generation: u64,
}

/// Cyclic barrier over a fixed set of participants.
///
/// Rounds are tracked by generation, so the barrier is reusable: the last
/// arrival of a round releases everyone and opens the next round. Unlike
/// [`std::sync::Barrier`], a wait can carry a deadline; see
/// [`BarrierGroup::wait_within`].
pub struct BarrierGroup {
    expected: usize,
    state: Mutex<BarrierState>,
    cv: Condvar,
}

impl BarrierGroup {
    /// Creates a barrier that releases once `expected` participants arrive.
    pub fn new(expected: usize) -> BarrierGroup {
        BarrierGroup {
            expected: expected.max(1),
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Participants a round waits for.
    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Arrives and blocks until the round completes. With a missing
    /// participant this never returns.
    pub fn wait(&self) {
        let mut state = self.state.lock();
        if self.arrive(&mut state) {
            return;
        }
        let gen = state.generation;
        while state.generation == gen {
            self.cv.wait(&mut state);
        }
    }

    /// Arrives and blocks until the round completes or `timeout` elapses.
    ///
    /// A timed-out caller stays counted toward the round: once the
    /// stragglers arrive, the round completes for everyone still blocked.
    /// The error reports how many participants had arrived by the deadline.
    pub fn wait_within(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        if self.arrive(&mut state) {
            return Ok(());
        }
        let gen = state.generation;
        while state.generation == gen {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TesseraError::ParticipantTimeout {
                    arrived: state.arrived,
                    expected: self.expected,
                });
            }
            let timed_out = self.cv.wait_for(&mut state, remaining).timed_out();
            if timed_out && state.generation == gen {
                return Err(TesseraError::ParticipantTimeout {
                    arrived: state.arrived,
                    expected: self.expected,
                });
            }
        }
        Ok(())
    }

    /// Records one arrival; returns true when it completed the round.
    fn arrive(&self, state: &mut BarrierState) -> bool {
        state.arrived += 1;
        if state.arrived == self.expected {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.cv.notify_all();
            true
        } else {
            false
        }
    }
}
