//! Reusable rendezvous barrier.
//!
//! [`BarrierState`] is the bookkeeping shared by the in-process
//! [`LocalBarrier`] and the process coordinator: parties arrive, the last
//! arrival releases the current generation and the barrier is immediately
//! ready for the next one. Breaking the barrier fails every current and
//! future waiter; a broken barrier stays broken.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::BarrierError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Other parties are still missing for this generation.
    Waiting { generation: u64 },
    /// This arrival completed the generation and released everyone.
    Released { generation: u64 },
}

#[derive(Debug, Clone)]
pub struct BarrierState {
    parties: usize,
    arrived: usize,
    generation: u64,
    broken: bool,
}

impl BarrierState {
    pub fn new(parties: usize) -> Self {
        assert!(parties > 0, "a barrier needs at least one party");
        Self {
            parties,
            arrived: 0,
            generation: 0,
            broken: false,
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    pub fn arrived(&self) -> usize {
        self.arrived
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn arrive(&mut self) -> Result<Arrival, BarrierError> {
        if self.broken {
            return Err(BarrierError::Broken);
        }
        let generation = self.generation;
        self.arrived += 1;
        if self.arrived == self.parties {
            self.arrived = 0;
            self.generation += 1;
            Ok(Arrival::Released { generation })
        } else {
            Ok(Arrival::Waiting { generation })
        }
    }

    pub fn abort(&mut self) {
        self.broken = true;
        self.arrived = 0;
    }

    /// Confirms the barrier is usable for the next round. Parties already
    /// waiting on the live generation keep their place. A break is final:
    /// once a party has aborted, `reset` reports it instead of clearing it.
    pub fn reset(&mut self) -> Result<(), BarrierError> {
        if self.broken {
            return Err(BarrierError::Broken);
        }
        Ok(())
    }
}

/// Blocking barrier for parties inside one process.
pub struct LocalBarrier {
    state: Mutex<BarrierState>,
    released: Condvar,
    timeout: Duration,
}

impl LocalBarrier {
    pub fn new(parties: usize, timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BarrierState::new(parties)),
            released: Condvar::new(),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        // A panicking party must not wedge the others; the state is plain data.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Blocks until every party has arrived. Timing out breaks the barrier
    /// for everyone.
    pub fn wait(&self) -> Result<Arrival, BarrierError> {
        let mut state = self.lock();
        let arrival = state.arrive()?;
        let generation = match arrival {
            Arrival::Released { .. } => {
                self.released.notify_all();
                return Ok(arrival);
            }
            Arrival::Waiting { generation } => generation,
        };

        let deadline = Instant::now() + self.timeout;
        loop {
            if state.is_broken() {
                return Err(BarrierError::Broken);
            }
            if state.generation() != generation {
                return Ok(arrival);
            }
            let now = Instant::now();
            if now >= deadline {
                state.abort();
                self.released.notify_all();
                return Err(BarrierError::Timeout(self.timeout));
            }
            let (guard, _) = self
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            state = guard;
        }
    }

    pub fn abort(&self) {
        self.lock().abort();
        self.released.notify_all();
    }

    pub fn reset(&self) -> Result<(), BarrierError> {
        self.lock().reset()
    }

    pub fn generation(&self) -> u64 {
        self.lock().generation()
    }

    pub fn is_broken(&self) -> bool {
        self.lock().is_broken()
    }
}

/// What a worker needs from a barrier, whichever side of a process boundary
/// the other parties live on.
pub trait Rendezvous {
    fn wait(&self) -> Result<Arrival, BarrierError>;
    fn reset(&self) -> Result<(), BarrierError>;
    fn abort(&self);
}

impl Rendezvous for LocalBarrier {
    fn wait(&self) -> Result<Arrival, BarrierError> {
        LocalBarrier::wait(self)
    }

    fn reset(&self) -> Result<(), BarrierError> {
        LocalBarrier::reset(self)
    }

    fn abort(&self) {
        LocalBarrier::abort(self);
    }
}
