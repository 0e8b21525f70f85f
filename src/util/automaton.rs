//! Shared automaton state handling.
//!
//! Every long-lived object in the gateway (ServerManager, NodeManager, the
//! connectors) runs the same coarse lifecycle and publishes its current state
//! through a lock-free cell so that worker tasks can observe termination
//! requests at each loop iteration.

use std::sync::atomic::{AtomicU32, Ordering};

/// Lifecycle states common to the gateway automatons.
///
/// `Error` is an absorbing sideband state entered on internal faults
/// (typically pool exhaustion that cannot be attributed to ordinary
/// saturation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum AutomatonState {
    Creating = 0,
    Created = 1,
    Initialized = 2,
    Idle = 3,
    Running = 4,
    Stopping = 5,
    Terminated = 6,
    Error = 7,
}

impl AutomatonState {
    fn from_u32(value: u32) -> AutomatonState {
        match value {
            0 => AutomatonState::Creating,
            1 => AutomatonState::Created,
            2 => AutomatonState::Initialized,
            3 => AutomatonState::Idle,
            4 => AutomatonState::Running,
            5 => AutomatonState::Stopping,
            6 => AutomatonState::Terminated,
            _ => AutomatonState::Error,
        }
    }
}

/// Atomic cell holding an [`AutomatonState`].
///
/// All transitions are plain stores: by design each automaton has a single
/// writer for its state (the task processing its command queue), other tasks
/// only read.
#[derive(Debug)]
pub struct StateCell(AtomicU32);

impl StateCell {
    pub fn new(state: AutomatonState) -> Self {
        StateCell(AtomicU32::new(state as u32))
    }

    pub fn get(&self) -> AutomatonState {
        AutomatonState::from_u32(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: AutomatonState) {
        self.0.store(state as u32, Ordering::SeqCst);
    }

    /// Transition only if the current state matches `from`. Returns whether
    /// the transition happened.
    pub fn transition(&self, from: AutomatonState, to: AutomatonState) -> bool {
        self.0
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is(&self, state: AutomatonState) -> bool {
        self.get() == state
    }
}

impl Default for StateCell {
    fn default() -> Self {
        StateCell::new(AutomatonState::Creating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_requires_expected_state() {
        let cell = StateCell::new(AutomatonState::Created);
        assert!(!cell.transition(AutomatonState::Idle, AutomatonState::Running));
        assert!(cell.transition(AutomatonState::Created, AutomatonState::Initialized));
        assert_eq!(cell.get(), AutomatonState::Initialized);
    }
}
