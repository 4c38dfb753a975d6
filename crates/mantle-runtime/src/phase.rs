//! Runtime phase state machine
//!
//! `Booting -> Running -> Halting`, with `Booting -> Halting` for a runtime
//! that never finished starting. `Halting` is terminal.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{RuntimeError, RuntimeResult};

/// Lifecycle phase of the runtime
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimePhase {
    /// Subsystems are being set up
    Booting = 0,
    /// Normal operation
    Running = 1,
    /// Shutting down; new work is refused
    Halting = 2,
}

impl From<u8> for RuntimePhase {
    fn from(v: u8) -> Self {
        match v {
            0 => RuntimePhase::Booting,
            1 => RuntimePhase::Running,
            2 => RuntimePhase::Halting,
            _ => RuntimePhase::Booting,
        }
    }
}

impl RuntimePhase {
    /// True if the state machine allows `self -> to`
    pub fn can_transition(self, to: RuntimePhase) -> bool {
        matches!(
            (self, to),
            (RuntimePhase::Booting, RuntimePhase::Running)
                | (RuntimePhase::Booting, RuntimePhase::Halting)
                | (RuntimePhase::Running, RuntimePhase::Halting)
        )
    }
}

/// Atomically updated phase
#[derive(Debug)]
pub struct AtomicPhase(AtomicU8);

impl Default for AtomicPhase {
    fn default() -> Self {
        Self::new(RuntimePhase::Booting)
    }
}

impl AtomicPhase {
    /// Create in `phase`
    pub fn new(phase: RuntimePhase) -> Self {
        Self(AtomicU8::new(phase as u8))
    }

    /// Current phase
    #[inline]
    pub fn load(&self) -> RuntimePhase {
        RuntimePhase::from(self.0.load(Ordering::Acquire))
    }

    /// Move to `to`, returning the phase it left
    pub fn transition(&self, to: RuntimePhase) -> RuntimeResult<RuntimePhase> {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = RuntimePhase::from(current);
            if !from.can_transition(to) {
                return Err(RuntimeError::InvalidPhaseTransition { from, to });
            }
            match self
                .0
                .compare_exchange(current, to as u8, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(from),
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_from_u8() {
        assert_eq!(RuntimePhase::from(0), RuntimePhase::Booting);
        assert_eq!(RuntimePhase::from(1), RuntimePhase::Running);
        assert_eq!(RuntimePhase::from(2), RuntimePhase::Halting);
        assert_eq!(RuntimePhase::from(255), RuntimePhase::Booting);
    }

    #[test]
    fn test_forward_transitions() {
        let phase = AtomicPhase::default();
        assert_eq!(phase.transition(RuntimePhase::Running).unwrap(), RuntimePhase::Booting);
        assert_eq!(phase.transition(RuntimePhase::Halting).unwrap(), RuntimePhase::Running);
        assert_eq!(phase.load(), RuntimePhase::Halting);
    }

    #[test]
    fn test_halting_is_terminal() {
        let phase = AtomicPhase::new(RuntimePhase::Halting);
        for to in [RuntimePhase::Booting, RuntimePhase::Running, RuntimePhase::Halting] {
            assert_eq!(
                phase.transition(to),
                Err(RuntimeError::InvalidPhaseTransition {
                    from: RuntimePhase::Halting,
                    to
                })
            );
        }
    }

    #[test]
    fn test_running_cannot_reboot() {
        let phase = AtomicPhase::new(RuntimePhase::Running);
        assert!(phase.transition(RuntimePhase::Booting).is_err());
        assert_eq!(phase.load(), RuntimePhase::Running);
    }

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_phase_never_moves_backwards(requests in prop::collection::vec(0u8..3, 0..20)) {
            let phase = AtomicPhase::default();
            let mut last = phase.load() as u8;
            for request in requests {
                let to = RuntimePhase::from(request);
                let result = phase.transition(to);
                let now = phase.load() as u8;
                prop_assert!(now >= last);
                prop_assert_eq!(result.is_ok(), now == request && now > last);
                last = now;
            }
        }
    }
}
