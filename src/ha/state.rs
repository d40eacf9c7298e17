//! Service lifecycle states.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped,
    BoundStandby,
    Serving,
}

impl ServiceState {
    fn as_u8(self) -> u8 {
        match self {
            ServiceState::Stopped => 0,
            ServiceState::BoundStandby => 1,
            ServiceState::Serving => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => ServiceState::BoundStandby,
            2 => ServiceState::Serving,
            _ => ServiceState::Stopped,
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "STOPPED"),
            ServiceState::BoundStandby => write!(f, "BOUND_STANDBY"),
            ServiceState::Serving => write!(f, "SERVING"),
        }
    }
}

/// Published state of one service.
///
/// Written only at the end of a transition, while the transition lock is held, so
/// readers never need that lock.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ServiceState::Stopped.as_u8()))
    }

    pub(crate) fn get(&self) -> ServiceState {
        ServiceState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn set(&self, state: ServiceState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }
}
