//! Subchannel Lifecycle
//!
//! ```text
//!  Inactive ──ack──▶ Established ──activate──▶ Active
//!     │                   │                      │
//!   nack               check/shutdown     check/shutdown
//!     ▼                   ▼                      ▼
//!   Error ─shutdown─▶ Stopped ──halt/clear──▶ Cleanup ──irq──▶ Stopped
//! ```
//!
//! Every state change goes through [`transition`]; [`StateCell`] adds the
//! wait-for-change primitive the control path blocks on.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::error::{QdioError, QdioResult};

/// Subchannel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IrqState {
    /// Queues allocated, nothing installed with the device
    Inactive,
    /// Queues installed, data transfer not started
    Established,
    /// Data transfer running
    Active,
    /// Halt or clear in progress
    Cleanup,
    /// Stopped by shutdown or an activation check
    Stopped,
    /// Device rejected the subchannel
    Error,
}

impl IrqState {
    /// Only shutdown and free remain legal
    pub fn is_dead(self) -> bool {
        matches!(self, IrqState::Stopped | IrqState::Error | IrqState::Cleanup)
    }

    /// Context may be destroyed
    pub fn can_free(self) -> bool {
        matches!(self, IrqState::Inactive | IrqState::Stopped | IrqState::Error)
    }
}

/// Input to the lifecycle state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Device acknowledged the establish request
    EstablishAcked,
    /// Device rejected the establish request or never answered
    EstablishRejected,
    /// Activate request accepted
    Activated,
    /// Device status on a running subchannel
    ActivationFailed,
    /// Channel status on a running subchannel
    DeviceError,
    /// Shutdown requested
    ShutdownStarted,
    /// Halt or clear sent to the device
    CleanupIssued,
    /// Halt or clear finished (or timed out)
    CleanupCompleted,
}

/// Next state for `event` in `state`.
pub fn transition(state: IrqState, event: LifecycleEvent) -> QdioResult<IrqState> {
    use IrqState::*;
    use LifecycleEvent::*;

    let next = match (state, event) {
        (Inactive, EstablishAcked) => Established,
        (Inactive, EstablishRejected) => Error,
        (Established, Activated) => Active,
        (Established | Active, ActivationFailed) => Stopped,
        (Established | Active, DeviceError) => Error,
        (Established | Active | Stopped | Error, ShutdownStarted) => Stopped,
        (Stopped, CleanupIssued) => Cleanup,
        (Cleanup, CleanupCompleted) => Stopped,
        (state, event) => {
            return Err(QdioError::InvalidState {
                op: event.name(),
                state,
            })
        }
    };
    Ok(next)
}

impl LifecycleEvent {
    fn name(self) -> &'static str {
        match self {
            LifecycleEvent::EstablishAcked => "establish-ack",
            LifecycleEvent::EstablishRejected => "establish-nack",
            LifecycleEvent::Activated => "activate",
            LifecycleEvent::ActivationFailed => "activation-check",
            LifecycleEvent::DeviceError => "device-error",
            LifecycleEvent::ShutdownStarted => "shutdown",
            LifecycleEvent::CleanupIssued => "cleanup",
            LifecycleEvent::CleanupCompleted => "cleanup-done",
        }
    }
}

/// Lifecycle state with change notification
pub(crate) struct StateCell {
    state: Mutex<IrqState>,
    changed: Condvar,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(IrqState::Inactive),
            changed: Condvar::new(),
        }
    }

    #[inline]
    pub fn get(&self) -> IrqState {
        *self.state.lock()
    }

    /// Apply `event`, returning the previous and the new state
    pub fn apply(&self, event: LifecycleEvent) -> QdioResult<(IrqState, IrqState)> {
        let mut state = self.state.lock();
        let prev = *state;
        let next = transition(prev, event)?;
        *state = next;
        drop(state);

        if prev != next {
            tracing::info!(from = ?prev, to = ?next, ?event, "subchannel state change");
            self.changed.notify_all();
        }
        Ok((prev, next))
    }

    /// Apply `event` only if the current state is `expected`
    pub fn apply_if(&self, expected: IrqState, event: LifecycleEvent) -> Option<IrqState> {
        let mut state = self.state.lock();
        if *state != expected {
            return None;
        }
        let next = transition(expected, event).ok()?;
        *state = next;
        drop(state);

        if expected != next {
            tracing::info!(from = ?expected, to = ?next, ?event, "subchannel state change");
            self.changed.notify_all();
        }
        Some(next)
    }

    /// Force a state outside the transition table (teardown only)
    pub fn reset(&self, to: IrqState) {
        *self.state.lock() = to;
        self.changed.notify_all();
    }

    /// Block while `pred` holds, at most `timeout`. Returns the final state
    /// and whether `pred` still held when the wait ended.
    pub fn wait_while(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(IrqState) -> bool,
    ) -> (IrqState, bool) {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while pred(*state) {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return (*state, pred(*state));
            }
        }
        (*state, false)
    }
}
