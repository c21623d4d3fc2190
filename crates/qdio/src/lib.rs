//! Queued Direct I/O (QDIO) Engine
//!
//! Bidirectional shared-memory queues between a host driver and a channel
//! subsystem. Data moves without per-transfer register access: software and
//! device hand buffers back and forth by flipping one state byte per slot.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         SUBCHANNEL                               │
//! │                                                                  │
//! │   establish ──▶ activate ──▶ submit / poll ──▶ shutdown ──▶ free │
//! │                                                                  │
//! │  ┌──────────────────┐                 ┌──────────────────┐       │
//! │  │  Input Queue 0..n│                 │ Output Queue 0..n│       │
//! │  │  ┌────────────┐  │                 │  ┌────────────┐  │       │
//! │  │  │ state ring │  │                 │  │ state ring │  │       │
//! │  │  │ 128 slots  │  │                 │  │ 128 slots  │  │       │
//! │  │  └─────┬──────┘  │                 │  └─────┬──────┘  │       │
//! │  │  inbound engine  │                 │ outbound engine  │       │
//! │  └────────┬─────────┘                 └────────┬─────────┘       │
//! │           │        ┌──────────────────┐        │                 │
//! │           └───────▶│ buffer state     │◀───────┘                 │
//! │                    │ store + doorbell │                          │
//! │                    └────────┬─────────┘                          │
//! └─────────────────────────────┼────────────────────────────────────┘
//!                               ▼
//!                    ChannelIo (hardware or simulator)
//! ```
//!
//! # Key Properties
//!
//! 1. **In-order visibility**: slots are only interpreted from each queue's
//!    `first_to_check` cursor forward.
//! 2. **Bounded retries**: busy doorbells spin for a fixed patience window,
//!    batch state operations retry a fixed number of times.
//! 3. **Deferred completion work**: interrupts only schedule work; scans run
//!    on a per-queue worker with a fallback timer.
//! 4. **No globals**: every knob arrives through [`QdioConfig`].

#![warn(missing_docs)]

pub mod alloc;
pub mod channel;
pub mod config;
pub mod deferred;
pub mod doorbell;
pub mod error;
pub mod inbound;
pub mod lifecycle;
pub mod outbound;
pub mod queue;
pub mod ring;
pub mod sim;
pub mod slsb;
pub mod state_store;
pub mod stats;
pub mod subchannel;

pub use alloc::{PoolConfig, QueuePool};
pub use channel::{
    BatchOp, BatchResult, Capabilities, ChannelError, ChannelIo, Completion, ControlOp,
    ControlStatus, Doorbell, Interrupt, InterruptSink, QueueRecord, SubchannelToken,
};
pub use config::{DeviceClass, QdioConfig};
pub use error::{ErrorFlags, ErrorKind, QdioError, QdioResult};
pub use inbound::InboundBatch;
pub use lifecycle::{IrqState, LifecycleEvent};
pub use queue::{CompletionToken, Direction};
pub use ring::{Sbal, SbalElement};
pub use sim::{BatchScript, ControlPolicy, SimChannel};
pub use slsb::{BufferState, Slsb};
pub use stats::QueueStatsSnapshot;
pub use subchannel::{
    establish, EstablishParams, HandlerReport, QueueHandler, ShutdownMode, Subchannel,
    SyncDirection,
};

/// Slots per queue ring
pub const QDIO_MAX_BUFFERS_PER_Q: usize = 128;

/// Maximum queues per direction on one subchannel
pub const QDIO_MAX_QUEUES_PER_IRQ: usize = 4;

/// Elements in one buffer descriptor
pub const QDIO_MAX_ELEMENTS_PER_BUFFER: usize = 16;

const RING_MASK: usize = QDIO_MAX_BUFFERS_PER_Q - 1;

/// Slot `count` positions after `bufnr`, wrapping at the ring size.
#[inline(always)]
pub fn add_buf(bufnr: usize, count: usize) -> usize {
    (bufnr + count) & RING_MASK
}

/// Slot `count` positions before `bufnr`, wrapping at the ring size.
#[inline(always)]
pub fn sub_buf(bufnr: usize, count: usize) -> usize {
    (bufnr + QDIO_MAX_BUFFERS_PER_Q - (count & RING_MASK)) & RING_MASK
}

#[inline(always)]
pub(crate) fn next_buf(bufnr: usize) -> usize {
    add_buf(bufnr, 1)
}

#[inline(always)]
pub(crate) fn prev_buf(bufnr: usize) -> usize {
    sub_buf(bufnr, 1)
}

/// Whether `bufnr` lies inside the `count` slots starting at `start`.
#[inline]
pub fn buf_in_between(bufnr: usize, start: usize, count: usize) -> bool {
    let end = add_buf(start, count);
    if end > start {
        bufnr >= start && bufnr < end
    } else if end < start {
        bufnr >= start || bufnr < end
    } else {
        // full ring
        count != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_constants() {
        assert!(QDIO_MAX_BUFFERS_PER_Q.is_power_of_two());
        assert_eq!(QDIO_MAX_ELEMENTS_PER_BUFFER, 16);
    }

    #[test]
    fn test_ring_wrap() {
        assert_eq!(add_buf(127, 1), 0);
        assert_eq!(add_buf(120, 10), 2);
        assert_eq!(sub_buf(0, 1), 127);
        assert_eq!(prev_buf(0), 127);
        assert_eq!(next_buf(127), 0);
    }

    #[test]
    fn test_buf_in_between() {
        assert!(buf_in_between(5, 0, 8));
        assert!(!buf_in_between(8, 0, 8));
        assert!(buf_in_between(1, 126, 4));
        assert!(!buf_in_between(2, 126, 4));
        assert!(buf_in_between(77, 10, QDIO_MAX_BUFFERS_PER_Q));
        assert!(!buf_in_between(10, 10, 0));
    }

    proptest! {
        #[test]
        fn prop_add_sub_inverse(bufnr in 0usize..128, count in 0usize..=128) {
            prop_assert_eq!(sub_buf(add_buf(bufnr, count), count), bufnr);
        }

        #[test]
        fn prop_in_between_matches_walk(start in 0usize..128, count in 1usize..=128, slot in 0usize..128) {
            let walked = (0..count).any(|i| add_buf(start, i) == slot);
            prop_assert_eq!(buf_in_between(slot, start, count), walked);
        }
    }
}
