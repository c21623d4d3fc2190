//! Buffer State Store
//!
//! Reads and writes runs of slot states, either directly on the shared ring
//! or through the device's batched state operations.
//!
//! # Batched completion codes
//!
//! | ccq | Meaning | Action |
//! |-----|---------|--------|
//! | 0, 32 | done | return progress |
//! | 96 | interrupted with progress | reissue for the remainder |
//! | 97 | interrupted without progress | reissue unchanged (bounded) |
//! | other | fatal | report, return zero progress |

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;

use crate::channel::{
    BatchOp, BatchResult, ChannelIo, SubchannelToken, CCQ_DONE, CCQ_DONE_PARTIAL_STATE, CCQ_NO_PROGRESS,
    CCQ_PARTIAL,
};
use crate::error::{ErrorFlags, QdioError};
use crate::queue::Queue;
use crate::slsb::Slsb;
use crate::{add_buf, next_buf, QDIO_MAX_BUFFERS_PER_Q};

/// Batched state operation the device refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateFault {
    /// Completion qualifier, `None` when the retry budget ran out
    pub ccq: Option<u8>,
    /// Error bit to report to the queue handler
    pub flag: ErrorFlags,
}

impl From<StateFault> for QdioError {
    fn from(fault: StateFault) -> Self {
        let op = if fault.flag.contains(ErrorFlags::GET_BUF_STATE) {
            "get-buffer-state"
        } else {
            "set-buffer-state"
        };
        QdioError::Io {
            op,
            cc: fault.ccq.unwrap_or(CCQ_NO_PROGRESS),
        }
    }
}

/// Access path to slot states
pub struct StateStore {
    io: Arc<dyn ChannelIo>,
    token: SubchannelToken,
    fast_path: AtomicBool,
    retry_limit: u32,
}

impl StateStore {
    /// Create a store; `fast_path` selects batched device operations
    pub fn new(io: Arc<dyn ChannelIo>, token: SubchannelToken, fast_path: bool, retry_limit: u32) -> Self {
        Self {
            io,
            token,
            fast_path: AtomicBool::new(fast_path),
            retry_limit: retry_limit.max(1),
        }
    }

    /// Batched path in use
    pub fn fast_path(&self) -> bool {
        self.fast_path.load(Ordering::Relaxed)
    }

    /// Switch paths once the device reported its capabilities
    pub fn set_fast_path(&self, enabled: bool) {
        self.fast_path.store(enabled, Ordering::Relaxed);
    }

    /// Count the slots from `start` sharing one state, up to `max_count`.
    ///
    /// Returns the run length and its state. A device-owned first slot ends
    /// the run immediately.
    pub fn read_states(
        &self,
        q: &Queue,
        start: usize,
        max_count: usize,
        auto_ack: bool,
    ) -> Result<(usize, Slsb), StateFault> {
        let max_count = max_count.min(QDIO_MAX_BUFFERS_PER_Q);
        if self.fast_path() {
            return self.extract_batched(q, start, max_count, auto_ack);
        }

        let slsb = q.slsb();
        let first = Slsb(slsb[start].load(Ordering::Acquire));
        if first.is_device_owned() || max_count <= 1 {
            return Ok((1, first));
        }

        let mut bufnr = start;
        let mut count = 1;
        while count < max_count {
            bufnr = next_buf(bufnr);
            if slsb[bufnr].load(Ordering::Acquire) != first.0 {
                break;
            }
            count += 1;
        }
        Ok((count, first))
    }

    /// State of a single slot
    pub fn read_state(&self, q: &Queue, bufnr: usize) -> Result<Slsb, StateFault> {
        self.read_states(q, bufnr, 1, false).map(|(_, state)| state)
    }

    /// Set `count` slots from `start` (wrapping) to `state`.
    pub fn write_states(
        &self,
        q: &Queue,
        start: usize,
        state: Slsb,
        count: usize,
    ) -> Result<usize, StateFault> {
        let count = count.min(QDIO_MAX_BUFFERS_PER_Q);
        if count == 0 {
            return Ok(0);
        }
        if self.fast_path() {
            return self.set_batched(q, start, state, count);
        }

        let slsb = q.slsb();
        fence(Ordering::SeqCst);
        for i in 0..count {
            slsb[add_buf(start, i)].swap(state.0, Ordering::SeqCst);
        }
        fence(Ordering::SeqCst);
        Ok(count)
    }

    /// Set a single slot
    pub fn write_state(&self, q: &Queue, bufnr: usize, state: Slsb) -> Result<usize, StateFault> {
        self.write_states(q, bufnr, state, 1)
    }

    fn extract_batched(
        &self,
        q: &Queue,
        start: usize,
        count: usize,
        auto_ack: bool,
    ) -> Result<(usize, Slsb), StateFault> {
        let mut done = 0;
        let mut state = None;

        while done < count {
            // a reissue must not extract (and ack) a run of another state
            if let Some(s) = state {
                let next = Slsb(q.slsb()[add_buf(start, done)].load(Ordering::Acquire));
                if next != s {
                    tracing::debug!(
                        queue = q.nr(),
                        done,
                        expected = ?s,
                        found = ?next,
                        "batch extract stopped at state boundary"
                    );
                    break;
                }
            }
            let op = BatchOp::Extract {
                direction: q.direction(),
                queue: q.nr(),
                start: add_buf(start, done),
                count: count - done,
                auto_ack,
            };
            let result = self.issue(q, op, ErrorFlags::GET_BUF_STATE)?;
            let progress = (count - done).saturating_sub(result.remaining);

            if progress > 0 {
                match state {
                    None => state = Some(result.state),
                    Some(s) if s != result.state => {
                        // changed under us after the boundary check
                        tracing::warn!(
                            queue = q.nr(),
                            start = add_buf(start, done),
                            lost = progress,
                            state = ?result.state,
                            "batch extract crossed a state change"
                        );
                        break;
                    }
                    Some(_) => {}
                }
                done += progress;
            }
            if result.ccq != CCQ_PARTIAL || progress == 0 {
                break;
            }
            q.stats.record_batch_partial();
            tracing::debug!(
                queue = q.nr(),
                done,
                remaining = result.remaining,
                "batch extract partial, reissuing"
            );
        }

        match state {
            Some(state) => Ok((done, state)),
            // no progress: report the device-owned first slot as-is
            None => Ok((0, Slsb(q.slsb()[start].load(Ordering::Acquire)))),
        }
    }

    fn set_batched(
        &self,
        q: &Queue,
        start: usize,
        state: Slsb,
        count: usize,
    ) -> Result<usize, StateFault> {
        let mut done = 0;
        while done < count {
            let op = BatchOp::Set {
                direction: q.direction(),
                queue: q.nr(),
                start: add_buf(start, done),
                count: count - done,
                state,
            };
            let result = self.issue(q, op, ErrorFlags::SET_BUF_STATE)?;
            let progress = (count - done).saturating_sub(result.remaining);
            done += progress;

            if result.ccq != CCQ_PARTIAL || progress == 0 {
                break;
            }
            q.stats.record_batch_partial();
        }
        Ok(done)
    }

    /// Issue one batched op, retrying the "no progress" code a bounded
    /// number of times.
    fn issue(
        &self,
        q: &Queue,
        op: BatchOp,
        flag: ErrorFlags,
    ) -> Result<BatchResult, StateFault> {
        let backoff = Backoff::new();
        for _ in 0..self.retry_limit {
            let result = self.io.batch_state_op(self.token, op);
            match result.ccq {
                CCQ_DONE | CCQ_DONE_PARTIAL_STATE | CCQ_PARTIAL => return Ok(result),
                CCQ_NO_PROGRESS => {
                    q.stats.record_batch_retry();
                    tracing::debug!(queue = q.nr(), ?op, "batch state op made no progress");
                    backoff.spin();
                }
                ccq => {
                    tracing::error!(
                        token = %self.token,
                        queue = q.nr(),
                        ccq,
                        ?op,
                        "batch state op failed"
                    );
                    return Err(StateFault {
                        ccq: Some(ccq),
                        flag,
                    });
                }
            }
        }

        tracing::error!(
            token = %self.token,
            queue = q.nr(),
            retries = self.retry_limit,
            ?op,
            "batch state op gave up without progress"
        );
        Err(StateFault { ccq: None, flag })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::QueuePool;
    use crate::channel::Capabilities;
    use crate::queue::{Direction, QueueSet};
    use crate::sim::{BatchScript, SimChannel};
    use proptest::prelude::*;

    fn direct_store() -> (StateStore, QueueSet) {
        let sim = Arc::new(SimChannel::new(Capabilities::SIGA_OUTPUT_NEEDED));
        let set = QueueSet::allocate(&QueuePool::unbounded(), 1, 1).unwrap();
        (StateStore::new(sim, SubchannelToken(1), false, 8), set)
    }

    fn batched_store() -> (Arc<SimChannel>, StateStore, QueueSet) {
        let sim = Arc::new(SimChannel::new(
            Capabilities::QEBSM_AVAILABLE | Capabilities::QEBSM_ENABLED,
        ));
        let set = QueueSet::allocate(&QueuePool::unbounded(), 1, 1).unwrap();
        sim.attach_queues(&set.records());
        let store = StateStore::new(sim.clone(), SubchannelToken(1), true, 4);
        (sim, store, set)
    }

    #[test]
    fn test_direct_read_run() {
        let (store, set) = direct_store();
        let q = set.get(Direction::Output, 0).unwrap();
        store.write_states(q, 4, Slsb::OUTPUT_EMPTY, 6).unwrap();

        let (count, state) = store.read_states(q, 4, 128, false).unwrap();
        assert_eq!((count, state), (6, Slsb::OUTPUT_EMPTY));

        let (count, _) = store.read_states(q, 4, 3, false).unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_direct_read_device_owned_bails() {
        let (store, set) = direct_store();
        let q = set.get(Direction::Input, 0).unwrap();
        store.write_states(q, 0, Slsb::CU_INPUT_EMPTY, 128).unwrap();

        let (count, state) = store.read_states(q, 0, 128, false).unwrap();
        assert_eq!(count, 1);
        assert!(state.is_device_owned());
    }

    #[test]
    fn test_direct_write_wraps() {
        let (store, set) = direct_store();
        let q = set.get(Direction::Output, 0).unwrap();
        assert_eq!(store.write_states(q, 126, Slsb::CU_OUTPUT_PENDING, 4).unwrap(), 4);

        assert_eq!(store.read_state(q, 127).unwrap(), Slsb::CU_OUTPUT_PENDING);
        assert_eq!(store.read_state(q, 1).unwrap(), Slsb::CU_OUTPUT_PENDING);
        assert_eq!(store.read_state(q, 2).unwrap(), Slsb::OUTPUT_NOT_INIT);
    }

    #[test]
    fn test_batched_partial_is_reissued() {
        let (sim, store, set) = batched_store();
        let q = set.get(Direction::Output, 0).unwrap();
        for i in 0..10 {
            q.slsb()[i].store(Slsb::OUTPUT_EMPTY.0, Ordering::SeqCst);
        }
        sim.script_batch(BatchScript {
            ccq: CCQ_PARTIAL,
            processed: 6,
        });

        let (count, state) = store.read_states(q, 0, 10, false).unwrap();
        assert_eq!(count, 10);
        assert_eq!(state, Slsb::OUTPUT_EMPTY);
        assert_eq!(sim.batch_calls(), 2);
        assert_eq!(q.stats.snapshot().batch_partial, 1);
    }

    #[test]
    fn test_batched_partial_stops_at_state_boundary() {
        let (sim, store, set) = batched_store();
        let q = set.get(Direction::Input, 0).unwrap();
        for i in 0..6 {
            q.slsb()[i].store(Slsb::INPUT_PRIMED.0, Ordering::SeqCst);
        }
        for i in 6..10 {
            q.slsb()[i].store(Slsb::INPUT_ERROR.0, Ordering::SeqCst);
        }
        sim.script_batch(BatchScript {
            ccq: CCQ_PARTIAL,
            processed: 6,
        });

        let (count, state) = store.read_states(q, 0, 10, true).unwrap();
        assert_eq!((count, state), (6, Slsb::INPUT_PRIMED));
        assert_eq!(sim.batch_calls(), 1);
        assert_eq!(store.read_state(q, 5).unwrap(), Slsb::INPUT_ACK);
        assert_eq!(store.read_state(q, 6).unwrap(), Slsb::INPUT_ERROR);

        // the error run is still there for the next scan
        let (count, state) = store.read_states(q, 6, 4, true).unwrap();
        assert_eq!((count, state), (4, Slsb::INPUT_ERROR));
    }

    #[test]
    fn test_batched_no_progress_retries() {
        let (sim, store, set) = batched_store();
        let q = set.get(Direction::Output, 0).unwrap();
        for i in 0..4 {
            q.slsb()[i].store(Slsb::OUTPUT_EMPTY.0, Ordering::SeqCst);
        }
        sim.script_batch(BatchScript { ccq: CCQ_NO_PROGRESS, processed: 0 });
        sim.script_batch(BatchScript { ccq: CCQ_NO_PROGRESS, processed: 0 });

        let (count, _) = store.read_states(q, 0, 4, false).unwrap();
        assert_eq!(count, 4);
        assert_eq!(sim.batch_calls(), 3);
        assert_eq!(q.stats.snapshot().batch_retries, 2);
    }

    #[test]
    fn test_batched_no_progress_is_bounded() {
        let (sim, store, set) = batched_store();
        let q = set.get(Direction::Output, 0).unwrap();
        for _ in 0..10 {
            sim.script_batch(BatchScript { ccq: CCQ_NO_PROGRESS, processed: 0 });
        }

        let fault = store.read_states(q, 0, 4, false).unwrap_err();
        assert_eq!(fault.ccq, None);
        assert_eq!(fault.flag, ErrorFlags::GET_BUF_STATE);
        assert_eq!(sim.batch_calls(), 4);
    }

    #[test]
    fn test_batched_fatal_code() {
        let (sim, store, set) = batched_store();
        let q = set.get(Direction::Output, 0).unwrap();
        sim.script_batch(BatchScript { ccq: 1, processed: 0 });

        let fault = store
            .write_states(q, 0, Slsb::CU_OUTPUT_PENDING, 4)
            .unwrap_err();
        assert_eq!(fault.ccq, Some(1));
        assert_eq!(fault.flag, ErrorFlags::SET_BUF_STATE);
        assert_eq!(store.read_state(q, 0).unwrap(), Slsb::OUTPUT_NOT_INIT);
    }

    #[test]
    fn test_batched_set_partial() {
        let (sim, store, set) = batched_store();
        let q = set.get(Direction::Output, 0).unwrap();
        sim.script_batch(BatchScript { ccq: CCQ_PARTIAL, processed: 2 });

        assert_eq!(store.write_states(q, 120, Slsb::CU_OUTPUT_PENDING, 10).unwrap(), 10);
        let (count, state) = store.read_states(q, 120, 10, false).unwrap();
        assert_eq!((count, state), (10, Slsb::CU_OUTPUT_PENDING));
    }

    proptest! {
        #[test]
        fn prop_read_never_exceeds_run(start in 0usize..128, run in 1usize..=128, max in 1usize..=128) {
            let (store, set) = direct_store();
            let q = set.get(Direction::Output, 0).unwrap();
            store.write_states(q, start, Slsb::OUTPUT_EMPTY, run).unwrap();

            let (count, state) = store.read_states(q, start, max, false).unwrap();
            prop_assert_eq!(state, Slsb::OUTPUT_EMPTY);
            prop_assert_eq!(count, run.min(max));
        }
    }
}
