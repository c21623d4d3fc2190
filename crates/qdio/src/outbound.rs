//! Outbound Engine
//!
//! Submission marks slots device-owned and decides whether the device has
//! to be told; the completion scan walks the ring from the cursor and
//! collects what the device consumed.

use crate::config::DeviceClass;
use crate::error::{ErrorFlags, QdioResult};
use crate::queue::{CompletionToken, Engine, Queue};
use crate::slsb::Slsb;
use crate::state_store::StateFault;
use crate::{add_buf, prev_buf, QDIO_MAX_BUFFERS_PER_Q};

/// How a submission reached the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kick {
    /// Notify-output rung
    Doorbell,
    /// Ring synchronized instead of notified
    Sync,
    /// Previous slot still pending, device picks the new ones up
    FastRequeue,
    /// Device needs no output doorbell
    NotNeeded,
}

/// Result of a submission
#[derive(Debug)]
pub(crate) struct Submitted {
    /// In-flight count after the submission
    pub used: usize,
    /// Signal path taken
    pub kick: Kick,
    /// Doorbell outcome; the slots stay submitted either way
    pub result: QdioResult<()>,
}

/// Completed output range
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Completed {
    pub start: usize,
    pub count: usize,
    pub error: ErrorFlags,
    pub tokens: Vec<CompletionToken>,
}

impl Completed {
    fn none(start: usize) -> Self {
        Self {
            start,
            count: 0,
            error: ErrorFlags::empty(),
            tokens: Vec::new(),
        }
    }
}

impl Queue {
    /// Hand `count` slots from `start` to the device.
    ///
    /// `token` is attached to the last slot of the range and comes back with
    /// its completion.
    pub(crate) fn submit(
        &self,
        eng: &Engine<'_>,
        start: usize,
        count: usize,
        token: Option<CompletionToken>,
    ) -> Result<Submitted, StateFault> {
        let last = add_buf(start, count - 1);
        self.set_token(last, token);

        let done = match eng.store.write_states(self, start, Slsb::CU_OUTPUT_PENDING, count) {
            Ok(done) => done,
            Err(fault) => {
                self.set_token(last, None);
                return Err(fault);
            }
        };
        let used = self.add_in_flight(done);
        if used == QDIO_MAX_BUFFERS_PER_Q {
            tracing::debug!(queue = self.nr(), "output queue full");
        }

        let (kick, result) = if eng.config.device_class == DeviceClass::Iqdio {
            // one write per submission, many buffers at once
            (Kick::Doorbell, self.kick(eng, done > 1))
        } else if eng.caps.need_siga_sync() {
            (Kick::Sync, eng.bells.synchronize(0, self.mask(), &self.stats))
        } else if eng.config.fast_requeue
            && done < QDIO_MAX_BUFFERS_PER_Q
            && eng.store.read_state(self, prev_buf(start)) == Ok(Slsb::CU_OUTPUT_PENDING)
        {
            self.stats.record_fast_requeue();
            (Kick::FastRequeue, Ok(()))
        } else {
            (Kick::Doorbell, self.kick(eng, false))
        };

        let kick = match kick {
            Kick::Doorbell if !eng.caps.need_siga_out() => Kick::NotNeeded,
            kick => kick,
        };
        Ok(Submitted { used, kick, result })
    }

    fn kick(&self, eng: &Engine<'_>, multiple: bool) -> QdioResult<()> {
        if !eng.caps.need_siga_out() {
            return Ok(());
        }
        eng.bells.notify_output(self.mask(), multiple, &self.stats)
    }

    /// Collect the run of completed slots at the cursor.
    pub(crate) fn outbound_scan(&self, eng: &Engine<'_>) -> Result<Completed, StateFault> {
        if eng.caps.need_siga_sync()
            && (eng.config.device_class == DeviceClass::Iqdio || !eng.config.output_pci)
        {
            if let Err(e) = eng.bells.synchronize(0, self.mask(), &self.stats) {
                tracing::warn!(queue = self.nr(), error = %e, "output sync failed");
            }
        }

        let mut cur = self.cursor.lock();
        let start = cur.first_to_check;
        let used = self.in_flight();
        if used == 0 {
            return Ok(Completed::none(start));
        }
        self.stats.record_scan();

        let (count, state) = eng.store.read_states(self, start, used, false)?;
        if count == 0 {
            return Ok(Completed::none(start));
        }

        let error = match state {
            Slsb::OUTPUT_EMPTY => ErrorFlags::empty(),
            Slsb::OUTPUT_ERROR => self.buffer_error(eng, start, count),
            // not fetched yet, or never submitted
            Slsb::CU_OUTPUT_PENDING | Slsb::OUTPUT_NOT_INIT | Slsb::OUTPUT_HALTED => {
                return Ok(Completed::none(start))
            }
            other => {
                tracing::warn!(
                    queue = self.nr(),
                    index = start,
                    state = other.0,
                    "unexpected output buffer state"
                );
                return Ok(Completed::none(start));
            }
        };

        self.sub_in_flight(count);
        cur.first_to_check = add_buf(start, count);
        Ok(Completed {
            start,
            count,
            error,
            tokens: self.take_tokens(start, count),
        })
    }

    /// Nothing left on the device
    #[inline]
    pub(crate) fn outbound_done(&self) -> bool {
        self.in_flight() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::QueuePool;
    use crate::channel::{Capabilities, Doorbell, SubchannelToken};
    use crate::config::QdioConfig;
    use crate::doorbell::DoorbellPort;
    use crate::error::QdioError;
    use crate::queue::{Direction, QueueSet};
    use crate::sim::SimChannel;
    use crate::state_store::StateStore;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::time::Duration;

    struct Rig {
        sim: Arc<SimChannel>,
        store: StateStore,
        bells: DoorbellPort,
        config: QdioConfig,
        set: QueueSet,
    }

    impl Rig {
        fn new(caps: Capabilities, config: QdioConfig) -> Self {
            let sim = Arc::new(SimChannel::new(caps));
            let set = QueueSet::allocate(&QueuePool::unbounded(), 0, 1).unwrap();
            sim.attach_queues(&set.records());
            let token = SubchannelToken(2);
            Self {
                store: StateStore::new(sim.clone(), token, caps.fast_path(), 8),
                bells: DoorbellPort::new(sim.clone(), token, Duration::from_micros(100)),
                config,
                sim,
                set,
            }
        }

        fn engine(&self) -> Engine<'_> {
            Engine {
                store: &self.store,
                bells: &self.bells,
                caps: self.sim.current_capabilities(),
                config: &self.config,
            }
        }

        fn queue(&self) -> &Arc<Queue> {
            self.set.get(Direction::Output, 0).unwrap()
        }
    }

    #[test]
    fn test_submit_rings_once() {
        let rig = Rig::new(Capabilities::SIGA_OUTPUT_NEEDED, QdioConfig::default());
        let sub = rig.queue().submit(&rig.engine(), 0, 8, None).unwrap();

        assert_eq!(sub.used, 8);
        assert_eq!(sub.kick, Kick::Doorbell);
        assert!(sub.result.is_ok());
        assert_eq!(rig.queue().in_flight(), 8);
        assert_eq!(
            rig.sim.doorbells(),
            vec![Doorbell::NotifyOutput { mask: 1 << 31, multiple: false }]
        );
    }

    #[test]
    fn test_fast_requeue_skips_doorbell() {
        let rig = Rig::new(Capabilities::SIGA_OUTPUT_NEEDED, QdioConfig::default());
        rig.queue().submit(&rig.engine(), 0, 4, None).unwrap();
        let sub = rig.queue().submit(&rig.engine(), 4, 4, None).unwrap();

        assert_eq!(sub.kick, Kick::FastRequeue);
        assert_eq!(rig.sim.doorbells().len(), 1);
        assert_eq!(rig.queue().stats.snapshot().fast_requeue, 1);
    }

    #[test]
    fn test_fast_requeue_disabled() {
        let config = QdioConfig {
            fast_requeue: false,
            ..Default::default()
        };
        let rig = Rig::new(Capabilities::SIGA_OUTPUT_NEEDED, config);
        rig.queue().submit(&rig.engine(), 0, 4, None).unwrap();
        let sub = rig.queue().submit(&rig.engine(), 4, 4, None).unwrap();

        assert_eq!(sub.kick, Kick::Doorbell);
        assert_eq!(rig.sim.doorbells().len(), 2);
    }

    #[test]
    fn test_sync_replaces_doorbell() {
        let rig = Rig::new(
            Capabilities::SIGA_OUTPUT_NEEDED | Capabilities::SIGA_SYNC_NEEDED,
            QdioConfig::default(),
        );
        let sub = rig.queue().submit(&rig.engine(), 0, 2, None).unwrap();
        assert_eq!(sub.kick, Kick::Sync);
        assert_eq!(
            rig.sim.doorbells(),
            vec![Doorbell::Sync { input_mask: 0, output_mask: 1 << 31 }]
        );
    }

    #[test]
    fn test_iqdio_uses_write_multiple() {
        let config = QdioConfig {
            device_class: DeviceClass::Iqdio,
            ..Default::default()
        };
        let rig = Rig::new(Capabilities::SIGA_OUTPUT_NEEDED, config);
        rig.queue().submit(&rig.engine(), 0, 3, None).unwrap();
        rig.queue().submit(&rig.engine(), 3, 1, None).unwrap();

        assert_eq!(
            rig.sim.doorbells(),
            vec![
                Doorbell::NotifyOutput { mask: 1 << 31, multiple: true },
                Doorbell::NotifyOutput { mask: 1 << 31, multiple: false },
            ]
        );
    }

    #[test]
    fn test_no_doorbell_when_not_needed() {
        let rig = Rig::new(Capabilities::empty(), QdioConfig::default());
        let sub = rig.queue().submit(&rig.engine(), 0, 1, None).unwrap();
        assert_eq!(sub.kick, Kick::NotNeeded);
        assert!(rig.sim.doorbells().is_empty());
    }

    #[test]
    fn test_busy_keeps_buffers_submitted() {
        let rig = Rig::new(Capabilities::SIGA_OUTPUT_NEEDED, QdioConfig::default());
        rig.sim.set_always_busy(true);
        let sub = rig.queue().submit(&rig.engine(), 0, 2, None).unwrap();

        assert!(matches!(sub.result, Err(QdioError::Busy { .. })));
        assert_eq!(rig.queue().in_flight(), 2);
    }

    #[test]
    fn test_scan_collects_completions_and_tokens() {
        let rig = Rig::new(Capabilities::SIGA_OUTPUT_NEEDED, QdioConfig::default());
        let q = rig.queue();
        q.submit(&rig.engine(), 0, 4, Some(CompletionToken(41))).unwrap();
        q.submit(&rig.engine(), 4, 4, Some(CompletionToken(42))).unwrap();

        assert_eq!(q.outbound_scan(&rig.engine()).unwrap().count, 0);

        rig.sim.complete_output(0, 0, 6);
        let done = q.outbound_scan(&rig.engine()).unwrap();
        assert_eq!((done.start, done.count), (0, 6));
        assert_eq!(done.tokens, vec![CompletionToken(41)]);
        assert_eq!(q.in_flight(), 2);

        rig.sim.complete_output(0, 6, 2);
        let done = q.outbound_scan(&rig.engine()).unwrap();
        assert_eq!((done.start, done.count), (6, 2));
        assert_eq!(done.tokens, vec![CompletionToken(42)]);
        assert!(q.outbound_done());
    }

    #[test]
    fn test_target_full_is_soft() {
        let config = QdioConfig {
            device_class: DeviceClass::Iqdio,
            ..Default::default()
        };
        let rig = Rig::new(Capabilities::SIGA_OUTPUT_NEEDED, config);
        let q = rig.queue();
        q.submit(&rig.engine(), 0, 1, None).unwrap();
        rig.sim.fail_output(0, 0, 1, true);

        let done = q.outbound_scan(&rig.engine()).unwrap();
        assert_eq!(done.error, ErrorFlags::SLSB_STATE | ErrorFlags::TARGET_FULL);
        assert!(done.error.is_soft());
        assert_eq!(q.stats.snapshot().target_full, 1);
    }

    #[test]
    fn test_hard_error_without_target_full() {
        let rig = Rig::new(Capabilities::SIGA_OUTPUT_NEEDED, QdioConfig::default());
        let q = rig.queue();
        q.submit(&rig.engine(), 0, 2, None).unwrap();
        rig.sim.fail_output(0, 0, 2, true);

        let done = q.outbound_scan(&rig.engine()).unwrap();
        assert_eq!(done.count, 2);
        assert_eq!(done.error, ErrorFlags::SLSB_STATE);
        assert_eq!(q.stats.snapshot().target_full, 0);
    }

    proptest! {
        #[test]
        fn prop_submit_scan_round_trip(
            start in 0usize..128,
            count in 1usize..=128,
            chunks in proptest::collection::vec(1usize..16, 1..32),
        ) {
            let rig = Rig::new(Capabilities::SIGA_OUTPUT_NEEDED, QdioConfig::default());
            let q = rig.queue();
            q.cursor.lock().first_to_check = start;
            q.submit(&rig.engine(), start, count, None).unwrap();

            let mut completed = 0;
            let mut next = start;
            let mut chunks = chunks.into_iter().cycle();
            while q.in_flight() > 0 {
                let n = chunks.next().unwrap().min(count - completed);
                rig.sim.complete_output(0, next, n);
                next = add_buf(next, n);
                let done = q.outbound_scan(&rig.engine()).unwrap();
                prop_assert!(done.count <= n);
                completed += done.count;
            }
            prop_assert_eq!(completed, count);
            prop_assert_eq!(q.first_to_check(), add_buf(start, count));
        }
    }
}
