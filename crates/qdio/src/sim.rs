//! Software Channel Subsystem
//!
//! [`SimChannel`] plays the device side of a subchannel: it keeps the rings
//! handed over at establish, answers doorbells, emulates the batched state
//! operations and delivers interrupts. Tests script its answers; the
//! device-side helpers move slots the way a real adapter would.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::add_buf;
use crate::channel::{
    BatchOp, BatchResult, Capabilities, ChannelError, ChannelIo, Completion, ControlOp,
    ControlStatus, Doorbell, Interrupt, InterruptSink, QueueRecord, SubchannelToken, CCQ_DONE,
    CCQ_DONE_PARTIAL_STATE,
};
use crate::queue::Direction;
use crate::ring::SBAL_SFLAGS_TARGET_FULL;
use crate::slsb::Slsb;

/// Completion qualifier for an operation on a queue the device never saw
const CCQ_UNKNOWN_QUEUE: u8 = 1;

/// How the simulated device answers a control operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPolicy {
    /// Complete immediately
    Ack,
    /// Fail immediately with the given status
    Nack {
        /// Channel status
        cstat: u8,
        /// Device status
        dstat: u8,
    },
    /// Never answer
    Silent,
    /// Complete from another thread after a delay
    Delayed(Duration),
}

/// Scripted answer for the next batched state operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchScript {
    /// Completion qualifier to report
    pub ccq: u8,
    /// Slots to actually process before reporting
    pub processed: usize,
}

struct SimState {
    caps: Capabilities,
    queues: Vec<QueueRecord>,
    sink: Option<Weak<dyn InterruptSink>>,
    token: Option<SubchannelToken>,
    establish: ControlPolicy,
    activate: ControlPolicy,
    cleanup: ControlPolicy,
    busy_budget: u32,
    always_busy: bool,
    forced_cc: Option<u8>,
    doorbells: Vec<Doorbell>,
    controls: Vec<&'static str>,
    batch_script: VecDeque<BatchScript>,
    batch_calls: usize,
}

/// Simulated channel subsystem for one subchannel
pub struct SimChannel {
    state: Mutex<SimState>,
}

impl SimChannel {
    /// Device reporting `caps`, acknowledging every control operation
    pub fn new(caps: Capabilities) -> Self {
        Self {
            state: Mutex::new(SimState {
                caps,
                queues: Vec::new(),
                sink: None,
                token: None,
                establish: ControlPolicy::Ack,
                activate: ControlPolicy::Ack,
                cleanup: ControlPolicy::Ack,
                busy_budget: 0,
                always_busy: false,
                forced_cc: None,
                doorbells: Vec::new(),
                controls: Vec::new(),
                batch_script: VecDeque::new(),
                batch_calls: 0,
            }),
        }
    }

    /// Shared handle, the form the engine takes a channel in
    pub fn shared(caps: Capabilities) -> Arc<Self> {
        Arc::new(Self::new(caps))
    }

    /// Replace the reported capabilities
    pub fn set_capabilities(&self, caps: Capabilities) {
        self.state.lock().caps = caps;
    }

    /// Capabilities the device currently reports
    pub fn current_capabilities(&self) -> Capabilities {
        self.state.lock().caps
    }

    /// Answer for establish requests
    pub fn set_establish_policy(&self, policy: ControlPolicy) {
        self.state.lock().establish = policy;
    }

    /// Answer for activate requests. `Ack` means the activation simply
    /// keeps running; only `Nack` produces an interrupt.
    pub fn set_activate_policy(&self, policy: ControlPolicy) {
        self.state.lock().activate = policy;
    }

    /// Answer for halt and clear requests
    pub fn set_cleanup_policy(&self, policy: ControlPolicy) {
        self.state.lock().cleanup = policy;
    }

    /// Report busy for the next `count` notify-output calls
    pub fn set_busy(&self, count: u32) {
        self.state.lock().busy_budget = count;
    }

    /// Report busy for every notify-output call
    pub fn set_always_busy(&self, busy: bool) {
        self.state.lock().always_busy = busy;
    }

    /// Answer every doorbell with `cc`
    pub fn force_doorbell_cc(&self, cc: Option<u8>) {
        self.state.lock().forced_cc = cc;
    }

    /// Queue a scripted answer for the next batched state operation
    pub fn script_batch(&self, script: BatchScript) {
        self.state.lock().batch_script.push_back(script);
    }

    /// Register rings without an establish request
    pub fn attach_queues(&self, queues: &[QueueRecord]) {
        self.state.lock().queues = queues.to_vec();
    }

    /// Doorbells received so far, busy retries included
    pub fn doorbells(&self) -> Vec<Doorbell> {
        self.state.lock().doorbells.clone()
    }

    /// Control operations received so far
    pub fn controls(&self) -> Vec<&'static str> {
        self.state.lock().controls.clone()
    }

    /// Batched state operations received so far
    pub fn batch_calls(&self) -> usize {
        self.state.lock().batch_calls
    }

    /// An interrupt sink is registered
    pub fn has_sink(&self) -> bool {
        self.state.lock().sink.is_some()
    }

    /// Write `state` into `count` slots from `start`
    pub fn set_slot_state(
        &self,
        direction: Direction,
        queue: usize,
        start: usize,
        count: usize,
        state: Slsb,
    ) {
        self.update_slots(direction, queue, start, count, |_| Some(state));
    }

    /// Deliver data into device-owned empty input slots. Returns the number
    /// of slots filled.
    pub fn fill_input(&self, queue: usize, start: usize, count: usize) -> usize {
        self.update_slots(Direction::Input, queue, start, count, |s| {
            (s == Slsb::CU_INPUT_EMPTY).then_some(Slsb::INPUT_PRIMED)
        })
    }

    /// Consume pending output slots. Returns the number completed.
    pub fn complete_output(&self, queue: usize, start: usize, count: usize) -> usize {
        self.update_slots(Direction::Output, queue, start, count, |s| {
            (s == Slsb::CU_OUTPUT_PENDING).then_some(Slsb::OUTPUT_EMPTY)
        })
    }

    /// Consume every pending output slot of `queue`
    pub fn complete_all_output(&self, queue: usize) -> usize {
        self.complete_output(queue, 0, crate::QDIO_MAX_BUFFERS_PER_Q)
    }

    /// Fail pending output slots, optionally flagging a full target
    pub fn fail_output(&self, queue: usize, start: usize, count: usize, target_full: bool) {
        let Some(record) = self.record(Direction::Output, queue) else {
            return;
        };
        for i in 0..count {
            let idx = add_buf(start, i);
            let sflags = if target_full { SBAL_SFLAGS_TARGET_FULL } else { 0 };
            record.buffers[idx].trailer().set_sflags(sflags);
        }
        self.update_slots(Direction::Output, queue, start, count, |s| {
            (s == Slsb::CU_OUTPUT_PENDING).then_some(Slsb::OUTPUT_ERROR)
        });
    }

    /// Raise an adapter interrupt
    pub fn raise_data_interrupt(&self) {
        self.deliver(Interrupt::Data);
    }

    /// Raise an error interrupt for the running subchannel
    pub fn raise_check(&self, cstat: u8, dstat: u8) {
        self.deliver(Interrupt::Control(ControlStatus::Failed { cstat, dstat }));
    }

    fn record(&self, direction: Direction, queue: usize) -> Option<QueueRecord> {
        self.state
            .lock()
            .queues
            .iter()
            .find(|r| r.direction == direction && r.nr == queue)
            .cloned()
    }

    fn update_slots(
        &self,
        direction: Direction,
        queue: usize,
        start: usize,
        count: usize,
        mut f: impl FnMut(Slsb) -> Option<Slsb>,
    ) -> usize {
        let Some(record) = self.record(direction, queue) else {
            tracing::warn!(?direction, queue, "simulated device has no such queue");
            return 0;
        };
        let slsb = record.page.slsb();
        let mut changed = 0;
        for i in 0..count {
            let slot = &slsb[add_buf(start, i)];
            if let Some(next) = f(Slsb(slot.load(Ordering::Acquire))) {
                slot.store(next.0, Ordering::Release);
                changed += 1;
            }
        }
        changed
    }

    fn deliver(&self, irq: Interrupt) {
        let sink = self.state.lock().sink.clone();
        if let Some(sink) = sink.and_then(|s| s.upgrade()) {
            sink.deliver(irq);
        }
    }

    fn answer(&self, policy: ControlPolicy, on_ack: Option<Interrupt>) {
        let irq = match policy {
            ControlPolicy::Ack => on_ack,
            ControlPolicy::Nack { cstat, dstat } => {
                Some(Interrupt::Control(ControlStatus::Failed { cstat, dstat }))
            }
            ControlPolicy::Silent => None,
            ControlPolicy::Delayed(delay) => {
                if let Some(irq) = on_ack {
                    let sink = self.state.lock().sink.clone();
                    thread::spawn(move || {
                        thread::sleep(delay);
                        if let Some(sink) = sink.and_then(|s| s.upgrade()) {
                            sink.deliver(irq);
                        }
                    });
                }
                None
            }
        };
        if let Some(irq) = irq {
            self.deliver(irq);
        }
    }

    fn extract(
        slsb: &[std::sync::atomic::AtomicU8],
        start: usize,
        count: usize,
        auto_ack: bool,
    ) -> (usize, Slsb) {
        let first = Slsb(slsb[start].load(Ordering::Acquire));
        let mut run = 1;
        while run < count && slsb[add_buf(start, run)].load(Ordering::Acquire) == first.0 {
            run += 1;
        }
        if auto_ack && first == Slsb::INPUT_PRIMED {
            for i in 0..run {
                slsb[add_buf(start, i)].store(Slsb::INPUT_ACK.0, Ordering::Release);
            }
        }
        (run, first)
    }
}

impl ChannelIo for SimChannel {
    fn doorbell(&self, _token: SubchannelToken, op: Doorbell) -> Completion {
        let mut st = self.state.lock();
        st.doorbells.push(op);

        if let Some(cc) = st.forced_cc {
            return Completion { cc, busy: false };
        }
        if let Doorbell::NotifyOutput { .. } = op {
            if st.always_busy {
                return Completion { cc: 2, busy: true };
            }
            if st.busy_budget > 0 {
                st.busy_budget -= 1;
                return Completion { cc: 2, busy: true };
            }
        }
        Completion::OK
    }

    fn batch_state_op(&self, _token: SubchannelToken, op: BatchOp) -> BatchResult {
        let (direction, queue, start, count) = match op {
            BatchOp::Extract { direction, queue, start, count, .. }
            | BatchOp::Set { direction, queue, start, count, .. } => (direction, queue, start, count),
        };

        let (script, record) = {
            let mut st = self.state.lock();
            st.batch_calls += 1;
            let record = st
                .queues
                .iter()
                .find(|r| r.direction == direction && r.nr == queue)
                .cloned();
            (st.batch_script.pop_front(), record)
        };

        let Some(record) = record else {
            return BatchResult {
                ccq: CCQ_UNKNOWN_QUEUE,
                remaining: count,
                state: Slsb::not_init(direction),
            };
        };
        let limit = script.map_or(count, |s| s.processed.min(count));
        let slsb = record.page.slsb();

        let (processed, state) = match op {
            _ if limit == 0 => (0, Slsb(slsb[start].load(Ordering::Acquire))),
            BatchOp::Extract { auto_ack, .. } => Self::extract(slsb, start, limit, auto_ack),
            BatchOp::Set { state, .. } => {
                for i in 0..limit {
                    slsb[add_buf(start, i)].store(state.0, Ordering::Release);
                }
                (limit, state)
            }
        };

        let ccq = match script {
            Some(s) => s.ccq,
            None if processed < count => CCQ_DONE_PARTIAL_STATE,
            None => CCQ_DONE,
        };
        BatchResult {
            ccq,
            remaining: count - processed,
            state,
        }
    }

    fn start_control(&self, token: SubchannelToken, op: ControlOp) -> Result<(), ChannelError> {
        let policy = {
            let mut st = self.state.lock();
            if st.token.is_some_and(|t| t != token) {
                return Err(ChannelError::UnknownSubchannel(token));
            }
            st.controls.push(op.name());
            match &op {
                ControlOp::Establish { queues } => {
                    st.queues = queues.clone();
                    st.establish
                }
                ControlOp::Activate => st.activate,
                ControlOp::Halt | ControlOp::Clear => st.cleanup,
            }
        };
        tracing::debug!(%token, op = op.name(), ?policy, "simulated control operation");

        let on_ack = match op {
            // activation keeps running until halted
            ControlOp::Activate => None,
            _ => Some(Interrupt::Control(ControlStatus::Ok)),
        };
        self.answer(policy, on_ack);
        Ok(())
    }

    fn capabilities(&self, token: SubchannelToken) -> Result<Capabilities, ChannelError> {
        let st = self.state.lock();
        if st.token.is_some_and(|t| t != token) {
            return Err(ChannelError::UnknownSubchannel(token));
        }
        Ok(st.caps)
    }

    fn set_interrupt_sink(&self, token: SubchannelToken, sink: Option<Weak<dyn InterruptSink>>) {
        let mut st = self.state.lock();
        st.token = sink.as_ref().map(|_| token);
        st.sink = sink;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::QueuePool;
    use crate::queue::QueueSet;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink(AtomicUsize);

    impl InterruptSink for CountingSink {
        fn deliver(&self, _irq: Interrupt) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_establish_registers_rings() {
        let sim = SimChannel::new(Capabilities::empty());
        let set = QueueSet::allocate(&QueuePool::unbounded(), 1, 1).unwrap();
        sim.start_control(
            SubchannelToken(1),
            ControlOp::Establish {
                queues: set.records(),
            },
        )
        .unwrap();

        sim.set_slot_state(Direction::Input, 0, 0, 2, Slsb::CU_INPUT_EMPTY);
        assert_eq!(sim.fill_input(0, 0, 4), 2);
        assert_eq!(sim.controls(), vec!["establish"]);
    }

    #[test]
    fn test_extract_auto_ack() {
        let sim = SimChannel::new(Capabilities::empty());
        let set = QueueSet::allocate(&QueuePool::unbounded(), 1, 0).unwrap();
        sim.attach_queues(&set.records());
        sim.set_slot_state(Direction::Input, 0, 126, 3, Slsb::INPUT_PRIMED);

        let result = sim.batch_state_op(
            SubchannelToken(1),
            BatchOp::Extract {
                direction: Direction::Input,
                queue: 0,
                start: 126,
                count: 8,
                auto_ack: true,
            },
        );
        assert_eq!(result.state, Slsb::INPUT_PRIMED);
        assert_eq!(result.remaining, 5);
        assert_eq!(result.ccq, CCQ_DONE_PARTIAL_STATE);

        let q = set.get(Direction::Input, 0).unwrap();
        assert_eq!(q.slsb()[0].load(Ordering::SeqCst), Slsb::INPUT_ACK.0);
    }

    #[test]
    fn test_unknown_queue() {
        let sim = SimChannel::new(Capabilities::empty());
        let result = sim.batch_state_op(
            SubchannelToken(1),
            BatchOp::Set {
                direction: Direction::Output,
                queue: 3,
                start: 0,
                count: 4,
                state: Slsb::OUTPUT_EMPTY,
            },
        );
        assert_eq!(result.ccq, CCQ_UNKNOWN_QUEUE);
        assert_eq!(result.remaining, 4);
    }

    #[test]
    fn test_control_policies() {
        let sim = SimChannel::new(Capabilities::empty());
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        let weak: Weak<dyn InterruptSink> = Arc::downgrade(&sink) as Weak<CountingSink>;
        sim.set_interrupt_sink(SubchannelToken(5), Some(weak));

        sim.start_control(SubchannelToken(5), ControlOp::Halt).unwrap();
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);

        sim.start_control(SubchannelToken(5), ControlOp::Activate).unwrap();
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);

        sim.set_cleanup_policy(ControlPolicy::Silent);
        sim.start_control(SubchannelToken(5), ControlOp::Clear).unwrap();
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);

        assert_eq!(
            sim.start_control(SubchannelToken(6), ControlOp::Halt),
            Err(ChannelError::UnknownSubchannel(SubchannelToken(6)))
        );

        sim.set_interrupt_sink(SubchannelToken(5), None);
        sim.raise_data_interrupt();
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
        assert!(!sim.has_sink());
    }
}
