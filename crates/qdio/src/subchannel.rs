//! Subchannel
//!
//! The driver-facing context: owns the queues, runs the lifecycle, routes
//! interrupts and drives the per-queue deferred work.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use qdio::{establish, Capabilities, EstablishParams, HandlerReport, SimChannel, SubchannelToken};
//!
//! let sim = SimChannel::shared(Capabilities::SIGA_OUTPUT_NEEDED);
//! let params = EstablishParams::new(SubchannelToken(1), 0, 1)
//!     .with_output_handler(Arc::new(|report: &HandlerReport| {
//!         println!("{} buffers done", report.count);
//!     }));
//!
//! let subchannel = establish(sim.clone(), params).unwrap();
//! subchannel.activate().unwrap();
//! subchannel.submit(0, 0, 4, None).unwrap();
//!
//! sim.complete_output(0, 0, 4);
//! assert_eq!(subchannel.scan_completions(0).unwrap(), 4);
//! subchannel.free().unwrap();
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::alloc::QueuePool;
use crate::channel::{
    Capabilities, ChannelIo, ControlOp, ControlStatus, Interrupt, InterruptSink, SubchannelToken,
};
use crate::config::{DeviceClass, QdioConfig};
use crate::deferred::Deferred;
use crate::doorbell::DoorbellPort;
use crate::error::{ErrorFlags, QdioError, QdioResult};
use crate::inbound::InboundBatch;
use crate::lifecycle::{IrqState, LifecycleEvent, StateCell};
use crate::queue::{CompletionToken, Direction, Engine, Queue, QueueSet};
use crate::ring::Sbal;
use crate::state_store::{StateFault, StateStore};
use crate::stats::QueueStatsSnapshot;
use crate::QDIO_MAX_BUFFERS_PER_Q;

/// Range of buffers reported to a queue handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerReport {
    /// Queue direction
    pub direction: Direction,
    /// Queue number
    pub queue_nr: usize,
    /// First slot of the range
    pub start: usize,
    /// Slots in the range (zero for pure error reports)
    pub count: usize,
    /// Error bits for the range
    pub error: ErrorFlags,
    /// Completion tokens of the slots in the range
    pub tokens: Vec<CompletionToken>,
}

/// Driver callback for one direction
pub trait QueueHandler: Send + Sync {
    /// Buffers completed, failed, or the subchannel reported an error
    fn buffers_done(&self, report: &HandlerReport);

    /// Input data is waiting; called once until interrupts are re-enabled
    fn poll_ready(&self, queue_nr: usize) {
        let _ = queue_nr;
    }
}

impl<F> QueueHandler for F
where
    F: Fn(&HandlerReport) + Send + Sync,
{
    fn buffers_done(&self, report: &HandlerReport) {
        self(report)
    }
}

/// Parameters for [`establish`] and [`Subchannel::allocate`]
#[derive(Clone)]
pub struct EstablishParams {
    /// Subchannel token
    pub token: SubchannelToken,
    /// Input queues (at most 4)
    pub no_input_queues: usize,
    /// Output queues (at most 4)
    pub no_output_queues: usize,
    /// Callback for input queues
    pub input_handler: Option<Arc<dyn QueueHandler>>,
    /// Callback for output queues
    pub output_handler: Option<Arc<dyn QueueHandler>>,
    /// In-flight count that triggers an immediate completion scan, 0 = off
    pub scan_threshold: usize,
    /// Engine configuration
    pub config: QdioConfig,
    /// Ring storage pool, private unbounded pool when `None`
    pub pool: Option<Arc<QueuePool>>,
}

impl EstablishParams {
    /// Parameters with default configuration and no handlers
    pub fn new(token: SubchannelToken, no_input_queues: usize, no_output_queues: usize) -> Self {
        Self {
            token,
            no_input_queues,
            no_output_queues,
            input_handler: None,
            output_handler: None,
            scan_threshold: 0,
            config: QdioConfig::default(),
            pool: None,
        }
    }

    /// Set the input handler
    pub fn with_input_handler(mut self, handler: Arc<dyn QueueHandler>) -> Self {
        self.input_handler = Some(handler);
        self
    }

    /// Set the output handler
    pub fn with_output_handler(mut self, handler: Arc<dyn QueueHandler>) -> Self {
        self.output_handler = Some(handler);
        self
    }

    /// Set the completion scan threshold
    pub fn with_scan_threshold(mut self, threshold: usize) -> Self {
        self.scan_threshold = threshold;
        self
    }

    /// Set the engine configuration
    pub fn with_config(mut self, config: QdioConfig) -> Self {
        self.config = config;
        self
    }

    /// Allocate ring storage from `pool`
    pub fn with_pool(mut self, pool: Arc<QueuePool>) -> Self {
        self.pool = Some(pool);
        self
    }
}

/// How shutdown stops the subchannel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Let the device finish the current operation
    #[default]
    Halt,
    /// Discard outstanding work
    Clear,
}

/// Direction of a [`Subchannel::submit_or_reclaim`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDirection {
    /// Return processed input buffers to the device
    Input,
    /// Submit output buffers
    Output,
}

#[derive(Default)]
struct Setup {
    sink_registered: bool,
    torn_down: bool,
}

struct SubchannelInner {
    token: SubchannelToken,
    config: QdioConfig,
    io: Arc<dyn ChannelIo>,
    queues: QueueSet,
    state: StateCell,
    /// Serializes establish, activate and shutdown
    setup: Mutex<Setup>,
    caps: AtomicU8,
    store: StateStore,
    bells: DoorbellPort,
    input_handler: Option<Arc<dyn QueueHandler>>,
    output_handler: Option<Arc<dyn QueueHandler>>,
    scan_threshold: usize,
    /// Polling mode: data interrupts are suppressed
    irq_disabled: AtomicBool,
    output_work: Vec<Deferred>,
    input_work: Vec<Deferred>,
    me: Weak<SubchannelInner>,
}

/// One established device connection
pub struct Subchannel {
    inner: Arc<SubchannelInner>,
}

/// Allocate and establish a subchannel; on failure everything is released.
pub fn establish(io: Arc<dyn ChannelIo>, params: EstablishParams) -> QdioResult<Subchannel> {
    let subchannel = Subchannel::allocate(io, params)?;
    if let Err(e) = subchannel.establish() {
        if let Err(halt) = subchannel.shutdown(ShutdownMode::Halt) {
            tracing::warn!(token = %subchannel.token(), error = %halt, "cleanup after failed establish");
        }
        return Err(e);
    }
    Ok(subchannel)
}

fn check_range(start: usize, count: usize) -> QdioResult<()> {
    if start >= QDIO_MAX_BUFFERS_PER_Q {
        return Err(QdioError::InvalidArgument(format!("start {start} outside ring")));
    }
    if count == 0 || count > QDIO_MAX_BUFFERS_PER_Q {
        return Err(QdioError::InvalidArgument(format!(
            "count {count} not in 1..={QDIO_MAX_BUFFERS_PER_Q}"
        )));
    }
    Ok(())
}

/// Rescan window for devices that raise no output interrupts
const ZFCP_RESCAN: Duration = Duration::from_millis(1);

/// Device-owned slots must never be rewritten
fn check_capacity(q: &Queue, count: usize) -> QdioResult<()> {
    let used = q.in_flight();
    if used + count > QDIO_MAX_BUFFERS_PER_Q {
        return Err(QdioError::InvalidArgument(format!(
            "{count} buffers with {used} in flight overruns the ring"
        )));
    }
    Ok(())
}

fn not_active(op: &'static str, state: IrqState) -> QdioError {
    if state.is_dead() {
        QdioError::SubchannelDead(state)
    } else {
        QdioError::InvalidState { op, state }
    }
}

impl Subchannel {
    /// Allocate queues for a new, still inactive subchannel
    pub fn allocate(io: Arc<dyn ChannelIo>, params: EstablishParams) -> QdioResult<Self> {
        params.config.validate()?;
        if params.no_input_queues > 0 && params.input_handler.is_none() {
            return Err(QdioError::InvalidArgument("input queues need a handler".into()));
        }
        if params.no_output_queues > 0 && params.output_handler.is_none() {
            return Err(QdioError::InvalidArgument("output queues need a handler".into()));
        }
        if params.scan_threshold > QDIO_MAX_BUFFERS_PER_Q {
            return Err(QdioError::InvalidArgument(format!(
                "scan threshold {} exceeds ring size",
                params.scan_threshold
            )));
        }

        let pool = params.pool.clone().unwrap_or_else(QueuePool::unbounded);
        let queues = QueueSet::allocate(&pool, params.no_input_queues, params.no_output_queues)?;
        let token = params.token;
        let handler_mode = !params.config.inbound_polling;

        let mut spawn_error = None;
        let inner = Arc::new_cyclic(|me: &Weak<SubchannelInner>| {
            let mut units = |direction, n| {
                spawn_units(me, token, direction, n).unwrap_or_else(|e| {
                    spawn_error = Some(e);
                    Vec::new()
                })
            };
            let output_work = units(Direction::Output, params.no_output_queues);
            let input_work = if handler_mode {
                units(Direction::Input, params.no_input_queues)
            } else {
                Vec::new()
            };

            SubchannelInner {
                token,
                store: StateStore::new(io.clone(), token, false, params.config.batch_retry_limit),
                bells: DoorbellPort::new(io.clone(), token, params.config.busy_patience()),
                config: params.config,
                io,
                queues,
                state: StateCell::new(),
                setup: Mutex::new(Setup::default()),
                caps: AtomicU8::new(0),
                input_handler: params.input_handler,
                output_handler: params.output_handler,
                scan_threshold: params.scan_threshold,
                irq_disabled: AtomicBool::new(false),
                output_work,
                input_work,
                me: me.clone(),
            }
        });
        if let Some(e) = spawn_error {
            return Err(e);
        }

        tracing::info!(
            %token,
            inputs = params.no_input_queues,
            outputs = params.no_output_queues,
            class = ?inner.config.device_class,
            "subchannel allocated"
        );
        Ok(Self { inner })
    }

    /// Install the queues with the device and wait for its answer.
    pub fn establish(&self) -> QdioResult<()> {
        let inner = &self.inner;
        let mut setup = inner.setup.lock();
        let state = inner.state.get();
        if state != IrqState::Inactive || setup.torn_down {
            return Err(QdioError::InvalidState {
                op: "establish",
                state,
            });
        }

        inner.queues.reset();
        let sink: Weak<dyn InterruptSink> = inner.me.clone();
        inner.io.set_interrupt_sink(inner.token, Some(sink));
        setup.sink_registered = true;

        let op = ControlOp::Establish {
            queues: inner.queues.records(),
        };
        if let Err(e) = inner.io.start_control(inner.token, op) {
            tracing::error!(token = %inner.token, error = %e, "establish not started");
            inner.state.apply(LifecycleEvent::EstablishRejected)?;
            return Err(e.into());
        }

        let (state, timed_out) = inner
            .state
            .wait_while(inner.config.establish_timeout(), |s| s == IrqState::Inactive);
        if timed_out
            && inner
                .state
                .apply_if(IrqState::Inactive, LifecycleEvent::EstablishRejected)
                .is_some()
        {
            tracing::error!(token = %inner.token, "establish timed out");
            return Err(QdioError::Timeout("establish"));
        }
        let state = if timed_out { inner.state.get() } else { state };
        if state != IrqState::Established {
            tracing::error!(token = %inner.token, ?state, "establish rejected");
            return Err(QdioError::SubchannelDead(state));
        }

        let caps = inner.io.capabilities(inner.token)?;
        inner.caps.store(caps.bits(), Ordering::Release);
        inner.store.set_fast_path(caps.fast_path());
        tracing::info!(
            token = %inner.token,
            ?caps,
            fast_path = caps.fast_path(),
            "subchannel established"
        );
        Ok(())
    }

    /// Start data transfer. Only legal once established.
    pub fn activate(&self) -> QdioResult<()> {
        let inner = &self.inner;
        let _setup = inner.setup.lock();
        let state = inner.state.get();
        if state != IrqState::Established {
            return Err(not_active("activate", state));
        }

        inner.io.start_control(inner.token, ControlOp::Activate)?;
        thread::sleep(inner.config.activate_settle());

        match inner
            .state
            .apply_if(IrqState::Established, LifecycleEvent::Activated)
        {
            Some(_) => {
                tracing::info!(token = %inner.token, "subchannel active");
                Ok(())
            }
            None => {
                let state = inner.state.get();
                tracing::error!(token = %inner.token, ?state, "activation failed");
                Err(QdioError::SubchannelDead(state))
            }
        }
    }

    /// Submit output buffers or give input buffers back to the device
    pub fn submit_or_reclaim(
        &self,
        direction: SyncDirection,
        queue_nr: usize,
        start: usize,
        count: usize,
    ) -> QdioResult<()> {
        match direction {
            SyncDirection::Output => self.submit(queue_nr, start, count, None),
            SyncDirection::Input => self.reclaim(queue_nr, start, count),
        }
    }

    /// Hand `count` output buffers from `start` to the device.
    ///
    /// `token` comes back in the report covering the last buffer of the
    /// range. On a doorbell error the buffers stay submitted; submitting
    /// them again is harmless.
    pub fn submit(
        &self,
        queue_nr: usize,
        start: usize,
        count: usize,
        token: Option<CompletionToken>,
    ) -> QdioResult<()> {
        check_range(start, count)?;
        let inner = &self.inner;
        let q = inner.queues.get(Direction::Output, queue_nr)?;
        let state = inner.state.get();
        if state != IrqState::Active {
            return Err(not_active("submit", state));
        }
        check_capacity(q, count)?;

        let submitted = match q.submit(&inner.engine(), start, count, token) {
            Ok(submitted) => submitted,
            Err(fault) => {
                inner.report_fault(q, fault);
                return Err(fault.into());
            }
        };

        tracing::trace!(
            token = %inner.token,
            queue = queue_nr,
            start,
            count,
            used = submitted.used,
            kick = ?submitted.kick,
            "buffers submitted"
        );

        let unit = &inner.output_work[queue_nr];
        let threshold_hit = inner.scan_threshold > 0 && submitted.used >= inner.scan_threshold;
        if threshold_hit || submitted.result.is_err() {
            unit.schedule();
        } else if inner.state.get() == IrqState::Active
            && unit.arm_timer_if_idle(inner.config.submit_timer())
        {
            q.stats.record_timer_arm();
        }
        submitted.result
    }

    /// Give `count` processed input buffers from `start` back to the device
    pub fn reclaim(&self, queue_nr: usize, start: usize, count: usize) -> QdioResult<()> {
        check_range(start, count)?;
        let inner = &self.inner;
        let q = inner.queues.get(Direction::Input, queue_nr)?;
        let state = inner.state.get();
        if state != IrqState::Active {
            return Err(not_active("reclaim", state));
        }
        check_capacity(q, count)?;

        let eng = inner.engine();
        match q.reclaim(&eng, start, count) {
            Ok(true) => eng.bells.notify_input(q.mask(), &q.stats),
            Ok(false) => Ok(()),
            Err(fault) => {
                inner.report_fault(q, fault);
                Err(fault.into())
            }
        }
    }

    /// Fetch the next range of filled input buffers.
    ///
    /// Returns a zero count when nothing arrived; the queue is left as it
    /// was in that case.
    pub fn poll_inbound(&self, queue_nr: usize) -> QdioResult<InboundBatch> {
        let inner = &self.inner;
        let q = inner.queues.get(Direction::Input, queue_nr)?;
        let eng = inner.engine();

        q.sync_input(&eng);
        inner.kick_output_scans();

        let batch = match q.inbound_scan(&eng) {
            Ok(batch) => batch,
            Err(fault) => {
                inner.report_fault(q, fault);
                return Err(fault.into());
            }
        };
        if batch.count == 0 {
            return Ok(batch);
        }

        // buffers found on a dying subchannel must not be processed
        let state = inner.state.get();
        if state != IrqState::Active {
            return Err(not_active("poll_inbound", state));
        }
        Ok(batch)
    }

    /// Scan an output queue for completions and report them to the output
    /// handler. Returns the number of completed buffers.
    pub fn scan_completions(&self, queue_nr: usize) -> QdioResult<usize> {
        let inner = &self.inner;
        let q = inner.queues.get(Direction::Output, queue_nr)?;
        let state = inner.state.get();
        if state != IrqState::Active {
            return Err(not_active("scan_completions", state));
        }
        Ok(inner.outbound_process(q))
    }

    /// Release the acknowledgment held on an input queue
    pub fn stop_polling(&self, queue_nr: usize) -> QdioResult<()> {
        let inner = &self.inner;
        let q = inner.queues.get(Direction::Input, queue_nr)?;
        q.stop_polling(&inner.engine()).map_err(|fault| {
            inner.report_fault(q, fault);
            fault.into()
        })
    }

    /// Re-enable data interrupts after polling.
    ///
    /// Returns true if input arrived in the meantime. Interrupts then stay
    /// disabled and the caller must poll again.
    pub fn enable_interrupts(&self) -> bool {
        let inner = &self.inner;
        let eng = inner.engine();
        for q in &inner.queues.input {
            if let Err(fault) = q.stop_polling(&eng) {
                inner.report_fault(q, fault);
            }
        }
        inner.irq_disabled.store(false, Ordering::Release);

        // recheck, the device may have delivered while the ack was reset
        let pending = inner
            .queues
            .input
            .iter()
            .any(|q| !q.inbound_done(&eng, q.first_to_check()));
        if !pending {
            return false;
        }
        !inner.irq_disabled.swap(true, Ordering::AcqRel)
    }

    /// Suppress data interrupts. Returns false if they were already off.
    pub fn disable_interrupts(&self) -> bool {
        !self.inner.irq_disabled.swap(true, Ordering::AcqRel)
    }

    /// Stop the subchannel.
    ///
    /// Deferred work is disabled and waited for before the device is halted
    /// or cleared; the rings are reset afterwards. Calling it again is a
    /// no-op.
    pub fn shutdown(&self, mode: ShutdownMode) -> QdioResult<()> {
        let inner = &self.inner;
        let Some(mut setup) = inner.lock_setup_for_shutdown() else {
            tracing::debug!(token = %inner.token, "shutdown already in progress");
            return Ok(());
        };
        let state = inner.state.get();
        if setup.torn_down || (state == IrqState::Inactive && !setup.sink_registered) {
            return Ok(());
        }
        if state != IrqState::Inactive {
            inner.state.apply(LifecycleEvent::ShutdownStarted)?;
        }

        // nothing may be scheduled from here on
        for unit in inner.units() {
            unit.kill();
        }

        let rc = if state == IrqState::Inactive {
            Ok(())
        } else {
            inner.state.apply(LifecycleEvent::CleanupIssued)?;
            let op = match mode {
                ShutdownMode::Halt => ControlOp::Halt,
                ShutdownMode::Clear => ControlOp::Clear,
            };
            let rc = inner.io.start_control(inner.token, op);
            match &rc {
                Ok(()) => {
                    let (_, timed_out) = inner
                        .state
                        .wait_while(inner.config.cleanup_timeout(), |s| s == IrqState::Cleanup);
                    if timed_out {
                        tracing::warn!(token = %inner.token, ?mode, "cleanup not acknowledged");
                    }
                }
                Err(e) => tracing::error!(token = %inner.token, ?mode, error = %e, "cleanup not started"),
            }
            rc
        };

        inner.io.set_interrupt_sink(inner.token, None);
        setup.sink_registered = false;
        inner.queues.reset();
        inner.state.reset(IrqState::Stopped);
        setup.torn_down = true;
        tracing::info!(token = %inner.token, ?mode, "subchannel shut down");
        rc.map_err(Into::into)
    }

    /// Destroy the subchannel, shutting it down first if needed
    pub fn free(self) -> QdioResult<()> {
        if !self.state().can_free() {
            tracing::warn!(token = %self.token(), state = ?self.state(), "free on a running subchannel");
        }
        let rc = self.shutdown(ShutdownMode::Halt);
        tracing::info!(token = %self.token(), "subchannel freed");
        rc
    }

    /// Lifecycle state
    pub fn state(&self) -> IrqState {
        self.inner.state.get()
    }

    /// Subchannel token
    pub fn token(&self) -> SubchannelToken {
        self.inner.token
    }

    /// Engine configuration
    pub fn config(&self) -> &QdioConfig {
        &self.inner.config
    }

    /// Capabilities reported at establish
    pub fn capabilities(&self) -> Capabilities {
        self.inner.caps()
    }

    /// Batched state access in use
    pub fn has_fast_path(&self) -> bool {
        self.inner.store.fast_path()
    }

    /// Buffer descriptor of a slot
    pub fn buffer(&self, direction: Direction, queue_nr: usize, idx: usize) -> QdioResult<&Sbal> {
        self.inner
            .queues
            .get(direction, queue_nr)?
            .buffer(idx)
            .ok_or_else(|| QdioError::InvalidArgument(format!("buffer {idx} outside ring")))
    }

    /// Buffers currently owned by the device
    pub fn in_flight(&self, direction: Direction, queue_nr: usize) -> QdioResult<usize> {
        Ok(self.inner.queues.get(direction, queue_nr)?.in_flight())
    }

    /// Next slot the engine examines
    pub fn first_to_check(&self, direction: Direction, queue_nr: usize) -> QdioResult<usize> {
        Ok(self.inner.queues.get(direction, queue_nr)?.first_to_check())
    }

    /// Fallback timer of an output queue armed
    pub fn fallback_timer_pending(&self, queue_nr: usize) -> bool {
        self.inner
            .output_work
            .get(queue_nr)
            .is_some_and(|unit| unit.timer_pending())
    }

    /// Counters of one queue
    pub fn queue_stats(&self, direction: Direction, queue_nr: usize) -> QdioResult<QueueStatsSnapshot> {
        Ok(self.inner.queues.get(direction, queue_nr)?.stats.snapshot())
    }

    /// Counters of every queue, inputs first
    pub fn stats(&self) -> Vec<(Direction, usize, QueueStatsSnapshot)> {
        self.inner
            .queues
            .iter()
            .map(|q| (q.direction(), q.nr(), q.stats.snapshot()))
            .collect()
    }
}

impl Drop for Subchannel {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown(ShutdownMode::Halt) {
            tracing::warn!(token = %self.inner.token, error = %e, "shutdown on drop failed");
        }
    }
}

fn spawn_units(
    me: &Weak<SubchannelInner>,
    token: SubchannelToken,
    direction: Direction,
    count: usize,
) -> QdioResult<Vec<Deferred>> {
    (0..count)
        .map(|nr| {
            let weak = me.clone();
            let tag = match direction {
                Direction::Input => "in",
                Direction::Output => "out",
            };
            Deferred::spawn(format!("qdio-{token}-{tag}{nr}"), move || {
                if let Some(inner) = weak.upgrade() {
                    match direction {
                        Direction::Input => inner.inbound_work(nr),
                        Direction::Output => inner.outbound_work(nr),
                    }
                }
            })
        })
        .collect()
}

impl SubchannelInner {
    fn caps(&self) -> Capabilities {
        Capabilities::from_bits_truncate(self.caps.load(Ordering::Acquire))
    }

    fn engine(&self) -> Engine<'_> {
        Engine {
            store: &self.store,
            bells: &self.bells,
            caps: self.caps(),
            config: &self.config,
        }
    }

    fn units(&self) -> impl Iterator<Item = &Deferred> {
        self.output_work.iter().chain(self.input_work.iter())
    }

    /// A shutdown issued from a deferred worker must not block behind a
    /// shutdown that is waiting for that very worker.
    fn lock_setup_for_shutdown(&self) -> Option<MutexGuard<'_, Setup>> {
        if self.units().any(|unit| unit.on_worker()) {
            self.setup.try_lock()
        } else {
            Some(self.setup.lock())
        }
    }

    fn report(&self, q: &Queue, start: usize, count: usize, error: ErrorFlags, tokens: Vec<CompletionToken>) {
        let handler = match q.direction() {
            Direction::Input => &self.input_handler,
            Direction::Output => &self.output_handler,
        };
        q.stats.record_handler(count);
        if let Some(handler) = handler {
            handler.buffers_done(&HandlerReport {
                direction: q.direction(),
                queue_nr: q.nr(),
                start,
                count,
                error,
                tokens,
            });
        }
    }

    fn report_fault(&self, q: &Queue, fault: StateFault) {
        tracing::error!(
            token = %self.token,
            direction = ?q.direction(),
            queue = q.nr(),
            ccq = ?fault.ccq,
            "buffer state access failed"
        );
        self.report(q, q.first_to_check(), 0, fault.flag, Vec::new());
    }

    /// Scan, report and keep the fallback timer honest
    fn outbound_process(&self, q: &Queue) -> usize {
        let count = match q.outbound_scan(&self.engine()) {
            Ok(done) if done.count > 0 => {
                if self.state.get() == IrqState::Active {
                    self.report(q, done.start, done.count, done.error, done.tokens);
                }
                done.count
            }
            Ok(_) => 0,
            Err(fault) => {
                self.report_fault(q, fault);
                0
            }
        };

        let unit = &self.output_work[q.nr()];
        if q.outbound_done() {
            unit.cancel_timer();
            return count;
        }
        if self.config.device_class == DeviceClass::Zfcp && !self.config.output_pci {
            // no output interrupts: keep rescanning while buffers are out
            if self.state.get() == IrqState::Active && unit.arm_timer_within(ZFCP_RESCAN) {
                q.stats.record_timer_arm();
            }
            return count;
        }
        if self.config.output_pci {
            return count;
        }

        if self.state.get() == IrqState::Active
            && unit.arm_timer_if_idle(self.config.completion_timer())
        {
            q.stats.record_timer_arm();
        }
        count
    }

    fn outbound_work(&self, nr: usize) {
        let Some(q) = self.queues.output.get(nr) else {
            return;
        };
        q.stats.record_deferred_run();
        if self.state.get() != IrqState::Active {
            return;
        }
        self.outbound_process(q);
    }

    fn inbound_work(&self, nr: usize) {
        let Some(q) = self.queues.input.get(nr) else {
            return;
        };
        q.stats.record_deferred_run();
        if self.state.get() != IrqState::Active {
            return;
        }

        let eng = self.engine();
        q.sync_input(&eng);
        match q.inbound_scan(&eng) {
            Ok(batch) if batch.count > 0 => {
                self.report(q, batch.start, batch.count, batch.error, Vec::new())
            }
            Ok(_) => return,
            Err(fault) => {
                self.report_fault(q, fault);
                return;
            }
        }

        let unit = &self.input_work[nr];
        if !q.inbound_done(&eng, q.first_to_check()) && unit.schedule() {
            return;
        }
        if let Err(fault) = q.stop_polling(&eng) {
            self.report_fault(q, fault);
        }
        // the device may have filled a slot while the ack was reset
        if !q.inbound_done(&eng, q.first_to_check()) {
            unit.schedule();
        }
    }

    /// Output queues whose completions arrive by interrupt get a scan
    fn kick_output_scans(&self) {
        if !self.config.output_pci {
            return;
        }
        for (q, unit) in self.queues.output.iter().zip(&self.output_work) {
            if !q.outbound_done() {
                unit.schedule();
            }
        }
    }

    fn data_interrupt(&self) {
        if self.state.get() != IrqState::Active {
            return;
        }
        if self.config.output_pci {
            let eng = self.engine();
            let sync = eng.caps.need_siga_sync() && eng.caps.need_siga_sync_out_after_pci();
            for (q, unit) in self.queues.output.iter().zip(&self.output_work) {
                if sync && !q.outbound_done() {
                    if let Err(e) = eng.bells.synchronize(0, q.mask(), &q.stats) {
                        tracing::warn!(queue = q.nr(), error = %e, "output sync after interrupt failed");
                    }
                }
                unit.schedule();
            }
        }

        if !self.config.inbound_polling {
            for unit in &self.input_work {
                unit.schedule();
            }
            return;
        }
        if self.queues.input.is_empty() || self.irq_disabled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handler) = &self.input_handler {
            for q in &self.queues.input {
                handler.poll_ready(q.nr());
            }
        }
    }

    fn control_interrupt(&self, status: ControlStatus) {
        let state = self.state.get();
        match (state, status) {
            (IrqState::Inactive, ControlStatus::Ok) => {
                self.state
                    .apply_if(IrqState::Inactive, LifecycleEvent::EstablishAcked);
            }
            (IrqState::Inactive, ControlStatus::Failed { cstat, dstat }) => {
                tracing::error!(token = %self.token, cstat, dstat, "establish failed");
                self.state
                    .apply_if(IrqState::Inactive, LifecycleEvent::EstablishRejected);
            }
            (IrqState::Cleanup, status) => {
                if let ControlStatus::Failed { cstat, dstat } = status {
                    tracing::warn!(token = %self.token, cstat, dstat, "cleanup ended with error");
                }
                self.state
                    .apply_if(IrqState::Cleanup, LifecycleEvent::CleanupCompleted);
            }
            (IrqState::Established | IrqState::Active, ControlStatus::Failed { cstat, dstat }) => {
                self.activation_check(state, cstat, dstat);
            }
            (state, status) => {
                tracing::debug!(token = %self.token, ?state, ?status, "control interrupt ignored");
            }
        }
    }

    fn activation_check(&self, state: IrqState, cstat: u8, dstat: u8) {
        let event = if cstat != 0 {
            LifecycleEvent::DeviceError
        } else {
            LifecycleEvent::ActivationFailed
        };
        tracing::error!(token = %self.token, ?state, cstat, dstat, "activation check");
        if self.state.apply_if(state, event).is_none() {
            return;
        }

        let q = self.queues.input.first().or_else(|| self.queues.output.first());
        if let Some(q) = q {
            self.report(q, q.first_to_check(), 0, ErrorFlags::ACTIVATE, Vec::new());
        }
    }
}

impl InterruptSink for SubchannelInner {
    fn deliver(&self, irq: Interrupt) {
        match irq {
            Interrupt::Data => self.data_interrupt(),
            Interrupt::Control(status) => self.control_interrupt(status),
        }
    }
}
