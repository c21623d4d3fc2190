//! Queues
//!
//! A queue couples a shared state ring with the driver's buffer descriptors
//! and the software cursor that walks the ring.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::alloc::{PooledPage, QueuePool};
use crate::channel::{Capabilities, QueueRecord};
use crate::config::{DeviceClass, QdioConfig};
use crate::doorbell::DoorbellPort;
use crate::error::{ErrorFlags, QdioError, QdioResult};
use crate::ring::{Sbal, SBAL_SFLAGS_TARGET_FULL};
use crate::slsb::Slsb;
use crate::state_store::StateStore;
use crate::stats::QueueStats;
use crate::{QDIO_MAX_BUFFERS_PER_Q, QDIO_MAX_QUEUES_PER_IRQ};

/// Queue direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Device to program
    Input,
    /// Program to device
    Output,
}

/// Opaque value a driver attaches to submitted output buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionToken(pub u64);

/// Outstanding input acknowledgment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct AckState {
    /// Some slots are held back as acknowledged
    pub polling: bool,
    /// First acknowledged slot
    pub start: usize,
    /// Acknowledged slots (batched path only; the direct path keeps one)
    pub count: usize,
}

/// Software cursor over a ring
#[derive(Debug, Default)]
pub(crate) struct Cursor {
    /// Next slot to examine
    pub first_to_check: usize,
    /// Input acknowledgment tracking
    pub ack: AckState,
}

/// Subchannel parts the queue engines work with
pub(crate) struct Engine<'a> {
    pub store: &'a StateStore,
    pub bells: &'a DoorbellPort,
    pub caps: Capabilities,
    pub config: &'a QdioConfig,
}

/// One input or output queue
pub struct Queue {
    direction: Direction,
    nr: usize,
    page: Arc<PooledPage>,
    buffers: Arc<[Sbal]>,
    tokens: Box<[AtomicU64]>,
    /// Buffers owned by the device
    nr_buf_used: CachePadded<AtomicUsize>,
    pub(crate) cursor: Mutex<Cursor>,
    pub(crate) stats: QueueStats,
}

impl Queue {
    fn new(direction: Direction, nr: usize, page: PooledPage) -> Self {
        let buffers: Arc<[Sbal]> = (0..QDIO_MAX_BUFFERS_PER_Q).map(|_| Sbal::default()).collect();
        for (entry, sbal) in page.storage_list().iter().zip(buffers.iter()) {
            entry.store(sbal.addr(), Ordering::Relaxed);
        }
        let tokens = (0..QDIO_MAX_BUFFERS_PER_Q).map(|_| AtomicU64::new(0)).collect();

        Self {
            direction,
            nr,
            page: Arc::new(page),
            buffers,
            tokens,
            nr_buf_used: CachePadded::new(AtomicUsize::new(0)),
            cursor: Mutex::new(Cursor::default()),
            stats: QueueStats::default(),
        }
    }

    /// Queue direction
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Queue number within its direction
    pub fn nr(&self) -> usize {
        self.nr
    }

    /// Doorbell mask selecting this queue
    pub fn mask(&self) -> u32 {
        1 << (31 - self.nr)
    }

    /// State byte ring
    #[inline(always)]
    pub(crate) fn slsb(&self) -> &[std::sync::atomic::AtomicU8] {
        self.page.slsb()
    }

    /// Buffer descriptor of slot `idx`
    pub fn buffer(&self, idx: usize) -> Option<&Sbal> {
        self.buffers.get(idx)
    }

    /// Buffers currently owned by the device
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.nr_buf_used.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn add_in_flight(&self, count: usize) -> usize {
        self.nr_buf_used.fetch_add(count, Ordering::AcqRel) + count
    }

    #[inline]
    pub(crate) fn sub_in_flight(&self, count: usize) -> usize {
        let prev = self
            .nr_buf_used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(count))
            })
            .unwrap_or_default();
        if prev < count {
            tracing::error!(
                queue = self.nr,
                in_flight = prev,
                count,
                "in-flight count underflow"
            );
        }
        prev.saturating_sub(count)
    }

    pub(crate) fn set_token(&self, idx: usize, token: Option<CompletionToken>) {
        self.tokens[idx].store(token.map_or(0, |t| t.0), Ordering::Relaxed);
    }

    pub(crate) fn take_tokens(&self, start: usize, count: usize) -> Vec<CompletionToken> {
        (0..count)
            .filter_map(|i| {
                let v = self.tokens[crate::add_buf(start, i)].swap(0, Ordering::Relaxed);
                (v != 0).then_some(CompletionToken(v))
            })
            .collect()
    }

    /// Next slot the engine will examine
    pub fn first_to_check(&self) -> usize {
        self.cursor.lock().first_to_check
    }

    /// Account for slots the device marked failed and hand them back.
    ///
    /// A full target on an internal network device is expected
    /// back-pressure and only logged at debug level.
    pub(crate) fn buffer_error(&self, eng: &Engine<'_>, start: usize, count: usize) -> ErrorFlags {
        let mut error = ErrorFlags::SLSB_STATE;
        self.stats.record_error(count);

        let target_full = self.direction == Direction::Output
            && eng.config.device_class == DeviceClass::Iqdio
            && self.buffers[start].trailer().sflags() == SBAL_SFLAGS_TARGET_FULL;
        if target_full {
            self.stats.record_target_full();
            error |= ErrorFlags::TARGET_FULL;
            tracing::debug!(queue = self.nr, start, "output target full");
        } else {
            tracing::error!(
                direction = ?self.direction,
                queue = self.nr,
                start,
                count,
                sflags = self.buffers[start].trailer().sflags(),
                "device reported buffer error"
            );
        }

        // the device stays quiet while the error is present
        if let Err(fault) = eng.store.write_states(self, start, Slsb::not_init(self.direction), count) {
            error |= fault.flag;
        }
        error
    }

    /// Registration record for the establish request
    pub(crate) fn record(&self) -> QueueRecord {
        QueueRecord {
            direction: self.direction,
            nr: self.nr,
            page: Arc::clone(&self.page),
            buffers: Arc::clone(&self.buffers),
        }
    }

    /// Put every slot back to "not in use" and reset the cursor
    pub(crate) fn reset(&self) {
        let pattern = Slsb::not_init(self.direction);
        std::sync::atomic::fence(Ordering::SeqCst);
        for slot in self.slsb() {
            slot.store(pattern.0, Ordering::Relaxed);
        }
        std::sync::atomic::fence(Ordering::SeqCst);
        for token in self.tokens.iter() {
            token.store(0, Ordering::Relaxed);
        }
        self.nr_buf_used.store(0, Ordering::Release);
        *self.cursor.lock() = Cursor::default();
    }
}

/// All queues of one subchannel
pub struct QueueSet {
    pub(crate) input: Vec<Arc<Queue>>,
    pub(crate) output: Vec<Arc<Queue>>,
}

impl QueueSet {
    /// Allocate `no_input` input and `no_output` output queues from `pool`.
    ///
    /// Either every queue is allocated or none is: on failure the pages
    /// taken so far return to the pool before the error is reported.
    pub fn allocate(pool: &Arc<QueuePool>, no_input: usize, no_output: usize) -> QdioResult<Self> {
        if no_input > QDIO_MAX_QUEUES_PER_IRQ || no_output > QDIO_MAX_QUEUES_PER_IRQ {
            return Err(QdioError::InvalidArgument(format!(
                "at most {QDIO_MAX_QUEUES_PER_IRQ} queues per direction"
            )));
        }
        if no_input == 0 && no_output == 0 {
            return Err(QdioError::InvalidArgument("no queues requested".into()));
        }

        let mut input = Vec::with_capacity(no_input);
        for nr in 0..no_input {
            input.push(Arc::new(Queue::new(Direction::Input, nr, pool.get_page()?)));
        }
        let mut output = Vec::with_capacity(no_output);
        for nr in 0..no_output {
            output.push(Arc::new(Queue::new(Direction::Output, nr, pool.get_page()?)));
        }

        let set = Self { input, output };
        set.reset();
        Ok(set)
    }

    /// Queue by direction and number
    pub fn get(&self, direction: Direction, nr: usize) -> QdioResult<&Arc<Queue>> {
        let queues = match direction {
            Direction::Input => &self.input,
            Direction::Output => &self.output,
        };
        queues.get(nr).ok_or_else(|| {
            QdioError::InvalidArgument(format!(
                "{direction:?} queue {nr} out of range ({} configured)",
                queues.len()
            ))
        })
    }

    /// Every queue, inputs first
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Queue>> {
        self.input.iter().chain(self.output.iter())
    }

    /// Registration records for all queues
    pub(crate) fn records(&self) -> Vec<QueueRecord> {
        self.iter().map(|q| q.record()).collect()
    }

    /// Reinitialize every ring
    pub(crate) fn reset(&self) {
        for q in self.iter() {
            q.reset();
        }
    }
}
