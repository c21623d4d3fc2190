//! Inbound Engine
//!
//! Finds buffers the device filled, acknowledges them and hands them back
//! to the device once the driver is done with them.
//!
//! # Acknowledgment
//!
//! Primed slots are not returned to the device one by one. On the direct
//! path only the newest slot of a batch keeps an `Ack` marker, the rest go
//! to `NotInit`; the marker moves forward with every scan and is removed by
//! [`Queue::stop_polling`]. On the batched path the device acknowledges the
//! whole run itself and the engine only remembers the range.

use serde::Serialize;

use crate::error::ErrorFlags;
use crate::queue::{AckState, Cursor, Engine, Queue};
use crate::slsb::Slsb;
use crate::state_store::StateFault;
use crate::{add_buf, buf_in_between, sub_buf, QDIO_MAX_BUFFERS_PER_Q};

/// Range of newly delivered input buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InboundBatch {
    /// First slot of the range
    pub start: usize,
    /// Slots in the range, zero when nothing arrived
    pub count: usize,
    /// Error bits for the whole range
    pub error: ErrorFlags,
}

impl InboundBatch {
    fn empty(start: usize) -> Self {
        Self {
            start,
            count: 0,
            error: ErrorFlags::empty(),
        }
    }

    /// Device marked the range failed
    pub fn has_error(&self) -> bool {
        !self.error.is_empty()
    }
}

impl Queue {
    /// Scan from the cursor for filled buffers and advance past them.
    pub(crate) fn inbound_scan(&self, eng: &Engine<'_>) -> Result<InboundBatch, StateFault> {
        let mut cur = self.cursor.lock();
        let start = cur.first_to_check;

        let used = self.in_flight();
        if used == 0 {
            return Ok(InboundBatch::empty(start));
        }
        self.stats.record_scan();

        let (count, state) = eng.store.read_states(self, start, used, true)?;
        if count == 0 {
            return Ok(InboundBatch::empty(start));
        }

        let error = match state {
            Slsb::INPUT_PRIMED => {
                tracing::trace!(queue = self.nr(), start, count, "input primed");
                self.ack_primed(eng, &mut cur, start, count)
            }
            Slsb::INPUT_ERROR => self.buffer_error(eng, start, count),
            Slsb::CU_INPUT_EMPTY => return Ok(InboundBatch::empty(start)),
            other => {
                tracing::warn!(
                    queue = self.nr(),
                    index = start,
                    state = other.0,
                    "unexpected input buffer state"
                );
                return Ok(InboundBatch::empty(start));
            }
        };

        self.sub_in_flight(count);
        cur.first_to_check = add_buf(start, count);
        Ok(InboundBatch {
            start,
            count,
            error,
        })
    }

    fn ack_primed(&self, eng: &Engine<'_>, cur: &mut Cursor, start: usize, count: usize) -> ErrorFlags {
        let mut error = ErrorFlags::empty();
        let mut note = |r: Result<usize, StateFault>| {
            if let Err(fault) = r {
                error |= fault.flag;
            }
        };

        if eng.store.fast_path() {
            // device acknowledged the run during extraction
            if cur.ack.polling {
                note(eng.store.write_states(self, cur.ack.start, Slsb::INPUT_NOT_INIT, cur.ack.count));
            }
            cur.ack = AckState {
                polling: true,
                start,
                count,
            };
            return error;
        }

        let newest = add_buf(start, count - 1);
        note(eng.store.write_state(self, newest, Slsb::INPUT_ACK));
        if cur.ack.polling && cur.ack.start != newest {
            note(eng.store.write_state(self, cur.ack.start, Slsb::INPUT_NOT_INIT));
        }
        cur.ack = AckState {
            polling: true,
            start: newest,
            count: 1,
        };

        // every other slot goes back so the device keeps interrupting
        if count > 1 {
            note(eng.store.write_states(self, start, Slsb::INPUT_NOT_INIT, count - 1));
        }
        error
    }

    /// Drop the outstanding acknowledgment so the device can reuse the slots
    pub(crate) fn stop_polling(&self, eng: &Engine<'_>) -> Result<(), StateFault> {
        let mut cur = self.cursor.lock();
        if !cur.ack.polling {
            return Ok(());
        }
        let ack = std::mem::take(&mut cur.ack);
        let count = if eng.store.fast_path() { ack.count } else { 1 };
        eng.store
            .write_states(self, ack.start, Slsb::INPUT_NOT_INIT, count)
            .map(|_| ())
    }

    /// Hand `count` slots from `start` back to the device for refill.
    ///
    /// Returns true when the device ran dry and must be told about the new
    /// buffers with a notify-input doorbell.
    pub(crate) fn reclaim(&self, eng: &Engine<'_>, start: usize, count: usize) -> Result<bool, StateFault> {
        {
            let mut cur = self.cursor.lock();
            if cur.ack.polling {
                if count == QDIO_MAX_BUFFERS_PER_Q {
                    cur.ack = AckState::default();
                } else if buf_in_between(cur.ack.start, start, count) {
                    if eng.store.fast_path() {
                        let overlap = sub_buf(add_buf(start, count), cur.ack.start);
                        if cur.ack.count <= overlap {
                            cur.ack = AckState::default();
                        } else {
                            cur.ack.count -= overlap;
                            cur.ack.start = add_buf(cur.ack.start, overlap);
                        }
                    } else {
                        // the only ack is overwritten
                        cur.ack.polling = false;
                    }
                }
            }
        }

        let done = eng.store.write_states(self, start, Slsb::CU_INPUT_EMPTY, count)?;
        let used = self.add_in_flight(done) - done;

        // device still had buffers, no need to tell it
        Ok(used == 0 && eng.caps.need_siga_in())
    }

    /// No more filled buffers are waiting at `start`
    pub(crate) fn inbound_done(&self, eng: &Engine<'_>, start: usize) -> bool {
        if self.in_flight() == 0 {
            return true;
        }
        self.sync_input(eng);
        match eng.store.read_state(self, start) {
            Ok(state) => !matches!(state, Slsb::INPUT_PRIMED | Slsb::INPUT_ERROR),
            Err(_) => true,
        }
    }

    /// Synchronize the ring view if the device does not do it on its own
    pub(crate) fn sync_input(&self, eng: &Engine<'_>) {
        if !eng.caps.need_siga_sync() {
            return;
        }
        if let Err(e) = eng.bells.synchronize(self.mask(), 0, &self.stats) {
            tracing::warn!(queue = self.nr(), error = %e, "input sync failed");
        }
    }
}
