//! Doorbell Protocol
//!
//! The three device signals and their completion handling. Only the output
//! notification may be retried: a busy device is polled until the patience
//! window closes, everything else non-zero is reported straight up.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::utils::Backoff;

use crate::channel::{ChannelIo, Completion, Doorbell, SubchannelToken};
use crate::error::{QdioError, QdioResult};
use crate::stats::QueueStats;

/// Doorbell access for one subchannel
pub struct DoorbellPort {
    io: Arc<dyn ChannelIo>,
    token: SubchannelToken,
    patience: Duration,
}

impl DoorbellPort {
    /// Create a port; `patience` bounds the busy-bit retry loop
    pub fn new(io: Arc<dyn ChannelIo>, token: SubchannelToken, patience: Duration) -> Self {
        Self { io, token, patience }
    }

    /// Make the software view of the selected rings consistent
    pub fn synchronize(&self, input_mask: u32, output_mask: u32, stats: &QueueStats) -> QdioResult<()> {
        stats.doorbell_sync.fetch_add(1, Ordering::Relaxed);
        let op = Doorbell::Sync {
            input_mask,
            output_mask,
        };
        self.check(op, self.io.doorbell(self.token, op))
    }

    /// Input buffers are available to the device again
    pub fn notify_input(&self, mask: u32, stats: &QueueStats) -> QdioResult<()> {
        stats.doorbell_input.fetch_add(1, Ordering::Relaxed);
        let op = Doorbell::NotifyInput { mask };
        self.check(op, self.io.doorbell(self.token, op))
    }

    /// New output buffers are ready.
    ///
    /// A busy device is retried with a spinning backoff until `patience`
    /// has passed since the first busy answer, then [`QdioError::Busy`] is
    /// returned. Never sleeps.
    pub fn notify_output(&self, mask: u32, multiple: bool, stats: &QueueStats) -> QdioResult<()> {
        stats.doorbell_output.fetch_add(1, Ordering::Relaxed);
        let op = Doorbell::NotifyOutput { mask, multiple };
        let backoff = Backoff::new();
        let mut retries = 0u32;
        let mut first_busy: Option<Instant> = None;

        loop {
            let completion = self.io.doorbell(self.token, op);
            if !completion.busy {
                if retries > 0 {
                    stats.record_busy(retries);
                    tracing::debug!(token = %self.token, mask, retries, "busy bit cleared");
                }
                return self.check(op, completion);
            }

            retries += 1;
            let since = *first_busy.get_or_insert_with(Instant::now);
            if since.elapsed() >= self.patience {
                stats.record_busy(retries);
                tracing::warn!(
                    token = %self.token,
                    mask,
                    retries,
                    patience_us = self.patience.as_micros() as u64,
                    "device busy past patience window"
                );
                return Err(QdioError::Busy { retries });
            }
            backoff.spin();
        }
    }

    fn check(&self, op: Doorbell, completion: Completion) -> QdioResult<()> {
        match completion.cc {
            0 => Ok(()),
            cc => {
                tracing::error!(token = %self.token, doorbell = op.name(), cc, "doorbell failed");
                Err(QdioError::Io { op: op.name(), cc })
            }
        }
    }
}
