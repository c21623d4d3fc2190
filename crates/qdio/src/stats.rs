//! Queue Statistics
//!
//! Lock-free per-queue counters. Observational only: nothing in the engine
//! reads them back to make decisions.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-queue counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Default)]
pub struct QueueStats {
    /// Completion scans with buffers in flight
    pub scans: AtomicU64,
    /// Handler invocations
    pub handler_calls: AtomicU64,
    /// Buffers reported to handlers
    pub buffers: AtomicU64,
    /// Buffers the device marked failed
    pub buffer_errors: AtomicU64,
    /// Output attempts refused by a full target
    pub target_full: AtomicU64,
    /// Sync doorbells
    pub doorbell_sync: AtomicU64,
    /// Notify-input doorbells
    pub doorbell_input: AtomicU64,
    /// Notify-output doorbells
    pub doorbell_output: AtomicU64,
    /// Doorbell attempts answered busy
    pub busy_retries: AtomicU64,
    /// Submissions that skipped the doorbell
    pub fast_requeue: AtomicU64,
    /// Batch operations reissued after partial progress
    pub batch_partial: AtomicU64,
    /// Batch operations retried without progress
    pub batch_retries: AtomicU64,
    /// Deferred work runs
    pub deferred_runs: AtomicU64,
    /// Fallback timer arms
    pub timer_arms: AtomicU64,
}

#[allow(missing_docs)]
impl QueueStats {
    #[inline(always)]
    pub fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_handler(&self, buffers: usize) {
        self.handler_calls.fetch_add(1, Ordering::Relaxed);
        self.buffers.fetch_add(buffers as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_error(&self, buffers: usize) {
        self.buffer_errors.fetch_add(buffers as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_target_full(&self) {
        self.target_full.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_busy(&self, retries: u32) {
        self.busy_retries.fetch_add(retries as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_fast_requeue(&self) {
        self.fast_requeue.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_batch_partial(&self) {
        self.batch_partial.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_batch_retry(&self) {
        self.batch_retries.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_deferred_run(&self) {
        self.deferred_runs.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_timer_arm(&self) {
        self.timer_arms.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the counters out
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            scans: self.scans.load(Ordering::Relaxed),
            handler_calls: self.handler_calls.load(Ordering::Relaxed),
            buffers: self.buffers.load(Ordering::Relaxed),
            buffer_errors: self.buffer_errors.load(Ordering::Relaxed),
            target_full: self.target_full.load(Ordering::Relaxed),
            doorbell_sync: self.doorbell_sync.load(Ordering::Relaxed),
            doorbell_input: self.doorbell_input.load(Ordering::Relaxed),
            doorbell_output: self.doorbell_output.load(Ordering::Relaxed),
            busy_retries: self.busy_retries.load(Ordering::Relaxed),
            fast_requeue: self.fast_requeue.load(Ordering::Relaxed),
            batch_partial: self.batch_partial.load(Ordering::Relaxed),
            batch_retries: self.batch_retries.load(Ordering::Relaxed),
            deferred_runs: self.deferred_runs.load(Ordering::Relaxed),
            timer_arms: self.timer_arms.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    /// Completion scans with buffers in flight
    pub scans: u64,
    /// Handler invocations
    pub handler_calls: u64,
    /// Buffers reported to handlers
    pub buffers: u64,
    /// Buffers the device marked failed
    pub buffer_errors: u64,
    /// Output attempts refused by a full target
    pub target_full: u64,
    /// Sync doorbells
    pub doorbell_sync: u64,
    /// Notify-input doorbells
    pub doorbell_input: u64,
    /// Notify-output doorbells
    pub doorbell_output: u64,
    /// Doorbell attempts answered busy
    pub busy_retries: u64,
    /// Submissions that skipped the doorbell
    pub fast_requeue: u64,
    /// Batch operations reissued after partial progress
    pub batch_partial: u64,
    /// Batch operations retried without progress
    pub batch_retries: u64,
    /// Deferred work runs
    pub deferred_runs: u64,
    /// Fallback timer arms
    pub timer_arms: u64,
}

impl QueueStatsSnapshot {
    /// Total doorbells rung
    pub fn doorbells(&self) -> u64 {
        self.doorbell_sync + self.doorbell_input + self.doorbell_output
    }

    /// Buffers per handler call
    pub fn batching_factor(&self) -> f64 {
        if self.handler_calls == 0 {
            return 0.0;
        }
        self.buffers as f64 / self.handler_calls as f64
    }

    /// Sum of several snapshots
    pub fn total<'a>(snapshots: impl IntoIterator<Item = &'a QueueStatsSnapshot>) -> Self {
        let mut total = Self::default();
        for s in snapshots {
            total.scans += s.scans;
            total.handler_calls += s.handler_calls;
            total.buffers += s.buffers;
            total.buffer_errors += s.buffer_errors;
            total.target_full += s.target_full;
            total.doorbell_sync += s.doorbell_sync;
            total.doorbell_input += s.doorbell_input;
            total.doorbell_output += s.doorbell_output;
            total.busy_retries += s.busy_retries;
            total.fast_requeue += s.fast_requeue;
            total.batch_partial += s.batch_partial;
            total.batch_retries += s.batch_retries;
            total.deferred_runs += s.deferred_runs;
            total.timer_arms += s.timer_arms;
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_stats() {
        let stats = QueueStats::default();
        stats.record_scan();
        stats.record_handler(8);
        stats.record_handler(4);
        stats.doorbell_output.fetch_add(2, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.scans, 1);
        assert_eq!(snap.buffers, 12);
        assert_eq!(snap.doorbells(), 2);
        assert!((snap.batching_factor() - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_total() {
        let a = QueueStats::default();
        let b = QueueStats::default();
        a.record_handler(3);
        b.record_handler(5);
        b.record_busy(7);

        let total = QueueStatsSnapshot::total([&a.snapshot(), &b.snapshot()]);
        assert_eq!(total.buffers, 8);
        assert_eq!(total.busy_retries, 7);
    }
}
