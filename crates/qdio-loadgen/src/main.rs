//! QDIO Load Generator
//!
//! Establishes a subchannel on the simulator, pushes output buffers while a
//! device thread consumes them and feeds inbound traffic, then prints the
//! per-queue counters as JSON.
//!
//! # Usage
//!
//! ```bash
//! qdio-loadgen --buffers 100000 --batch 16
//! qdio-loadgen --config qdio.json --fast-path
//! RUST_LOG=qdio=debug qdio-loadgen --buffers 512
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use clap::Parser;
use qdio::{
    add_buf, establish, Capabilities, Direction, EstablishParams, HandlerReport, QdioConfig,
    QueueHandler, QueueStatsSnapshot, ShutdownMode, SimChannel, Subchannel, SubchannelToken,
    QDIO_MAX_BUFFERS_PER_Q,
};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "qdio-loadgen")]
#[command(version)]
#[command(about = "Drive a simulated QDIO subchannel", long_about = None)]
struct Cli {
    /// Engine configuration (JSON)
    #[arg(long, env = "QDIO_CONFIG")]
    config: Option<String>,

    /// Output buffers to push
    #[arg(long, default_value_t = 4096)]
    buffers: usize,

    /// Buffers per submission
    #[arg(long, default_value_t = 16)]
    batch: usize,

    /// Inbound buffers the device delivers per interrupt
    #[arg(long, default_value_t = 4)]
    inbound_burst: usize,

    /// Report batched state access from the simulated device
    #[arg(long)]
    fast_path: bool,
}

#[derive(Default)]
struct Counters {
    completed: AtomicUsize,
    errors: AtomicUsize,
    poll_ready: AtomicBool,
}

impl QueueHandler for Counters {
    fn buffers_done(&self, report: &HandlerReport) {
        match report.direction {
            Direction::Output => {
                self.completed.fetch_add(report.count, Ordering::Relaxed);
            }
            Direction::Input => {}
        }
        if !report.error.is_empty() {
            self.errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                direction = ?report.direction,
                queue = report.queue_nr,
                start = report.start,
                count = report.count,
                error = ?report.error,
                "handler error report"
            );
        }
    }

    fn poll_ready(&self, _queue_nr: usize) {
        self.poll_ready.store(true, Ordering::Release);
    }
}

#[derive(Serialize)]
struct QueueReport {
    direction: Direction,
    queue: usize,
    stats: QueueStatsSnapshot,
}

#[derive(Serialize)]
struct Report {
    submitted: usize,
    completed: usize,
    received: usize,
    handler_errors: usize,
    elapsed_ms: u128,
    queues: Vec<QueueReport>,
    total: QueueStatsSnapshot,
}

/// Simulated device side: consume output, deliver input
fn device_loop(sim: Arc<SimChannel>, stop: Arc<AtomicBool>, burst: usize) {
    let mut in_pos = 0;
    while !stop.load(Ordering::Acquire) {
        let mut raised = sim.complete_all_output(0) > 0;

        for _ in 0..burst {
            if sim.fill_input(0, in_pos, 1) == 0 {
                break;
            }
            in_pos = add_buf(in_pos, 1);
            raised = true;
        }
        if raised {
            sim.raise_data_interrupt();
        }
        thread::sleep(Duration::from_micros(50));
    }
}

/// Consume everything waiting on the input queue and hand it back
fn drain_inbound(subchannel: &Subchannel, counters: &Counters) -> Result<usize, qdio::QdioError> {
    if !counters.poll_ready.swap(false, Ordering::AcqRel) {
        return Ok(0);
    }
    let mut received = 0;
    loop {
        let batch = subchannel.poll_inbound(0)?;
        if batch.count == 0 {
            if subchannel.enable_interrupts() {
                // data raced the re-enable, keep polling
                continue;
            }
            return Ok(received);
        }
        received += batch.count;
        subchannel.reclaim(0, batch.start, batch.count)?;
    }
}

fn run(cli: &Cli, config: QdioConfig) -> Result<Report, Box<dyn std::error::Error>> {
    let mut caps = Capabilities::SIGA_OUTPUT_NEEDED | Capabilities::SIGA_INPUT_NEEDED;
    if cli.fast_path {
        caps |= Capabilities::QEBSM_AVAILABLE | Capabilities::QEBSM_ENABLED;
    }
    let batch = cli.batch.clamp(1, QDIO_MAX_BUFFERS_PER_Q);

    let sim = SimChannel::shared(caps);
    let counters = Arc::new(Counters::default());
    let params = EstablishParams::new(SubchannelToken(0x0001), 1, 1)
        .with_input_handler(counters.clone())
        .with_output_handler(counters.clone())
        .with_config(config);

    let subchannel = establish(sim.clone(), params)?;
    subchannel.activate()?;
    tracing::info!(
        token = %subchannel.token(),
        fast_path = subchannel.has_fast_path(),
        buffers = cli.buffers,
        batch,
        "subchannel running"
    );

    subchannel.reclaim(0, 0, QDIO_MAX_BUFFERS_PER_Q)?;

    let stop = Arc::new(AtomicBool::new(false));
    let device = {
        let sim = sim.clone();
        let stop = stop.clone();
        let burst = cli.inbound_burst;
        thread::Builder::new()
            .name("qdio-device".into())
            .spawn(move || device_loop(sim, stop, burst))?
    };

    let started = Instant::now();
    let mut received = 0;
    let mut submitted = 0;
    let mut out_pos = 0;

    while submitted < cli.buffers {
        let count = batch.min(cli.buffers - submitted);
        while subchannel.in_flight(Direction::Output, 0)? + count > QDIO_MAX_BUFFERS_PER_Q {
            subchannel.scan_completions(0)?;
            received += drain_inbound(&subchannel, &counters)?;
            thread::yield_now();
        }

        match subchannel.submit(0, out_pos, count, None) {
            Ok(()) => {}
            // buffers stay submitted, the next doorbell picks them up
            Err(e) if e.is_retryable() => tracing::debug!(error = %e, "submit retried later"),
            Err(e) => return Err(e.into()),
        }
        out_pos = add_buf(out_pos, count);
        submitted += count;
        received += drain_inbound(&subchannel, &counters)?;
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    while subchannel.in_flight(Direction::Output, 0)? > 0 && Instant::now() < deadline {
        subchannel.scan_completions(0)?;
        thread::sleep(Duration::from_micros(100));
    }
    received += drain_inbound(&subchannel, &counters)?;
    let elapsed = started.elapsed();

    stop.store(true, Ordering::Release);
    if device.join().is_err() {
        tracing::error!("device thread panicked");
    }

    let queues: Vec<QueueReport> = subchannel
        .stats()
        .into_iter()
        .map(|(direction, queue, stats)| QueueReport {
            direction,
            queue,
            stats,
        })
        .collect();
    let total = QueueStatsSnapshot::total(queues.iter().map(|q| &q.stats));

    subchannel.shutdown(ShutdownMode::Halt)?;
    subchannel.free()?;

    Ok(Report {
        submitted,
        completed: counters.completed.load(Ordering::Relaxed),
        received,
        handler_errors: counters.errors.load(Ordering::Relaxed),
        elapsed_ms: elapsed.as_millis(),
        queues,
        total,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    tracing::info!("qdio-loadgen v{}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => QdioConfig::load(path).unwrap_or_else(|e| {
            tracing::warn!(%path, error = %e, "config not loaded, using defaults");
            QdioConfig::default()
        }),
        None => QdioConfig::default(),
    };
    config.validate()?;

    let report = run(&cli, config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
