//! Buffer State Benchmarks
//!
//! Submit/complete/scan cycles against the simulator, direct and batched.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use qdio::{
    add_buf, buf_in_between, establish, Capabilities, EstablishParams, HandlerReport, QdioConfig,
    SimChannel, Subchannel, SubchannelToken, QDIO_MAX_BUFFERS_PER_Q,
};

fn bench_ring_math(c: &mut Criterion) {
    c.bench_function("buf_in_between", |b| {
        b.iter(|| {
            let mut hits = 0;
            for slot in 0..QDIO_MAX_BUFFERS_PER_Q {
                if buf_in_between(black_box(slot), black_box(120), black_box(16)) {
                    hits += 1;
                }
            }
            hits
        })
    });
}

fn active(caps: Capabilities) -> (Arc<SimChannel>, Subchannel) {
    let sim = SimChannel::shared(caps);
    let config = QdioConfig {
        activate_settle_ms: 0,
        ..Default::default()
    };
    let params = EstablishParams::new(SubchannelToken(0xbe), 0, 1)
        .with_output_handler(Arc::new(|report: &HandlerReport| {
            black_box(report.count);
        }))
        .with_config(config);
    let subchannel = establish(sim.clone(), params).expect("establish");
    subchannel.activate().expect("activate");
    (sim, subchannel)
}

fn bench_output_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("output_cycle");
    let paths = [
        ("direct", Capabilities::SIGA_OUTPUT_NEEDED),
        (
            "batched",
            Capabilities::SIGA_OUTPUT_NEEDED
                | Capabilities::QEBSM_AVAILABLE
                | Capabilities::QEBSM_ENABLED,
        ),
    ];

    for (name, caps) in paths {
        for batch in [1usize, 16, 64] {
            let (sim, subchannel) = active(caps);
            let mut start = 0;
            group.throughput(Throughput::Elements(batch as u64));
            group.bench_with_input(BenchmarkId::new(name, batch), &batch, |b, &batch| {
                b.iter(|| {
                    subchannel.submit(0, start, batch, None).expect("submit");
                    sim.complete_output(0, start, batch);
                    let done = subchannel.scan_completions(0).expect("scan");
                    start = add_buf(start, batch);
                    done
                })
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_ring_math, bench_output_cycle);
criterion_main!(benches);
