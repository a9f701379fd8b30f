use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pprof::criterion::{Output, PProfProfiler};
use std::time::Duration;

use trialbench_core::Setting;
use trialbench_signal::{
    compose, initialize_factory, Block, FactoryKind, FlatCalibration, QueueOrdering, SignalQueue,
};

const FS: f64 = 100e3;

fn tone_pip_block() -> Block {
    Block::new(FactoryKind::Cos2Envelope, "envelope_")
        .with_input(Block::new(FactoryKind::Tone, "tone_"))
}

fn tone_pip_setting(duration: f64) -> Setting {
    Setting::new()
        .with("target_envelope_rise_time", 0.5e-3)
        .with("target_envelope_duration", duration)
        .with("target_tone_frequency", 8000.0)
        .with("target_tone_level", -10.0)
}

/// Building a factory tree from a block and a setting.
pub fn bench_initialize(c: &mut Criterion) {
    let block = tone_pip_block();
    let map = compose(&block, "target_").expect("valid block");
    let setting = tone_pip_setting(5e-3);
    let calibration = FlatCalibration::as_attenuation();

    c.bench_function("initialize_tone_pip", |b| {
        b.iter(|| {
            let factory = initialize_factory(&block, &map, black_box(&setting), FS, &calibration);
            black_box(factory.is_ok());
        });
    });
}

/// Pulling blocks of samples through an envelope and tone.
pub fn bench_next(c: &mut Criterion) {
    let block = tone_pip_block();
    let map = compose(&block, "target_").expect("valid block");
    let calibration = FlatCalibration::as_attenuation();
    let mut group = c.benchmark_group("tone_pip_next");
    group
        .sample_size(50)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1));

    for n in [256usize, 4096, 65536] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let mut factory =
                initialize_factory(&block, &map, &tone_pip_setting(10.0), FS, &calibration)
                    .expect("factory");
            b.iter(|| black_box(factory.next(black_box(n))));
        });
    }
    group.finish();
}

/// Streaming a queue of tone pips the way a queued output does.
pub fn bench_queue_pop_buffer(c: &mut Criterion) {
    let block = tone_pip_block();
    let map = compose(&block, "target_").expect("valid block");
    let calibration = FlatCalibration::as_attenuation();

    c.bench_function("queue_pop_buffer_100ms", |b| {
        b.iter_batched(
            || {
                let mut queue = SignalQueue::new(QueueOrdering::Interleaved);
                queue.set_fs(FS).expect("fs");
                for duration in [5e-3, 10e-3] {
                    let setting = tone_pip_setting(duration);
                    let factory = initialize_factory(&block, &map, &setting, FS, &calibration)
                        .expect("factory");
                    queue.append(factory, 500, &[0.02], setting).expect("append");
                }
                queue
            },
            |mut queue| black_box(queue.pop_buffer(10_000, true)),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group! {
    name = benches;
    config = Criterion::default().with_profiler(PProfProfiler::new(100, Output::Flamegraph(None)));
    targets = bench_initialize, bench_next, bench_queue_pop_buffer
}
criterion_main!(benches);
