//! Benchmarks for request processing
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use emucam::backend::BufferLayout;
use emucam::capabilities::DEFAULT_CAPABILITIES_JSON;
use emucam::types::keys;
use emucam::{
    align_to, BufferHandle, CaptureRequest, ChannelCallback, FrameNumber, PipelineDescriptor,
    PipelineId, PixelFormat, ProcessorConfig, RequestProcessor, Settings, StreamDescriptor,
    StreamId,
};
use std::sync::Arc;

fn bench_align_to(c: &mut Criterion) {
    c.bench_function("align_to", |b| {
        b.iter(|| {
            let mut acc = 0usize;
            for v in 0..1024usize {
                acc = acc.wrapping_add(align_to(black_box(v), black_box(64)));
            }
            acc
        })
    });
}

fn bench_layout_computation(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout_computation");

    for format in [PixelFormat::Ycbcr420, PixelFormat::Raw16, PixelFormat::Rgba8888] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format),
            &format,
            |b, &format| {
                b.iter(|| BufferLayout::compute(black_box(format), 1920, 1080, 0));
            },
        );
    }

    group.finish();
}

fn bench_submit_and_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_and_drain");

    let mut config = ProcessorConfig::default();
    config.sensor.simulate_exposure = false;
    let (mut processor, _mapper) =
        RequestProcessor::with_simulated_sensor(config).expect("processor");
    processor
        .initialize(DEFAULT_CAPABILITIES_JSON)
        .expect("capabilities");

    let (callback, events) = ChannelCallback::new();
    let pipeline = PipelineDescriptor::new(
        PipelineId(0),
        0,
        [StreamDescriptor::output(StreamId(0), 320, 240, PixelFormat::Ycbcr420)],
        Arc::new(callback),
    )
    .expect("pipeline");
    let pipelines = [pipeline];
    let settings = Settings::new().with(keys::SENSITIVITY, 100i64);

    for batch in [1u32, 16, 64] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &batch| {
            let mut frame = FrameNumber(0);
            b.iter(|| {
                for _ in 0..batch {
                    let request = CaptureRequest::new(PipelineId(0))
                        .with_settings(settings.clone())
                        .with_output(StreamId(0), BufferHandle(frame.0 as u64));
                    processor
                        .process_pipeline_requests(frame, &[request], &pipelines)
                        .expect("submit");
                    frame = frame.next();
                }
                // Shutter and buffer per request
                for _ in 0..batch * 2 {
                    events.recv().expect("event");
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_align_to,
    bench_layout_computation,
    bench_submit_and_drain,
);
criterion_main!(benches);
