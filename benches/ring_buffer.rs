//! Criterion benchmarks for the frame path hot spots.
//!
//! The capture thread must hand a frame to the ring buffer well inside one
//! detector frame period, so write latency is the headline number here.
//!
//! Key metrics:
//! - Frame write throughput for common detector geometries
//! - Write + read round trip (one frame through the buffer)
//! - Producer/consumer hand-off across threads
//! - Preview processing of a 512x512 frame
//!
//! Run with: cargo bench --bench ring_buffer

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rust_xray::calibration::{CalibrationDataset, CalibrationPayload};
use rust_xray::data::{FrameRingBuffer, OverwritePolicy, RingBufferConfig};
use rust_xray::frame::{FrameBuffer, BYTES_PER_PIXEL};
use rust_xray::processing::{EngineConfig, ImageProcessingEngine, ProcessingConfig};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const GEOMETRIES: [(&str, u32, u32); 3] = [
    ("512x512", 512, 512),
    ("1024x1024", 1024, 1024),
    ("3072x3072", 3072, 3072),
];

fn ring(width: u32, height: u32, depth: usize, policy: OverwritePolicy) -> FrameRingBuffer {
    FrameRingBuffer::new(RingBufferConfig {
        depth,
        frame_size: width as usize * height as usize * BYTES_PER_PIXEL,
        policy,
    })
    .unwrap()
}

/// Drop-oldest writes into a permanently full buffer, the capture steady state
/// when consumers fall behind.
fn frame_write_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_write");

    for (name, width, height) in GEOMETRIES {
        let rb = ring(width, height, 8, OverwritePolicy::DropOldest);
        let frame = FrameBuffer::gradient(width, height, 0, 4000);

        group.throughput(Throughput::Bytes(frame.size_bytes() as u64));
        group.bench_with_input(BenchmarkId::new("write_frame", name), &frame, |b, frame| {
            b.iter(|| {
                rb.write_frame(black_box(&frame.data)).unwrap();
            });
        });
    }

    group.finish();
}

/// One frame in, one frame out.
fn frame_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_round_trip");

    for (name, width, height) in GEOMETRIES {
        let rb = ring(width, height, 4, OverwritePolicy::BlockProducer);
        let frame = FrameBuffer::gradient(width, height, 0, 4000);
        let mut out = vec![0u8; frame.size_bytes()];

        group.throughput(Throughput::Bytes(frame.size_bytes() as u64));
        group.bench_with_input(BenchmarkId::new("write_read", name), &frame, |b, frame| {
            b.iter(|| {
                rb.write_frame(black_box(&frame.data)).unwrap();
                black_box(rb.read_frame(&mut out).unwrap());
            });
        });
    }

    group.finish();
}

/// Producer and consumer on separate threads, as in the capture pipeline.
fn producer_consumer_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_buffer_handoff");
    let frames_per_iter = 32u64;

    for depth in [1usize, 4, 16] {
        let frame = FrameBuffer::gradient(512, 512, 0, 4000);
        group.throughput(Throughput::Elements(frames_per_iter));
        group.bench_with_input(BenchmarkId::new("block_producer", depth), &depth, |b, &depth| {
            b.iter(|| {
                let rb = Arc::new(ring(512, 512, depth, OverwritePolicy::BlockProducer));
                let consumer = {
                    let rb = Arc::clone(&rb);
                    thread::spawn(move || {
                        let mut out = vec![0u8; rb.frame_size()];
                        for _ in 0..frames_per_iter {
                            rb.read_frame_timeout(&mut out, Duration::from_secs(5)).unwrap();
                        }
                    })
                };
                for _ in 0..frames_per_iter {
                    rb.write_frame(&frame.data).unwrap();
                }
                consumer.join().unwrap();
            });
        });
    }

    group.finish();
}

/// Preview processing against its latency budget.
fn preview_processing(c: &mut Criterion) {
    let (width, height) = (512u32, 512u32);
    let pixels = (width * height) as usize;
    let mut config = ProcessingConfig::preview(4000.0, 2000.0);
    config.dark_frame = Some(Arc::new(CalibrationDataset::new(
        width,
        height,
        Utc::now(),
        CalibrationPayload::DarkFrame(vec![100.0; pixels]),
    )));
    config.gain_map = Some(Arc::new(CalibrationDataset::new(
        width,
        height,
        Utc::now(),
        CalibrationPayload::GainMap(vec![1.0; pixels]),
    )));
    config.preserve_raw = false;

    let mut engine = ImageProcessingEngine::new();
    engine.initialize(EngineConfig::default()).unwrap();
    let source = FrameBuffer::gradient(width, height, 100, 4100);

    c.bench_function("process_frame_preview_512", |b| {
        b.iter_batched_ref(
            || source.clone(),
            |frame| {
                black_box(engine.process_frame(&mut frame.as_frame(), &config).unwrap());
            },
            criterion::BatchSize::LargeInput,
        );
    });
}

criterion_group!(
    benches,
    frame_write_throughput,
    frame_round_trip,
    producer_consumer_handoff,
    preview_processing
);
criterion_main!(benches);
