//! Frame codec and acknowledgement window benchmarks

use bytes::{Bytes, BytesMut};
use camotun::protocol::{FlowWindow, Frame, ReceiveTracker, MAX_PAYLOAD_SIZE};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;

const PAYLOAD_SIZES: [usize; 4] = [64, 1400, 16 * 1024, MAX_PAYLOAD_SIZE];

fn frame_codec_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");

    for size in PAYLOAD_SIZES {
        let frame = Frame::data(7, 42, Bytes::from(vec![0xa5; size]));
        let encoded = frame.encode().unwrap().freeze();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &frame, |b, frame| {
            let mut buf = BytesMut::with_capacity(frame.encoded_size());
            b.iter(|| {
                buf.clear();
                black_box(frame).encode_into(&mut buf).unwrap();
                black_box(&buf);
            });
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| {
                let mut buf = BytesMut::from(&encoded[..]);
                let frame = Frame::decode(black_box(&mut buf)).unwrap();
                black_box(frame);
            });
        });
    }

    group.finish();
}

fn frame_batch_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_batch");

    // A read buffer holding many small frames, as a busy channel sees it
    let mut batch = BytesMut::new();
    for sequence in 1..=256u64 {
        Frame::data(1 + 2 * (sequence as u32 % 8), sequence, Bytes::from_static(&[0u8; 512]))
            .encode_into(&mut batch)
            .unwrap();
    }
    let batch = batch.freeze();

    group.throughput(Throughput::Bytes(batch.len() as u64));
    group.bench_function("drain_256_frames", |b| {
        b.iter(|| {
            let mut buf = BytesMut::from(&batch[..]);
            let mut count = 0;
            while let Some(frame) = Frame::decode(&mut buf).unwrap() {
                black_box(frame);
                count += 1;
            }
            black_box(count);
        });
    });

    group.finish();
}

fn window_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("ack_window");

    group.bench_function("advance_and_acknowledge", |b| {
        b.iter(|| {
            let mut window = FlowWindow::new(64);
            let mut tracker = ReceiveTracker::new();
            for _ in 0..1024 {
                let sequence = window.try_advance().unwrap();
                tracker.accept(sequence).unwrap();
                if let Some(ack) = tracker.take_pending_ack() {
                    window.acknowledge(ack).unwrap();
                }
            }
            black_box(window.last_acked_seq());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    frame_codec_benchmark,
    frame_batch_benchmark,
    window_benchmark
);
criterion_main!(benches);
