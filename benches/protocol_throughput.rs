//! Worker line protocol encode/decode throughput.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use plugcheck::engine::TestResult;
use plugcheck::supervisor::protocol::{decode_line, encode_line, WorkerMessage};

fn result_with_output(lines: usize) -> TestResult {
    let mut result = TestResult::started("Fuzz parameters");
    for i in 0..lines {
        result
            .output
            .push(format!("Setting parameter {i} to {:.4}", i as f32 / lines as f32));
    }
    result.add_failure("Parameter 3 did not round-trip");
    result.finish();
    result
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_line");

    for (name, lines) in [("small", 4), ("medium", 128), ("large", 4096)] {
        let message = WorkerMessage::item_complete(&result_with_output(lines));
        group.throughput(Throughput::Elements(lines as u64));
        group.bench_with_input(BenchmarkId::new("output_lines", name), &message, |b, msg| {
            b.iter(|| encode_line(black_box(msg)).unwrap())
        });
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_line");

    let log = encode_line(&WorkerMessage::Log {
        text: "Starting test: Audio processing".into(),
    })
    .unwrap();
    group.bench_function("log", |b| b.iter(|| decode_line(black_box(&log)).unwrap()));

    for (name, lines) in [("small", 4), ("large", 4096)] {
        let line = encode_line(&WorkerMessage::item_complete(&result_with_output(lines))).unwrap();
        group.throughput(Throughput::Bytes(line.len() as u64));
        group.bench_with_input(BenchmarkId::new("item_complete", name), &line, |b, line| {
            b.iter(|| decode_line(black_box(line)).unwrap())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
