//! End-to-end benchmarks of the file-based pipeline.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use smtrace_driver::Config;
use std::io::Write;
use tempfile::TempDir;

const EVENTS: u64 = 10_000;

fn setup() -> (TempDir, Config) {
    let dir = TempDir::new().unwrap();

    let model_path = dir.path().join("model.json");
    let model = serde_json::json!({
        "name": "latency",
        "nodes": [{"name": "pending"}, {"name": "served"}],
        "initial": [{"event": "request", "to": "pending"}],
        "transitions": [
            {"from": "pending", "event": "reply", "to": "served", "guards": ["latency < ?"]}
        ]
    });
    std::fs::write(&model_path, model.to_string()).unwrap();

    let events_path = dir.path().join("trace.jsonl");
    let mut file = std::io::BufWriter::new(std::fs::File::create(&events_path).unwrap());
    for i in 0..EVENTS / 2 {
        let tid = i % 32;
        let latency = if i % 500 == 0 { 10_000 } else { 100 + i % 10 };
        writeln!(
            file,
            r#"{{"name": "request", "timestamp": {}, "fields": {{"context._vtid": {}}}}}"#,
            i * 10,
            tid
        )
        .unwrap();
        writeln!(
            file,
            r#"{{"name": "reply", "timestamp": {}, "fields": {{"context._vtid": {}, "latency": {}}}}}"#,
            i * 10 + 5,
            tid,
            latency
        )
        .unwrap();
    }
    file.flush().unwrap();

    let mut config = Config::default();
    config.input.model = Some(model_path);
    config.input.events = Some(events_path);
    (dir, config)
}

fn bench_run(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    let (_dir, config) = setup();

    group.throughput(Throughput::Elements(EVENTS));
    group.sample_size(20);
    group.bench_function("run_10k", |b| {
        b.iter(|| black_box(smtrace_driver::run(&config).unwrap()))
    });
    group.finish();
}

criterion_group!(benches, bench_run);
criterion_main!(benches);
