/// Performance benchmarks for watch-set matching
///
/// Every request observed by the proxy is evaluated against the global watch
/// set and then against each plugin's set, so matching sits on the hot path.
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use intercept_proxy::watch::WatchSet;

fn patterns(count: usize) -> Vec<String> {
    let mut patterns: Vec<String> = (0..count)
        .map(|i| format!("https://service{i}.example.com/api/*"))
        .collect();
    patterns.insert(0, "!https://service0.example.com/api/health".to_string());
    patterns
}

fn bench_evaluate(c: &mut Criterion) {
    let mut group = c.benchmark_group("WatchSet::evaluate");

    for size in [1, 10, 100] {
        let set = WatchSet::parse(patterns(size)).unwrap();

        group.bench_with_input(BenchmarkId::new("first_pattern", size), &set, |b, set| {
            b.iter(|| set.evaluate(black_box("https://service0.example.com/api/health")))
        });

        let last = format!("https://service{}.example.com/api/users/42", size - 1);
        group.bench_with_input(BenchmarkId::new("last_pattern", size), &set, |b, set| {
            b.iter(|| set.evaluate(black_box(&last)))
        });

        group.bench_with_input(BenchmarkId::new("no_match", size), &set, |b, set| {
            b.iter(|| set.evaluate(black_box("https://unrelated.test/index.html")))
        });
    }

    group.finish();
}

fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("WatchSet::parse");

    for size in [10, 100] {
        let raw = patterns(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &raw, |b, raw| {
            b.iter(|| WatchSet::parse(black_box(raw)).unwrap())
        });
    }

    group.finish();
}

fn bench_hosts(c: &mut Criterion) {
    let set = WatchSet::parse(patterns(100)).unwrap();
    let hosts = set.hosts();

    c.bench_function("WatchSet::hosts", |b| b.iter(|| black_box(&set).hosts()));
    c.bench_function("host_set_lookup", |b| {
        b.iter(|| hosts.is_watched(black_box("service99.example.com")))
    });
}

criterion_group!(benches, bench_evaluate, bench_parse, bench_hosts);
criterion_main!(benches);
