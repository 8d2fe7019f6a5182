use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use gpureplay_placement::{Marker, redistribute_resources};

/// Dense heap where every fourth resource grew by half an alignment unit
fn dense_heap(count: u64) -> Vec<Marker> {
    (0..count)
        .map(|i| {
            let marker = Marker::new(i * 4096, 4096, 256);
            if i % 4 == 0 {
                marker.with_live_size(4096 + 128)
            } else {
                marker
            }
        })
        .collect()
}

fn bench_redistribute(c: &mut Criterion) {
    let mut group = c.benchmark_group("redistribute");
    for count in [16u64, 256, 4096] {
        let markers = dense_heap(count);
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &markers, |b, markers| {
            b.iter(|| redistribute_resources(black_box(markers)));
        });
    }
    group.finish();
}

fn bench_unchanged(c: &mut Criterion) {
    let markers: Vec<Marker> = (0..4096u64).map(|i| Marker::new(i * 4096, 4096, 256)).collect();
    c.bench_function("redistribute_unchanged_4096", |b| {
        b.iter(|| redistribute_resources(black_box(&markers)));
    });
}

criterion_group!(benches, bench_redistribute, bench_unchanged);
criterion_main!(benches);
