//! Benchmarks for grant computation and propagation

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use cadence_coord::{DependencyGraph, FederationContext};
use cadence_core::{FederateId, Tag};

/// Chain 0 -> 1 -> ... -> n-1, every federate connected and reporting
fn chain(n: usize) -> FederationContext {
    let mut ctx = FederationContext::new(n);
    for i in 0..n {
        ctx.federate_connected(FederateId::from(i)).unwrap();
    }
    for i in 1..n {
        ctx.add_connection(FederateId::from(i - 1), FederateId::from(i), Tag::new(1, 0))
            .unwrap();
    }
    for i in 1..n {
        ctx.update_federate_next_event_tag_locked(FederateId::from(i), Tag::new(1_000, 0))
            .unwrap();
    }
    ctx
}

fn bench_chain_propagation(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain_propagation");
    for n in [4usize, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            let mut ctx = chain(n);
            let head = FederateId::new(0);
            let mut t = 0i64;
            b.iter(|| {
                t += 1;
                let notices = ctx.update_federate_next_event_tag_locked(head, Tag::new(t, 0));
                black_box(notices.map(|n| n.len()).unwrap_or(0))
            })
        });
    }
    group.finish();
}

fn bench_min_delay_closure(c: &mut Criterion) {
    let mut group = c.benchmark_group("min_delay_closure");
    for n in [16usize, 64] {
        let mut graph = DependencyGraph::new(n);
        for i in 0..n {
            graph.add_edge(FederateId::from(i), FederateId::from((i + 1) % n), Tag::new(1, 0));
            graph.add_edge(FederateId::from(i), FederateId::from((i * 7 + 3) % n), Tag::ZERO);
        }
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| {
                black_box(graph.update_min_delays().is_in_cycle(FederateId::new(0)))
            })
        });
    }
    group.finish();
}

fn bench_eimt_query(c: &mut Criterion) {
    let ctx = chain(64);
    let tail = FederateId::new(63);

    c.bench_function("eimt_query", |b| {
        b.iter(|| black_box(ctx.earliest_future_incoming_message_tag(black_box(tail))))
    });
}

criterion_group!(
    benches,
    bench_chain_propagation,
    bench_min_delay_closure,
    bench_eimt_query,
);
criterion_main!(benches);
