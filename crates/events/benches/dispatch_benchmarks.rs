use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use marketflow_core::{OrderId, ProductId, UserId};
use marketflow_events::{
    Delivery, DedupFilter, Dispatcher, Envelope, HandlerRegistry, InMemoryDedupStore, OrderCreated,
    OrderLine, dedup_key,
};

fn order_created(lines: usize) -> OrderCreated {
    OrderCreated {
        order_id: OrderId::new("o-bench").unwrap(),
        user_id: UserId::new("u-bench").unwrap(),
        items: (0..lines)
            .map(|i| OrderLine {
                product_id: ProductId::new(format!("P{i}")).unwrap(),
                quantity: 1,
            })
            .collect(),
        total_amount: lines as f64,
    }
}

fn raw(lines: usize) -> Vec<u8> {
    Envelope::new("order.created", order_created(lines))
        .unwrap()
        .to_vec()
        .unwrap()
}

fn bench_dedup_key(c: &mut Criterion) {
    let mut group = c.benchmark_group("dedup_key");

    for lines in [1usize, 10, 100] {
        let body = raw(lines);
        group.throughput(Throughput::Bytes(body.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), &body, |b, body| {
            b.iter(|| dedup_key(black_box("order.created"), black_box(body)))
        });
    }

    group.finish();
}

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    let registry = Arc::new(
        HandlerRegistry::builder()
            .on::<OrderCreated, _>(|p, _| {
                black_box(p.items.len());
                Ok(())
            })
            .build()
            .unwrap(),
    );

    for lines in [1usize, 10] {
        let delivery = Delivery::new("order.exchange", "order.created", raw(lines));

        let plain = Dispatcher::new("order.created.product", registry.clone(), None);
        group.bench_with_input(BenchmarkId::new("no_dedup", lines), &delivery, |b, d| {
            b.iter(|| plain.dispatch(black_box(d)))
        });

        // Every iteration after the first is a duplicate hit.
        let filter = DedupFilter::new(Arc::new(InMemoryDedupStore::new()));
        let deduped = Dispatcher::new("order.created.product", registry.clone(), Some(filter));
        group.bench_with_input(BenchmarkId::new("dedup_hit", lines), &delivery, |b, d| {
            b.iter(|| deduped.dispatch(black_box(d)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_dedup_key, bench_dispatch);
criterion_main!(benches);
