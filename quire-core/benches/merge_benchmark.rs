use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use quire_core::{EditIntent, NodeKey, Operation, Replica, ReplicaId};
use std::hint::black_box;

fn typed_history(chars: usize) -> (Vec<Operation>, NodeKey) {
    let mut replica = Replica::new(ReplicaId::from_u128(1));
    let p = replica
        .submit(EditIntent::insert_element(NodeKey::ROOT, 0, "paragraph"))
        .map(|op| NodeKey(op.id))
        .unwrap();
    let t = replica
        .submit(EditIntent::insert_text(p, 0, ""))
        .map(|op| NodeKey(op.id))
        .unwrap();
    for i in 0..chars {
        replica
            .submit(EditIntent::splice(t, i, 0, "x"))
            .unwrap();
    }
    (replica.history(), t)
}

fn bench_local_typing(c: &mut Criterion) {
    let mut group = c.benchmark_group("Merge Engine");
    group.throughput(Throughput::Elements(1));

    group.bench_function("submit_splice", |b| {
        let (history, t) = typed_history(0);
        let mut replica = Replica::new(ReplicaId::from_u128(2));
        replica.receive_all(history);
        let mut offset = 0;
        b.iter(|| {
            // Grows the text node on every iteration.
            let op = replica.submit(EditIntent::splice(t, offset, 0, "y")).unwrap();
            offset += 1;
            black_box(op);
        })
    });

    group.finish();
}

fn bench_remote_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("Merge Engine");
    let (history, _) = typed_history(500);
    group.throughput(Throughput::Elements(history.len() as u64));

    group.bench_function("replay_500_in_order", |b| {
        b.iter_batched(
            || (Replica::new(ReplicaId::from_u128(2)), history.clone()),
            |(mut replica, ops)| black_box(replica.receive_all(ops)),
            BatchSize::SmallInput,
        )
    });

    group.bench_function("replay_500_reversed", |b| {
        let mut reversed = history.clone();
        reversed.reverse();
        b.iter_batched(
            || (Replica::new(ReplicaId::from_u128(2)), reversed.clone()),
            |(mut replica, ops)| black_box(replica.receive_all(ops)),
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

fn bench_large_paste(c: &mut Criterion) {
    let mut group = c.benchmark_group("Merge Engine");

    for size in [5_000usize, 20_000] {
        let block = "x".repeat(size);
        group.throughput(Throughput::Elements(size as u64));
        group.bench_function(format!("paste_then_delete_{size}"), |b| {
            b.iter_batched(
                || {
                    let (history, t) = typed_history(0);
                    let mut replica = Replica::new(ReplicaId::from_u128(2));
                    replica.receive_all(history);
                    (replica, t)
                },
                |(mut replica, t)| {
                    replica.submit(EditIntent::splice(t, 0, 0, block.as_str())).unwrap();
                    replica.submit(EditIntent::splice(t, 0, size, "")).unwrap();
                    black_box(replica)
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(benches, bench_local_typing, bench_remote_replay, bench_large_paste);
criterion_main!(benches);
