use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use quire_collab::broadcast::{RoutedFrame, Rooms};
use quire_collab::protocol::{PeerInfo, SyncMessage};
use quire_collab::session::{SessionConfig, SyncSession};
use quire_core::{EditIntent, NodeKey, Operation, Replica, ReplicaId};
use std::hint::black_box;
use uuid::Uuid;

fn typed_ops(chars: usize) -> Vec<Operation> {
    let mut replica = Replica::new(ReplicaId::from_u128(1));
    let p = replica
        .submit(EditIntent::insert_element(NodeKey::ROOT, 0, "paragraph"))
        .unwrap();
    let t = replica
        .submit(EditIntent::insert_text(NodeKey(p.id), 0, ""))
        .unwrap();
    for i in 0..chars {
        replica
            .submit(EditIntent::splice(NodeKey(t.id), i, 0, "x"))
            .unwrap();
    }
    replica.history()
}

fn bench_operations_codec(c: &mut Criterion) {
    let peer = ReplicaId::new();
    let doc = Uuid::new_v4();
    let single = typed_ops(1).pop().unwrap();
    let batch = typed_ops(100);
    let encoded = SyncMessage::operations(peer, doc, 1, &batch)
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("operations_encode_1", |b| {
        b.iter(|| {
            let msg = SyncMessage::operations(
                black_box(peer),
                black_box(doc),
                black_box(1),
                black_box(std::slice::from_ref(&single)),
            )
            .unwrap();
            black_box(msg.encode().unwrap());
        })
    });

    c.bench_function("operations_decode_100", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.operations_payload().unwrap());
        })
    });
}

fn bench_session_catch_up(c: &mut Criterion) {
    let doc = Uuid::new_v4();
    let history = typed_ops(500);
    let config = SessionConfig::for_testing().with_doc(doc);
    let reply = SyncMessage::operations(ReplicaId::from_u128(1), doc, 0, &history)
        .unwrap()
        .encode()
        .unwrap();
    let welcome = SyncMessage::welcome(doc, ReplicaId::from_u128(2), &[])
        .unwrap()
        .encode()
        .unwrap();

    let mut group = c.benchmark_group("Sync Session");
    group.throughput(Throughput::Elements(history.len() as u64));
    group.bench_function("apply_500_op_frame", |b| {
        b.iter_batched(
            || {
                let mut session = SyncSession::new(ReplicaId::from_u128(2), config.clone());
                session.connect().unwrap();
                session.handle_frame(&welcome).unwrap();
                session.drain_transmit();
                session
            },
            |mut session| {
                session.handle_frame(black_box(&reply)).unwrap();
                black_box(session.drain_transmit());
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}

fn bench_broadcast_fanout(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let rooms = Rooms::new(2048);
    let doc = Uuid::new_v4();
    let (room, memberships) = rt.block_on(async {
        let mut joined = Vec::new();
        let mut room = None;
        for i in 0..100 {
            let (r, membership) = rooms
                .join(doc, PeerInfo::new(format!("peer-{i}")), 100)
                .await
                .unwrap();
            room = Some(r);
            joined.push(membership);
        }
        (room.unwrap(), joined)
    });
    let frame = RoutedFrame {
        from: ReplicaId::from_u128(1),
        to: None,
        bytes: vec![0u8; 64],
    };

    c.bench_function("publish_100_members", |b| {
        b.iter(|| black_box(room.publish(frame.clone())))
    });
    drop(memberships);
}

criterion_group!(
    benches,
    bench_operations_codec,
    bench_session_catch_up,
    bench_broadcast_fanout
);
criterion_main!(benches);
