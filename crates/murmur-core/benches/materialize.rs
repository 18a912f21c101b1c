//! Thread materialization and fan-out benchmarks for murmur-core.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use murmur_core::{
    outbound_queue, ConnectionRegistry, Materializer, MemoryStore, MessageFilter, Outbound, User,
};
use murmur_protocol::{Message, PushFrame, TreeView};
use std::sync::Arc;

/// `threads` roots with `replies` replies each, every other reply nested.
fn populate(store: &MemoryStore, threads: usize, replies: usize) -> Vec<Message> {
    let mut all = Vec::new();
    for t in 0..threads {
        let root = store.insert_message(Message::new(format!("r{t}"), "/Bench/chat", "root").created_at(t as i64));
        let mut parent = root.clone();
        all.push(root.clone());
        for r in 0..replies {
            let reply = store.insert_message(
                Message::new(format!("r{t}-{r}"), "/Bench/chat", "reply")
                    .in_reply_to(if r % 2 == 0 { &root } else { &parent })
                    .created_at((t * replies + r) as i64),
            );
            parent = reply.clone();
            all.push(reply);
        }
    }
    all
}

fn bench_materialize(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("materialize");

    for replies in [10, 100] {
        let store = Arc::new(MemoryStore::new());
        let messages = populate(&store, 20, replies);
        let tree = Materializer::new(store);
        let filter = MessageFilter::new();
        group.throughput(Throughput::Elements(messages.len() as u64));

        for view in [TreeView::OneLevel, TreeView::Full] {
            group.bench_with_input(
                BenchmarkId::new(view.as_str(), replies),
                &messages,
                |b, messages| {
                    b.iter(|| rt.block_on(tree.materialize(black_box(messages.clone()), &filter, view)))
                },
            );
        }

        // Only replies in hand: every root is refetched.
        let orphans: Vec<Message> = messages.iter().filter(|m| !m.is_root()).cloned().collect();
        group.bench_with_input(BenchmarkId::new("refetch_roots", replies), &orphans, |b, orphans| {
            b.iter(|| rt.block_on(tree.materialize(black_box(orphans.clone()), &filter, TreeView::OneLevel)))
        });
    }

    group.finish();
}

fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("fanout");

    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let registry = ConnectionRegistry::new();
            let (instances, mut receivers): (Vec<_>, Vec<_>) = (0..size)
                .map(|i| {
                    let (tx, rx) = outbound_queue(4);
                    (registry.register(User::new(format!("user-{i}")), tx), rx)
                })
                .unzip();
            let frame = Arc::new(PushFrame::message_count("/Bench/chat"));

            b.iter(|| {
                let delivered = registry.fan_out(
                    instances
                        .iter()
                        .map(|i| (i.clone(), Outbound::Push(Arc::clone(&frame)))),
                );
                for rx in &mut receivers {
                    while rx.try_recv().is_ok() {}
                }
                black_box(delivered)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_materialize, bench_fanout);
criterion_main!(benches);
