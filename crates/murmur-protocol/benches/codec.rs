//! Codec benchmarks for murmur-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use murmur_protocol::{codec, Encoding, Message, MessageEvent, PushFrame, ServerFrame, TreeView};

fn thread_frame(replies: usize) -> ServerFrame {
    let mut root = Message::new("root", "/Bench/chat", "x".repeat(64));
    for i in 0..replies {
        root.replies
            .push(Message::new(format!("reply-{i}"), "/Bench/chat", "y".repeat(64)).in_reply_to(&root));
    }
    let event = MessageEvent {
        action: "reply".into(),
        username: "bench".into(),
        message: root.replies.first().cloned().unwrap_or_else(|| root.clone()),
    };
    ServerFrame::Push(PushFrame::message_with_tree(event, TreeView::OneLevel, root))
}

fn bench_encode(c: &mut Criterion) {
    let frame = thread_frame(16);
    let size = codec::encode(&frame, Encoding::Json).unwrap().len();

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(size as u64));
    group.bench_function("json_thread_16", |b| {
        b.iter(|| codec::encode(black_box(&frame), Encoding::Json))
    });
    group.bench_function("msgpack_thread_16", |b| {
        b.iter(|| codec::encode(black_box(&frame), Encoding::MessagePack))
    });
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let frame = thread_frame(16);
    let encoded = codec::encode_binary(&frame).unwrap();

    let mut group = c.benchmark_group("decode");
    group.throughput(Throughput::Bytes(encoded.len() as u64));
    group.bench_function("msgpack_thread_16", |b| {
        b.iter(|| codec::decode::<ServerFrame>(black_box(&encoded), Encoding::MessagePack))
    });
    group.finish();
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
