//! Codec benchmarks for relay-protocol.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use relay_protocol::{codec, ChatMessage, InboundEvent, OutboundEvent, StoredMessage};

fn history(len: u64) -> OutboundEvent {
    OutboundEvent::StoredMessages(
        (0..len)
            .map(|id| StoredMessage {
                id,
                de: "alice".into(),
                para: "bob".into(),
                mensaje: "x".repeat(64),
                created_at: 1_700_000_000_000 + id,
            })
            .collect(),
    )
}

fn bench_decode_text(c: &mut Criterion) {
    let text =
        r#"{"event":"sendMessage","data":{"de":"alice","para":"bob","mensaje":"hello there"}}"#;

    let mut group = c.benchmark_group("decode_text");
    group.throughput(Throughput::Bytes(text.len() as u64));
    group.bench_function("send_message", |b| {
        b.iter(|| codec::decode_text(black_box(text)))
    });
    group.finish();
}

fn bench_encode_history(c: &mut Criterion) {
    let event = history(100);

    let mut group = c.benchmark_group("encode_history");
    group.bench_function("json_100", |b| {
        b.iter(|| codec::encode_text(black_box(&event)))
    });
    group.bench_function("msgpack_100", |b| b.iter(|| codec::encode(black_box(&event))));
    group.finish();
}

fn bench_binary_roundtrip(c: &mut Criterion) {
    let event = InboundEvent::SendMessage(ChatMessage::new("alice", "bob", "x".repeat(256)));

    c.bench_function("binary_roundtrip_256B", |b| {
        b.iter(|| {
            let encoded = codec::encode(black_box(&event)).unwrap();
            codec::decode::<InboundEvent>(black_box(&encoded)).unwrap()
        })
    });
}

criterion_group!(
    benches,
    bench_decode_text,
    bench_encode_history,
    bench_binary_roundtrip
);
criterion_main!(benches);
