use bytes::BytesMut;
use conduit::core::frame::{Frame, FrameType};
use conduit::core::FrameCodec;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tokio_util::codec::{Decoder, Encoder};

#[allow(clippy::unwrap_used)]
fn bench_frame_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_encode_decode");
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || vec![0u8; size],
                |payload| {
                    let frame = Frame::new(FrameType::Message, 1, payload);
                    let mut buf = BytesMut::with_capacity(size + 32);
                    let mut codec = FrameCodec::new();
                    codec.encode(frame, &mut buf).unwrap();
                },
                BatchSize::SmallInput,
            )
        });
        group.bench_function(format!("decode_{size}b"), |b| {
            let bytes = Frame::new(FrameType::Message, 1, vec![0u8; size]).to_bytes();
            b.iter_batched(
                || BytesMut::from(&bytes[..]),
                |mut buf| {
                    let mut codec = FrameCodec::new();
                    let decoded = codec.decode(&mut buf).unwrap();
                    assert!(decoded.is_some());
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

#[allow(clippy::unwrap_used)]
fn bench_payload_encode(c: &mut Criterion) {
    use conduit::core::payload::{self, MessagePayload};
    use rmpv::Value;

    let mut group = c.benchmark_group("payload_encode");
    let body = MessagePayload {
        type_tag: "chat".into(),
        data: payload::value_map([
            ("username", Value::from("alice")),
            ("message", Value::from("benchmark message body")),
            ("seq", Value::from(123_456)),
        ]),
    };

    group.bench_function("message_payload", |b| {
        b.iter(|| payload::encode(&body).unwrap())
    });

    let bytes = payload::encode(&body).unwrap();
    group.bench_function("message_payload_decode", |b| {
        b.iter(|| {
            let decoded: MessagePayload = payload::decode(&bytes).unwrap();
            decoded
        })
    });

    group.finish();
}

criterion_group!(benches, bench_frame_encode_decode, bench_payload_encode);
criterion_main!(benches);
