//! Envelope encoding and request round-trip benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tendril::proto::{Envelope, StreamDescriptor};
use tendril::{handler_fn, Payload, Reply, Session};
use tokio::runtime::Runtime;

fn envelope_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope");
    for size in [64usize, 4096, 65536] {
        let envelope = Envelope::new("req-1", Bytes::from(vec![7u8; size])).with_streams(vec![
            StreamDescriptor::new("stream-2", "upload", tendril::StreamKind::Readable, false),
        ]);
        let encoded = envelope.to_bytes().expect("encode");

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("encode", size), &envelope, |b, envelope| {
            b.iter(|| black_box(envelope.to_bytes().expect("encode")))
        });
        group.bench_with_input(BenchmarkId::new("decode", size), &encoded, |b, encoded| {
            b.iter(|| black_box(Envelope::from_bytes(encoded).expect("decode")))
        });
    }
    group.finish();
}

fn echo_round_trip(c: &mut Criterion) {
    let runtime = Runtime::new().expect("runtime");
    let (client, _server) = runtime.block_on(async {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let server = Session::builder()
            .with_handler(handler_fn(|payload, reply: Reply| async move {
                let _ = reply.send(payload);
            }))
            .connect(b)
            .expect("server");
        (Session::new(a).expect("client"), server)
    });

    c.bench_function("echo_round_trip", |b| {
        b.to_async(&runtime).iter(|| async {
            let response = client
                .request(Payload::new(json!({"op": "echo", "args": [1, 2, 3]})))
                .await
                .expect("request");
            black_box(response)
        })
    });

    c.bench_function("echo_batch_100", |b| {
        b.to_async(&runtime).iter(|| async {
            let requests = (0..100).map(|i| client.request(Payload::new(json!(i))));
            for response in futures::future::join_all(requests).await {
                black_box(response.expect("request"));
            }
        })
    });
}

criterion_group!(benches, envelope_encoding, echo_round_trip);
criterion_main!(benches);
