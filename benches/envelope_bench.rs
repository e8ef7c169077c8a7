use bytes::{Bytes, BytesMut};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use peernet::config::ReputationConfig;
use peernet::core::codec::{EnvelopeCodec, HEADER_LEN};
use peernet::protocol::bitcoin::{BitcoinMessage, MAGIC};
use peernet::reputation::{PeerEvent, ReputationStore};
use peernet::Endpoint;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use tokio_util::codec::Decoder;

const MAX_MESSAGE: usize = 2 * 1024 * 1024;

#[allow(clippy::unwrap_used)]
fn bench_envelope_encode_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelope_encode_decode");
    let codec = EnvelopeCodec::new(MAGIC, MAX_MESSAGE);
    let payload_sizes = [64usize, 512, 4096, 65536, 1024 * 1024];

    for &size in &payload_sizes {
        let message = BitcoinMessage::Unknown {
            command: "block".to_string(),
            payload: Bytes::from(vec![0x5au8; size]),
        };
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_function(format!("encode_{size}b"), |b| {
            b.iter_batched(
                || BytesMut::with_capacity(size + HEADER_LEN),
                |mut buf| {
                    codec
                        .encode_message(&message, 0, &mut buf, size + HEADER_LEN)
                        .unwrap();
                    buf
                },
                BatchSize::SmallInput,
            )
        });

        let mut encoded = BytesMut::new();
        codec
            .encode_message(&message, 0, &mut encoded, usize::MAX)
            .unwrap();
        group.bench_function(format!("decode_{size}b"), |b| {
            b.iter_batched(
                || encoded.clone(),
                |mut buf| {
                    let mut codec = codec;
                    let frame = codec.decode(&mut buf).unwrap();
                    assert!(frame.is_some());
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

fn bench_candidate_selection(c: &mut Criterion) {
    let store = ReputationStore::new(&ReputationConfig::default());
    let now = store.now();
    for i in 0..4096u32 {
        let ip = Ipv4Addr::from(0x0a00_0000 + i);
        let endpoint = Endpoint::from(SocketAddr::from((ip, 8333)));
        store.notify(endpoint, PeerEvent::PeerNotify { claimed: now - i });
    }
    let connected = HashSet::new();

    c.bench_function("select_candidates_4096", |b| {
        b.iter(|| {
            let chosen = store.select_candidates(&connected, 8);
            // Clear the attempt stamps so every iteration sees the same store.
            for endpoint in chosen {
                store.remove(&endpoint);
                store.notify(endpoint, PeerEvent::PeerNotify { claimed: now });
            }
        })
    });
}

criterion_group!(benches, bench_envelope_encode_decode, bench_candidate_selection);
criterion_main!(benches);
