use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use peer_link::p2p::auth::inspect;
use peer_link::p2p::FrameCodec;
use peer_link::{FeatureSet, Identity, TrustStore};
use zeroize::Zeroizing;

fn codec(features: FeatureSet, local: &Arc<Identity>, remote: &Identity) -> FrameCodec {
    let remote = inspect(remote.certificate_der(), &TrustStore::default(), false).unwrap();
    FrameCodec::new(
        features,
        Some(Zeroizing::new([7u8; 32])),
        Some(local.clone()),
        Some(remote),
    )
    .unwrap()
}

fn bench_frame(c: &mut Criterion) {
    let alice = Arc::new(Identity::generate_self_signed("alice").unwrap());
    let bob = Arc::new(Identity::generate_self_signed("bob").unwrap());

    let feature_sets = [
        ("plain", FeatureSet::none()),
        ("encryption", FeatureSet::new(true, false, false)),
        ("encryption+checksum", FeatureSet::new(true, false, true)),
        ("all", FeatureSet::all()),
    ];

    for size in [16usize, 256, 1024] {
        let message = "x".repeat(size);
        let mut group = c.benchmark_group(format!("frame_{size}"));

        for (name, features) in feature_sets {
            let sender = codec(features, &alice, &bob);
            let receiver = codec(features, &bob, &alice);
            let frame = sender.encode(&message).unwrap();

            group.bench_with_input(BenchmarkId::new("encode", name), &message, |b, message| {
                b.iter(|| sender.encode(message).unwrap())
            });
            group.bench_with_input(BenchmarkId::new("decode", name), &frame, |b, frame| {
                b.iter(|| receiver.decode(frame).unwrap())
            });
        }
        group.finish();
    }
}

criterion_group!(benches, bench_frame);
criterion_main!(benches);
