use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand_core::OsRng;

use peerseal::crypto::derive_session_id;
use peerseal::Ratchet;

fn setup_pair() -> (Ratchet, Ratchet) {
    let root = [7u8; 32];
    let session_id = derive_session_id("alice", "bob", &root);

    let mut alice = Ratchet::new(&mut OsRng);
    let mut bob = Ratchet::new(&mut OsRng);
    alice.initialize(&root, &session_id);
    bob.initialize(&root, &session_id);
    (alice, bob)
}

fn bench_encrypt(c: &mut Criterion) {
    let mut group = c.benchmark_group("encrypt");

    for size in [128usize, 1024, 16384, 65536] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let (mut alice, _) = setup_pair();
            let message = vec![0u8; size];
            b.iter(|| black_box(alice.encrypt(&message).unwrap()));
        });
    }

    group.finish();
}

fn bench_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("roundtrip");

    group.bench_function("encrypt_decrypt_1kb", |b| {
        let message = vec![0u8; 1024];
        b.iter(|| {
            let (mut alice, mut bob) = setup_pair();
            let envelope = alice.encrypt(&message).unwrap();
            black_box(bob.decrypt(&envelope).unwrap())
        });
    });

    group.bench_function("ping_pong_10", |b| {
        let message = vec![0u8; 256];
        b.iter(|| {
            let (mut alice, mut bob) = setup_pair();
            for _ in 0..5 {
                let envelope = alice.encrypt(&message).unwrap();
                bob.decrypt(&envelope).unwrap();
                let envelope = bob.encrypt(&message).unwrap();
                alice.decrypt(&envelope).unwrap();
            }
        });
    });

    group.finish();
}

fn bench_out_of_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("out_of_order");

    group.bench_function("skip_50", |b| {
        let message = vec![0u8; 256];
        b.iter(|| {
            let (mut alice, mut bob) = setup_pair();

            let mut envelopes = Vec::with_capacity(51);
            for _ in 0..51 {
                envelopes.push(alice.encrypt(&message).unwrap());
            }

            bob.decrypt(&envelopes[50]).unwrap();
            for envelope in envelopes.iter().take(50) {
                bob.decrypt(envelope).unwrap();
            }
        });
    });

    group.finish();
}

fn bench_state_blob(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_blob");

    let (mut alice, mut bob) = setup_pair();
    for _ in 0..20 {
        let envelope = alice.encrypt(b"warmup").unwrap();
        bob.decrypt(&envelope).unwrap();
    }
    let blob = bob.export_state();

    group.bench_function("export", |b| {
        b.iter(|| black_box(bob.export_state()));
    });
    group.bench_function("import", |b| {
        b.iter(|| black_box(Ratchet::import_state(&blob).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_encrypt,
    bench_roundtrip,
    bench_out_of_order,
    bench_state_blob
);
criterion_main!(benches);
