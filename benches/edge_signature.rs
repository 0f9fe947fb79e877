use criterion::{black_box, criterion_group, criterion_main, Criterion};

use shashin::edge::canonical::{canonical_string, sign, split_query};
use shashin::edge::signer::sign_url;

const SECRET: &str = "bench-signing-secret";

fn bench_canonicalization(c: &mut Criterion) {
    let mut group = c.benchmark_group("edge_canonical");

    let cases = vec![
        ("short_query", "w=200"),
        ("typical_query", "w=200&h=100&fit=cover&format=webp&q=80&expires=1900000000"),
        (
            "repeated_keys",
            "edits=%7B%22grayscale%22%3Atrue%7D&w=1&w=2&w=3&h=4&h=5&r=90&flip=h&signature=abc",
        ),
    ];

    for (name, raw) in cases {
        let query = split_query(raw);
        group.bench_function(name, |b| {
            b.iter(|| canonical_string(black_box("/photos/cat.jpg"), black_box(&query)))
        });
    }

    group.finish();
}

fn bench_signature(c: &mut Criterion) {
    let query = split_query("w=200&h=100&fit=cover&format=webp");
    let canonical = canonical_string("/photos/cat.jpg", &query);

    c.bench_function("edge_hmac_sign", |b| {
        b.iter(|| sign(black_box(SECRET.as_bytes()), black_box(&canonical)).unwrap())
    });

    c.bench_function("edge_sign_url", |b| {
        b.iter(|| {
            sign_url(
                black_box(SECRET),
                black_box("/photos/cat.jpg"),
                black_box(&query),
                Some(1_900_000_000),
            )
            .unwrap()
        })
    });
}

criterion_group!(benches, bench_canonicalization, bench_signature);
criterion_main!(benches);
