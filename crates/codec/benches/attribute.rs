use criterion::{Criterion, criterion_group, criterion_main};
use radius_proxy_codec::Attributes;

fn tlv(kind: u8, value: &[u8]) -> Vec<u8> {
    let mut out = vec![kind, (value.len() + 2) as u8];
    out.extend_from_slice(value);
    out
}

fn sample_region() -> Vec<u8> {
    let mut region = tlv(1, b"alice@example.com");
    region.extend(tlv(2, &[0u8; 16]));
    region.extend(tlv(4, &[192, 0, 2, 1]));
    region.extend(tlv(80, &[0u8; 16]));
    region
}

fn bench_scan(c: &mut Criterion) {
    let region = sample_region();
    c.bench_function("attribute_scan", |b| {
        b.iter(|| Attributes::scan(&region).unwrap())
    });
}

fn bench_find(c: &mut Criterion) {
    let region = sample_region();
    let attrs = Attributes::scan(&region).unwrap();
    c.bench_function("attribute_find", |b| {
        b.iter(|| attrs.find(&region, 1))
    });
}

criterion_group!(benches, bench_scan, bench_find);
criterion_main!(benches);
