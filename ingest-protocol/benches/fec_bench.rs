use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ingest_protocol::fec::{encode_parity, reconstruct, source_symbol, symbol_width};
use ingest_protocol::packet::DataPacket;
use ingest_protocol::sequence::SeqNumber;

fn sources(k: usize) -> Vec<Vec<u8>> {
    let width = symbol_width(1316);
    (0..k)
        .map(|i| {
            let payload = Bytes::from(vec![i as u8; 1316]);
            let packet = DataPacket::new(SeqNumber::new(i as u32), i as u32 * 1000, 1, payload);
            source_symbol(&packet, width)
        })
        .collect()
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_encode");
    for (k, m) in [(10, 2), (20, 6), (50, 15)] {
        let symbols = sources(k);
        group.throughput(Throughput::Bytes((k * symbols[0].len()) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(format!("{k}+{m}")), &m, |b, &m| {
            b.iter(|| black_box(encode_parity(black_box(&symbols), m).unwrap()));
        });
    }
    group.finish();
}

fn bench_reconstruct(c: &mut Criterion) {
    let mut group = c.benchmark_group("fec_reconstruct");
    for (k, m) in [(10, 2), (20, 6), (50, 15)] {
        let symbols = sources(k);
        let parity = encode_parity(&symbols, m).unwrap();

        // First m sources missing, every parity symbol present.
        let received: Vec<Option<&[u8]>> = symbols
            .iter()
            .enumerate()
            .map(|(i, s)| (i >= m).then_some(s.as_slice()))
            .collect();
        let parity_refs: Vec<(usize, &[u8])> =
            parity.iter().enumerate().map(|(i, p)| (i, p.as_slice())).collect();

        group.bench_function(BenchmarkId::from_parameter(format!("{k}+{m}")), |b| {
            b.iter(|| black_box(reconstruct(black_box(&received), black_box(&parity_refs)).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode, bench_reconstruct);
criterion_main!(benches);
