//! Conversion stage benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use fluxon_core::alloc::{Allocator, HeapAllocator};
use fluxon_core::convert::{Resize, Resizer, Serialize, Serializer};
use fluxon_core::parse::{Parser, ParserContext, SoftwareOptions, SoftwareParserContext};
use fluxon_core::{JsonBuffer, SeqRange};

fn filled_buffer(records: usize) -> JsonBuffer {
    let mut buf = JsonBuffer::new(HeapAllocator.allocate(records * 64).unwrap());
    for i in 0..records {
        buf.push_record(format!("{{\"voltage\":[{i},{i},{i},{i}]}}", i = i).as_bytes())
            .unwrap();
    }
    buf.set_seq_range(SeqRange::new(0, records as u64 - 1));
    buf
}

fn bench_software_parse(c: &mut Criterion) {
    let buf = filled_buffer(1024);
    let mut ctx = SoftwareParserContext::new(SoftwareOptions::default(), 1).unwrap();
    let mut parser = ctx.parsers().unwrap().pop().unwrap();

    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Bytes(buf.len() as u64));
    group.bench_function("software_1k_records", |b| {
        b.iter(|| {
            let parsed = parser.parse(std::slice::from_ref(&buf)).unwrap();
            black_box(parsed)
        })
    });
    group.finish();
}

fn bench_resize_serialize(c: &mut Criterion) {
    let buf = filled_buffer(1024);
    let mut ctx = SoftwareParserContext::new(SoftwareOptions::default(), 1).unwrap();
    let mut parser = ctx.parsers().unwrap().pop().unwrap();
    let parsed = parser.parse(std::slice::from_ref(&buf)).unwrap();

    let resizer = Resizer::new(256, 1 << 20);
    let serializer = Serializer::new(1 << 20, false);

    let mut group = c.benchmark_group("resize_serialize");
    group.throughput(Throughput::Elements(1024));
    group.bench_function("1k_records_256_row_batches", |b| {
        b.iter(|| {
            let resized = resizer.resize(parsed[0].clone()).unwrap();
            let serialized = serializer.serialize(resized).unwrap();
            black_box(serialized)
        })
    });
    group.finish();
}

criterion_group!(benches, bench_software_parse, bench_resize_serialize);
criterion_main!(benches);
