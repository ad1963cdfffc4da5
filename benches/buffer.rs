use std::io;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use sluse::buffer::{SharedInputBuffer, SharedOutputBuffer};
use sluse::codec::{ContentDecoder, ContentEncoder};
use sluse::conn::IoControl;

const BUFFER_CAPACITY: usize = 20480;

struct NoopIo;

impl IoControl for NoopIo {
    fn request_input(&self) {}
    fn suspend_input(&self) {}
    fn request_output(&self) {}
    fn suspend_output(&self) {}
}

struct SliceDecoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl ContentDecoder for SliceDecoder<'_> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let n = dst.len().min(self.data.len() - self.pos);
        dst[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn is_completed(&self) -> bool {
        self.pos == self.data.len()
    }
}

struct SinkEncoder {
    total: usize,
}

impl ContentEncoder for SinkEncoder {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        self.total += src.len();
        Ok(src.len())
    }

    fn complete(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn is_completed(&self) -> bool {
        false
    }
}

fn benchmark(c: &mut Criterion) {
    let sizes = [4096usize, 65536, 1 << 20];

    let mut group = c.benchmark_group("buffer");
    for &size in sizes.iter() {
        let payload = vec![0xa5u8; size];
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("input_pass", size), &payload, |b, payload| {
            b.iter(|| {
                let buffer = SharedInputBuffer::new(BUFFER_CAPACITY, Arc::new(NoopIo));
                let mut decoder = SliceDecoder {
                    data: payload,
                    pos: 0,
                };
                let mut out = [0u8; 8192];
                let mut total = 0;
                while total < payload.len() {
                    buffer.consume_from(&mut decoder).unwrap();
                    while !buffer.is_empty() {
                        total += buffer.read(&mut out).unwrap();
                    }
                }
                total
            })
        });

        group.bench_with_input(
            BenchmarkId::new("output_pass", size),
            &payload,
            |b, payload| {
                b.iter(|| {
                    let buffer = SharedOutputBuffer::new(BUFFER_CAPACITY, Arc::new(NoopIo));
                    let mut encoder = SinkEncoder { total: 0 };
                    let mut written = 0;
                    while written < payload.len() {
                        let end = (written + 4096).min(payload.len());
                        written += buffer.write(&payload[written..end]).unwrap();
                        buffer.produce_content(&mut encoder).unwrap();
                    }
                    encoder.total
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
