//! 🏎️ How much do extra chunk fillers buy us when the store answers instantly?
//!
//! Everything runs against the in-memory store, so this measures the reader's own
//! overhead (channels, ordering, copies), not the network.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use s3x::{BufferedMultipartWriter, InMemoryStore, ParallelReader, ReaderParams, Transport, WriterParams};
use tokio_util::sync::CancellationToken;

const OBJECT_SIZE: usize = 16 * 1024 * 1024;
const CHUNK_SIZE: u64 = 256 * 1024;
const WORKER_COUNTS: &[usize] = &[1, 2, 4, 8, 16];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("💀 benchmark runtime refused to start")
}

fn bench_parallel_read(c: &mut Criterion) {
    let runtime = runtime();
    let store: Arc<dyn Transport> =
        Arc::new(InMemoryStore::new().with_object("bench/blob", vec![7u8; OBJECT_SIZE]));

    let mut group = c.benchmark_group("parallel_read");
    group.throughput(Throughput::Bytes(OBJECT_SIZE as u64));
    group.sample_size(20);
    for &workers in WORKER_COUNTS {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&runtime).iter(|| {
                let store = Arc::clone(&store);
                async move {
                    let mut reader = ParallelReader::new(store, CancellationToken::new());
                    reader
                        .open(ReaderParams {
                            key: "bench/blob".into(),
                            object_size: OBJECT_SIZE as u64,
                            chunk_size: CHUNK_SIZE,
                            num_workers: workers,
                        })
                        .expect("💀 open failed");
                    let mut buf = vec![0u8; 64 * 1024];
                    let mut total = 0usize;
                    loop {
                        let read = reader.read(&mut buf).await.expect("💀 read failed");
                        if read == 0 {
                            break;
                        }
                        total += read;
                    }
                    reader.close().await;
                    black_box(total)
                }
            });
        });
    }
    group.finish();
}

fn bench_multipart_write(c: &mut Criterion) {
    let runtime = runtime();
    let payload = vec![3u8; OBJECT_SIZE];

    let mut group = c.benchmark_group("multipart_write");
    group.throughput(Throughput::Bytes(OBJECT_SIZE as u64));
    group.sample_size(20);
    for &workers in WORKER_COUNTS {
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&runtime).iter(|| {
                let payload = &payload;
                async move {
                    let store = InMemoryStore::new();
                    let mut writer =
                        BufferedMultipartWriter::new(Arc::new(store.clone()), CancellationToken::new());
                    writer
                        .open(WriterParams {
                            key: "bench/out".into(),
                            chunk_size: CHUNK_SIZE as usize,
                            max_workers: workers,
                        })
                        .await
                        .expect("💀 open failed");
                    for block in payload.chunks(64 * 1024) {
                        writer.write(block).await.expect("💀 write failed");
                    }
                    writer.close().await.expect("💀 close failed");
                    black_box(store.object("bench/out").map(|data| data.len()))
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_parallel_read, bench_multipart_write);
criterion_main!(benches);
