//! Append throughput of the durable log, with and without per-commit sync.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion, Throughput};

use segvault_core::{Operation, Result, SegmentSnapshot};
use segvault_wal::{DurableLog, JournalConfig, OperationApplier, OperationLog};

/// Accounting-only applier: tracks a single segment length so appends get
/// realistic offsets without any metadata machinery.
struct CountingApplier {
    length: AtomicU64,
}

impl OperationApplier for CountingApplier {
    fn apply_operation(&self, _sequence: u64, operation: &Operation) -> Result<u64> {
        match operation {
            Operation::Append { data, .. } => {
                Ok(self.length.fetch_add(data.len() as u64, Ordering::Relaxed))
            }
            _ => Ok(0),
        }
    }

    fn apply_map(&self, _snapshot: &SegmentSnapshot) -> Result<()> {
        Ok(())
    }

    fn apply_unmap(&self, _segment_id: u64, _deleted: bool) -> Result<SegmentSnapshot> {
        Ok(SegmentSnapshot::empty(0, "bench"))
    }
}

fn bench_append(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let payload = Bytes::from(vec![0xa5u8; 1024]);
    let timeout = Duration::from_secs(10);

    let mut group = c.benchmark_group("log_append_1kib");
    group.throughput(Throughput::Bytes(1024));

    for (label, sync_on_commit) in [("buffered", false), ("synced", true)] {
        let dir = tempfile::TempDir::new().unwrap();
        let config = JournalConfig {
            directory: dir.path().to_path_buf(),
            sync_on_commit,
        };
        let log = Arc::new(DurableLog::new(
            0,
            config,
            Arc::new(CountingApplier {
                length: AtomicU64::new(0),
            }),
        ));
        rt.block_on(async {
            log.start().await.unwrap();
            log.register_segment(SegmentSnapshot::empty(1, "bench"), timeout)
                .await
                .unwrap();
        });

        group.bench_function(label, |b| {
            let log = log.clone();
            let payload = payload.clone();
            b.to_async(&rt).iter(|| {
                let log = log.clone();
                let payload = payload.clone();
                async move {
                    log.add(
                        Operation::Append {
                            segment_id: 1,
                            expected_offset: None,
                            data: payload,
                            attribute_updates: Vec::new(),
                        },
                        timeout,
                    )
                    .await
                    .unwrap()
                }
            })
        });

        rt.block_on(async {
            log.stop().await.unwrap();
        });
    }

    group.finish();
}

criterion_group!(benches, bench_append);
criterion_main!(benches);
