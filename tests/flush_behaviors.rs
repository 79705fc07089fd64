//! Flush pipeline behaviors: happy path, empty-group checkpoints, sink and
//! metastore failures, watermark advancement.

use std::sync::Arc;

use memshard::shard::{FlushGroup, FlushResponse, ShardBuilder, TimeSeriesShard};
use memshard::test_support::{MemoryMetaStore, MemorySink};
use memshard::{DataRow, DatasetSchema, IngestRecord, Label, ShardConfig};

fn schema() -> DatasetSchema {
    DatasetSchema::new("telemetry", vec!["value".to_string()])
}

fn config() -> ShardConfig {
    ShardConfig::new()
        .with_max_chunks_size(8)
        .with_shard_memory_mb(1)
        .with_num_block_pages(4)
        .with_groups_per_shard(4)
        .with_max_num_partitions(32)
}

struct Fixture {
    shard: Arc<TimeSeriesShard>,
    sink: Arc<MemorySink>,
    metastore: Arc<MemoryMetaStore>,
}

fn fixture() -> Fixture {
    let sink = Arc::new(MemorySink::new());
    let metastore = Arc::new(MemoryMetaStore::new());
    let shard = ShardBuilder::new(schema(), 0)
        .with_config(config())
        .with_sink(sink.clone())
        .with_metastore(metastore.clone())
        .build()
        .unwrap();
    Fixture {
        shard,
        sink,
        metastore,
    }
}

fn record(name: &str, offset: i64) -> IngestRecord {
    IngestRecord::new(
        vec![Label::new("series", name)],
        DataRow::new(offset * 10, vec![1.0]),
        offset,
    )
}

/// Ingests one record and returns the group its key belongs to.
fn ingest_one(f: &Fixture, name: &str, offset: i64) -> usize {
    f.shard.ingest(&[record(name, offset)]).unwrap();
    f.shard
        .group_for_labels(&[Label::new("series", name)])
        .unwrap()
}

#[test]
fn flush_happy_path_commits_checkpoint() {
    let f = fixture();
    let group = ingest_one(&f, "A", 42);

    f.shard.switch_group_buffers(group).unwrap();
    let response = f
        .shard
        .create_flush_task(FlushGroup {
            group_num: group,
            flush_watermark: 100,
        })
        .execute();

    assert_eq!(response, FlushResponse::Success);
    assert_eq!(f.shard.group_watermark(group), 100);
    assert_eq!(f.shard.stats().flushes_successful(), 1);
    assert_eq!(f.metastore.checkpoint("telemetry", 0, group), Some(100));

    // One chunk and one new partition key reached the sink.
    let chunks = f.sink.written_chunks();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].num_samples, 1);
    assert_eq!(f.sink.written_keys().len(), 1);
    assert_eq!(f.shard.stats().chunks_encoded(), 1);
    assert_eq!(f.shard.stats().samples_encoded(), 1);
}

#[test]
fn pending_key_set_clears_after_next_switch() {
    let f = fixture();
    let group = ingest_one(&f, "A", 1);

    f.shard.switch_group_buffers(group).unwrap();
    f.shard
        .create_flush_task(FlushGroup {
            group_num: group,
            flush_watermark: 10,
        })
        .execute();
    assert_eq!(f.sink.written_keys().len(), 1);

    // Next cycle: no new keys were created, so after the switch the flush
    // has no partition keys to persist.
    f.shard.ingest(&[record("A", 2)]).unwrap();
    f.shard.switch_group_buffers(group).unwrap();
    f.shard
        .create_flush_task(FlushGroup {
            group_num: group,
            flush_watermark: 20,
        })
        .execute();
    assert_eq!(f.sink.written_keys().len(), 1);
}

#[test]
fn empty_group_still_checkpoints_without_sink_writes() {
    let f = fixture();
    // Group 2 never saw ingest.
    let response = f
        .shard
        .create_flush_task(FlushGroup {
            group_num: 2,
            flush_watermark: 50,
        })
        .execute();

    assert_eq!(response, FlushResponse::Success);
    assert_eq!(f.shard.group_watermark(2), 50);
    assert_eq!(f.metastore.checkpoint("telemetry", 0, 2), Some(50));
    assert_eq!(f.sink.chunk_write_calls(), 0);
    assert_eq!(f.sink.key_write_calls(), 0);
}

#[test]
fn member_group_with_no_frozen_buffers_is_not_applied() {
    let f = fixture();
    let group = ingest_one(&f, "A", 1);

    // No switch: the active buffer stays attached, nothing encodes, and the
    // sink reports the chunk stream as empty.
    f.shard.switch_group_buffers(group).unwrap();
    f.shard
        .create_flush_task(FlushGroup {
            group_num: group,
            flush_watermark: 10,
        })
        .execute();

    f.shard.ingest(&[record("A", 2)]).unwrap();
    // Seal nothing this cycle: flush without a switch.
    let response = f
        .shard
        .create_flush_task(FlushGroup {
            group_num: group,
            flush_watermark: 20,
        })
        .execute();

    assert_eq!(response, FlushResponse::NotApplied);
    assert_eq!(f.shard.group_watermark(group), 10);
}

#[test]
fn chunk_write_failure_drops_data_and_keeps_watermark() {
    let f = fixture();
    let group = ingest_one(&f, "A", 1);
    f.sink.set_fail_chunk_writes(true);

    f.shard.switch_group_buffers(group).unwrap();
    let response = f
        .shard
        .create_flush_task(FlushGroup {
            group_num: group,
            flush_watermark: 100,
        })
        .execute();

    assert_eq!(response, FlushResponse::DataDropped);
    assert_eq!(f.shard.group_watermark(group), 0);
    assert_eq!(f.shard.stats().flushes_failed_chunk_write(), 1);
    assert_eq!(f.shard.stats().flushes_successful(), 0);

    // The holder was released: a subsequent flush runs cleanly.
    f.sink.set_fail_chunk_writes(false);
    f.shard.ingest(&[record("A", 2)]).unwrap();
    f.shard.switch_group_buffers(group).unwrap();
    let response = f
        .shard
        .create_flush_task(FlushGroup {
            group_num: group,
            flush_watermark: 200,
        })
        .execute();
    assert_eq!(response, FlushResponse::Success);
    assert_eq!(f.shard.group_watermark(group), 200);
}

#[test]
fn key_write_failure_drops_data() {
    let f = fixture();
    let group = ingest_one(&f, "A", 1);
    f.sink.set_fail_key_writes(true);

    f.shard.switch_group_buffers(group).unwrap();
    let response = f
        .shard
        .create_flush_task(FlushGroup {
            group_num: group,
            flush_watermark: 100,
        })
        .execute();

    assert_eq!(response, FlushResponse::DataDropped);
    assert_eq!(f.shard.stats().flushes_failed_partition_write(), 1);
    assert_eq!(f.shard.group_watermark(group), 0);
}

#[test]
fn metastore_failure_drops_data_without_advancing() {
    let f = fixture();
    let group = ingest_one(&f, "A", 1);
    f.metastore.set_fail_writes(true);

    f.shard.switch_group_buffers(group).unwrap();
    let response = f
        .shard
        .create_flush_task(FlushGroup {
            group_num: group,
            flush_watermark: 100,
        })
        .execute();

    assert_eq!(response, FlushResponse::DataDropped);
    assert_eq!(f.shard.group_watermark(group), 0);
    assert_eq!(f.shard.stats().flushes_failed_other(), 1);

    // Replay below the (unadvanced) watermark is not suppressed.
    f.shard.ingest(&[record("A", 3)]).unwrap();
    assert_eq!(f.shard.stats().rows_skipped(), 0);
}

#[test]
fn non_positive_watermark_short_circuits() {
    let f = fixture();
    let group = ingest_one(&f, "A", 1);

    f.shard.switch_group_buffers(group).unwrap();
    let response = f
        .shard
        .create_flush_task(FlushGroup {
            group_num: group,
            flush_watermark: 0,
        })
        .execute();

    // Chunks may flow to the sink, but no checkpoint is written.
    assert_eq!(response, FlushResponse::NotApplied);
    assert_eq!(f.metastore.checkpoint("telemetry", 0, group), None);
    assert_eq!(f.shard.group_watermark(group), 0);
}

#[test]
fn watermarks_only_grow_across_flush_cycles() {
    let f = fixture();
    let group = ingest_one(&f, "A", 1);

    let mut watermarks = Vec::new();
    for (i, flush_watermark) in [10i64, 30, 20, 40].into_iter().enumerate() {
        f.shard.ingest(&[record("A", 100 + i as i64)]).unwrap();
        f.shard.switch_group_buffers(group).unwrap();
        f.shard
            .create_flush_task(FlushGroup {
                group_num: group,
                flush_watermark,
            })
            .execute();
        watermarks.push(f.shard.group_watermark(group));
    }

    assert_eq!(watermarks, vec![10, 30, 30, 40]);
}

#[test]
fn multi_partition_group_flushes_every_member() {
    let f = fixture();
    // Find several keys landing in one group.
    let mut names = Vec::new();
    let mut target = None;
    for i in 0..64 {
        let name = format!("s{i}");
        let group = f
            .shard
            .group_for_labels(&[Label::new("series", &name)])
            .unwrap();
        match target {
            None => {
                target = Some(group);
                names.push(name);
            }
            Some(t) if group == t => names.push(name),
            _ => {}
        }
        if names.len() == 3 {
            break;
        }
    }
    let group = target.unwrap();
    assert_eq!(names.len(), 3, "expected three keys in group {group}");

    for (i, name) in names.iter().enumerate() {
        f.shard.ingest(&[record(name, i as i64 + 1)]).unwrap();
    }

    f.shard.switch_group_buffers(group).unwrap();
    let response = f
        .shard
        .create_flush_task(FlushGroup {
            group_num: group,
            flush_watermark: 10,
        })
        .execute();

    assert_eq!(response, FlushResponse::Success);
    assert_eq!(f.sink.written_chunks().len(), 3);
    assert_eq!(f.sink.written_keys().len(), 3);
}
