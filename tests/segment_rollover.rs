use conveyor::config::{ConsumerConfig, DiskQueueConfig};
use conveyor::queue::{segment_path, FetchContext, Offset};
use conveyor::Runtime;
use tempfile::tempdir;

fn queue_config(max_bytes_per_file: u64) -> DiskQueueConfig {
    let mut cfg = DiskQueueConfig::default();
    cfg.max_bytes_per_file = max_bytes_per_file;
    cfg.warning_free_bytes = 0;
    cfg.reserved_free_bytes = 0;
    cfg
}

fn fast_consumer() -> ConsumerConfig {
    let mut cfg = ConsumerConfig::default();
    cfg.fetch_max_messages = 10;
    cfg.eof_retry_delay_in_ms = 10;
    cfg.fetch_max_wait_ms = 200;
    cfg
}

#[test]
fn three_messages_span_two_segments_and_read_back() {
    let dir = tempdir().expect("tempdir");
    let runtime = Runtime::open(dir.path(), queue_config(40)).expect("runtime");

    for op in ["a", "b", "c"] {
        runtime
            .push("q1", format!("{{\"op\":\"{op}\"}}").as_bytes())
            .expect("append");
    }
    let queue = runtime.registry.get("q1").expect("registered");
    let queue_dir = runtime.queues.queue_dir(&queue.id);

    // Each record is 4 + 10 bytes; the third would cross the 40-byte cap, so
    // segment 0 holds a+b and segment 1 holds c.
    assert!(segment_path(&queue_dir, 0).exists());
    assert!(segment_path(&queue_dir, 1).exists());
    assert_eq!(runtime.queues.writer_segment(&queue.id).unwrap(), 1);

    let mut consumer = runtime
        .queues
        .acquire_consumer(&queue.id, &fast_consumer(), Offset::default())
        .expect("consumer");
    let mut fctx = FetchContext::default();
    let messages = consumer.fetch(&mut fctx).expect("fetch");

    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].data, br#"{"op":"a"}"#);
    assert_eq!(messages[1].data, br#"{"op":"b"}"#);
    assert_eq!(messages[2].data, br#"{"op":"c"}"#);
    assert_eq!(messages[0].offset, Offset::new(0, 0));
    assert_eq!(messages[1].offset, Offset::new(0, 14));
    assert_eq!(messages[2].offset, Offset::new(1, 0));
    assert_eq!(messages[2].next_offset, Offset::new(1, 14));

    // Committing the fetch window lands exactly on the writer head.
    let latest = runtime.queues.latest_offset(&queue.id).unwrap();
    assert_eq!(fctx.next_offset, latest);
    runtime
        .offsets
        .commit(&queue.id, "g1", "c1", fctx.next_offset)
        .expect("commit");
    assert_eq!(
        runtime.offsets.get(&queue.id, "g1", "c1").unwrap(),
        Offset::new(1, 14)
    );
}

#[test]
fn restart_preserves_appended_messages() {
    let dir = tempdir().expect("tempdir");
    {
        let runtime = Runtime::open(dir.path(), queue_config(40)).expect("runtime");
        runtime.push("q1", br#"{"op":"a"}"#).expect("append");
        runtime.close().expect("close");
    }

    let runtime = Runtime::open(dir.path(), queue_config(40)).expect("reopen");
    let queue = runtime.registry.get("q1").expect("config survives restart");
    let mut consumer = runtime
        .queues
        .acquire_consumer(&queue.id, &fast_consumer(), Offset::default())
        .expect("consumer");
    let mut fctx = FetchContext::default();
    let messages = consumer.fetch(&mut fctx).expect("fetch");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, br#"{"op":"a"}"#);
}

#[test]
fn compressed_payloads_roundtrip() {
    let dir = tempdir().expect("tempdir");
    let mut cfg = queue_config(1024 * 1024);
    cfg.compress.message.enabled = true;
    let runtime = Runtime::open(dir.path(), cfg).expect("runtime");

    let payload = vec![b'x'; 4096];
    runtime.push("q1", &payload).expect("append");
    let queue = runtime.registry.get("q1").unwrap();

    let mut consumer = runtime
        .queues
        .acquire_consumer(&queue.id, &fast_consumer(), Offset::default())
        .expect("consumer");
    let mut fctx = FetchContext::default();
    let messages = consumer.fetch(&mut fctx).expect("fetch");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, payload);
    // Stored size reflects the compressed frame, not the logical payload.
    assert!(messages[0].size < payload.len());
}
