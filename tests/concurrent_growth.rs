use std::time::{Duration, Instant};

use conveyor::config::{ConsumerConfig, DiskQueueConfig};
use conveyor::queue::{FetchContext, Offset};
use conveyor::Runtime;
use tempfile::tempdir;

fn queue_config() -> DiskQueueConfig {
    let mut cfg = DiskQueueConfig::default();
    cfg.warning_free_bytes = 0;
    cfg.reserved_free_bytes = 0;
    cfg
}

fn fast_consumer() -> ConsumerConfig {
    let mut cfg = ConsumerConfig::default();
    cfg.fetch_max_messages = 100;
    cfg.eof_retry_delay_in_ms = 5;
    cfg.fetch_max_wait_ms = 100;
    cfg
}

#[test]
fn cursor_follows_growth_of_the_current_segment() {
    let dir = tempdir().expect("tempdir");
    let runtime = Runtime::open(dir.path(), queue_config()).expect("runtime");

    runtime.push("q1", b"first").expect("append");
    let queue = runtime.registry.get("q1").unwrap();

    let mut consumer = runtime
        .queues
        .acquire_consumer(&queue.id, &fast_consumer(), Offset::default())
        .expect("consumer");
    let mut fctx = FetchContext::default();

    let messages = consumer.fetch(&mut fctx).expect("first fetch");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, b"first");
    let after_first = fctx.next_offset;

    // The writer keeps appending to the same segment after the cursor
    // observed its end.
    runtime.push("q1", b"second").expect("append");
    runtime.push("q1", b"third").expect("append");

    let messages = consumer.fetch(&mut fctx).expect("second fetch");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].data, b"second");
    assert_eq!(messages[1].data, b"third");
    assert_eq!(messages[0].offset, after_first);
    assert!(fctx.next_offset > after_first);

    // At the head again: an empty fetch is not an error.
    let messages = consumer.fetch(&mut fctx).expect("head fetch");
    assert!(messages.is_empty());
}

#[test]
fn cursor_follows_writer_while_appending_concurrently() {
    let dir = tempdir().expect("tempdir");
    let mut cfg = queue_config();
    cfg.max_bytes_per_file = 64;
    let runtime = Runtime::open(dir.path(), cfg).expect("runtime");
    runtime.registry.get_or_init("q1");
    runtime.get_or_init_consumer_config("q1", "g1", "c1");

    let writer_runtime = std::sync::Arc::clone(&runtime);
    let writer = std::thread::spawn(move || {
        for n in 0..50 {
            writer_runtime
                .push("q1", format!("msg-{n:04}").as_bytes())
                .expect("append");
            std::thread::sleep(Duration::from_millis(2));
        }
    });

    let queue = runtime.registry.get("q1").unwrap();
    let mut consumer = runtime
        .queues
        .acquire_consumer(&queue.id, &fast_consumer(), Offset::default())
        .expect("consumer");
    let mut fctx = FetchContext::default();
    let mut seen = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while seen.len() < 50 {
        assert!(Instant::now() < deadline, "reader fell behind for 10s");
        let messages = consumer.fetch(&mut fctx).expect("fetch");
        for message in messages {
            seen.push(String::from_utf8(message.data).unwrap());
        }
    }
    writer.join().unwrap();

    // Strict append order, no phantoms, no gaps.
    let expected: Vec<String> = (0..50).map(|n| format!("msg-{n:04}")).collect();
    assert_eq!(seen, expected);
}

#[test]
fn paused_queue_blocks_fetch_until_resume() {
    let dir = tempdir().expect("tempdir");
    let runtime = Runtime::open(dir.path(), queue_config()).expect("runtime");
    runtime.push("q1", b"payload").expect("append");
    let queue = runtime.registry.get("q1").unwrap();

    runtime.queues.pause_read(&queue.id);

    let reader_runtime = std::sync::Arc::clone(&runtime);
    let queue_id = queue.id.clone();
    let reader = std::thread::spawn(move || {
        let mut consumer = reader_runtime
            .queues
            .acquire_consumer(&queue_id, &fast_consumer(), Offset::default())
            .expect("consumer");
        let mut fctx = FetchContext::default();
        consumer.fetch(&mut fctx).expect("fetch")
    });

    // Reader should be parked on the pause gate, not returning.
    std::thread::sleep(Duration::from_millis(150));
    assert!(!reader.is_finished());

    runtime.queues.resume_read(&queue.id);
    let messages = reader.join().expect("reader thread");
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, b"payload");
}
