use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use conveyor::config::{ConsumerConfig, DiskQueueConfig};
use conveyor::elastic::first_action_id;
use conveyor::pipeline::{
    ConsumerProcessorConfig, PipelineContext, Processor, ProcessorChain, QueueConsumerProcessor,
};
use conveyor::queue::{Message, Offset, QueueSelector};
use conveyor::Runtime;
use tempfile::tempdir;
use xxhash_rust::xxh32::xxh32;

fn queue_config() -> DiskQueueConfig {
    let mut cfg = DiskQueueConfig::default();
    cfg.warning_free_bytes = 0;
    cfg.reserved_free_bytes = 0;
    cfg
}

fn bulk_line(id: &str) -> Vec<u8> {
    format!("{{\"index\":{{\"_index\":\"logs\",\"_id\":\"{id}\"}}}}\n{{\"n\":{id}}}\n").into_bytes()
}

#[test]
fn hash_partition_matches_id_and_falls_back_to_offset() {
    let with_id = Message {
        data: bulk_line("42"),
        size: 0,
        offset: Offset::new(0, 1000),
        next_offset: Offset::new(0, 1040),
    };
    let expected = xxh32(b"42", 0) as usize % 3;
    assert_eq!(QueueConsumerProcessor::slice_for_message(&with_id, 3), expected);
    // Deterministic across calls.
    assert_eq!(QueueConsumerProcessor::slice_for_message(&with_id, 3), expected);

    let without_id = Message {
        data: b"{\"index\":{\"_index\":\"logs\"}}\n{}\n".to_vec(),
        size: 0,
        offset: Offset::new(0, 1000),
        next_offset: Offset::new(0, 1032),
    };
    assert_eq!(QueueConsumerProcessor::slice_for_message(&without_id, 3), 1000 % 3);
}

struct SliceRecorder {
    seen: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl Processor for SliceRecorder {
    fn name(&self) -> &str {
        "slice_recorder"
    }

    fn process(&self, ctx: &PipelineContext) -> anyhow::Result<()> {
        let messages = ctx.take_messages();
        // Every message of one invocation belongs to the same slice.
        let slices: Vec<usize> = messages
            .iter()
            .map(|m| QueueConsumerProcessor::slice_for_message(m, 3))
            .collect();
        if let Some(first) = slices.first() {
            assert!(slices.iter().all(|s| s == first), "mixed slices in one batch");
        }
        let mut seen = self.seen.lock().unwrap();
        for (message, slice) in messages.iter().zip(slices) {
            let id = first_action_id(&message.data).expect("id present");
            let previous = seen.insert(id.clone(), slice);
            assert!(previous.is_none(), "duplicate delivery of {id}");
        }
        Ok(())
    }
}

#[test]
fn three_slices_partition_nine_ids_exactly_once() {
    let dir = tempdir().expect("tempdir");
    let runtime = Runtime::open(dir.path(), queue_config()).expect("runtime");

    runtime
        .registry
        .register(conveyor::queue::QueueConfig::new("q1").with_label("kind", "bulk"));
    for id in 1..=9 {
        runtime.push("q1", &bulk_line(&id.to_string())).expect("append");
    }
    let queue = runtime.registry.get("q1").unwrap();

    let seen = Arc::new(Mutex::new(BTreeMap::new()));
    let chain = ProcessorChain::new(vec![Box::new(SliceRecorder {
        seen: Arc::clone(&seen),
    })]);

    let mut config = ConsumerProcessorConfig::default();
    config.num_of_slices = 3;
    config.detect_active_queue = false;
    config.quit_on_eof_queue = true;
    config.queue_selector = QueueSelector::default().with_label("kind", "bulk");
    config.consumer = ConsumerConfig {
        fetch_max_messages: 100,
        eof_retry_delay_in_ms: 5,
        fetch_max_wait_ms: 100,
        ..Default::default()
    };

    let processor = QueueConsumerProcessor::new(config, Arc::clone(&runtime), chain);
    let ctx = PipelineContext::new();
    processor.process(&ctx).expect("process");
    assert!(!ctx.has_errors(), "worker errors: {:?}", ctx.errors());

    // Exactly once across slices, each id on its hash-assigned slice.
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 9);
    for (id, slice) in seen.iter() {
        assert_eq!(*slice, xxh32(id.as_bytes(), 0) as usize % 3, "id {id}");
    }

    // Every slice group committed the full read window.
    let latest = runtime.queues.latest_offset(&queue.id).unwrap();
    for slice in 0..3 {
        let committed = runtime
            .offsets
            .get(&queue.id, &format!("group-001-{slice}"), "consumer-001")
            .unwrap();
        assert_eq!(committed, latest, "slice {slice}");
    }
}
