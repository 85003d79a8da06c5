use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use conveyor::config::{ConsumerConfig, DiskQueueConfig};
use conveyor::pipeline::{
    ConsumerProcessorConfig, PipelineContext, Processor, ProcessorChain, QueueConsumerProcessor,
};
use conveyor::queue::{Offset, QueueSelector};
use conveyor::Runtime;
use tempfile::tempdir;

fn queue_config() -> DiskQueueConfig {
    let mut cfg = DiskQueueConfig::default();
    cfg.warning_free_bytes = 0;
    cfg.reserved_free_bytes = 0;
    cfg
}

struct AlwaysFails {
    calls: Arc<AtomicUsize>,
}

impl Processor for AlwaysFails {
    fn name(&self) -> &str {
        "always_fails"
    }

    fn process(&self, _ctx: &PipelineContext) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("downstream rejected the batch")
    }
}

/// A failing inner chain marks the slice FAILED without advancing the
/// offset, and once every slice has failed the processor refuses the queue.
#[test]
fn failed_slices_preserve_offsets_and_block_the_queue() {
    let dir = tempdir().expect("tempdir");
    let runtime = Runtime::open(dir.path(), queue_config()).expect("runtime");

    let queue = runtime.registry.get_or_init("q1");
    // No _id in the meta lines: partitioning falls back to the byte offset,
    // and the odd record size makes the slices alternate deterministically.
    for _ in 0..4 {
        runtime
            .push("q1", b"{\"index\":{\"_index\":\"logs\"}}\n{}\n")
            .expect("append");
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let mut config = ConsumerProcessorConfig::default();
    config.num_of_slices = 2;
    config.detect_active_queue = false;
    config.quit_on_eof_queue = true;
    config.queue_selector = QueueSelector {
        keys: vec!["q1".to_string()],
        ..Default::default()
    };
    config.consumer = ConsumerConfig {
        fetch_max_messages: 100,
        fetch_max_wait_ms: 100,
        eof_retry_delay_in_ms: 5,
        ..Default::default()
    };

    let processor = QueueConsumerProcessor::new(
        config,
        Arc::clone(&runtime),
        ProcessorChain::new(vec![Box::new(AlwaysFails {
            calls: Arc::clone(&calls),
        })]),
    );
    let ctx = PipelineContext::new();
    processor.process(&ctx).expect("process returns");

    // Both slice workers hit the failing chain and surfaced it.
    assert!(ctx.has_errors());
    assert_eq!(ctx.stat(&format!("{}FAILED_SLICES", queue.id)), 2);
    let first_round = calls.load(Ordering::SeqCst);
    assert!(first_round >= 2);

    // Nothing was committed for either slice group.
    for slice in 0..2 {
        let committed = runtime
            .offsets
            .get(&queue.id, &format!("group-001-{slice}"), "consumer-001")
            .unwrap();
        assert_eq!(committed, Offset::default(), "slice {slice}");
    }

    // With every slice failed the queue is refused outright.
    processor.process(&ctx).expect("process returns");
    assert_eq!(calls.load(Ordering::SeqCst), first_round);

    // Clearing the counter lets the queue run again.
    ctx.clear_stat(&format!("{}FAILED_SLICES", queue.id));
    processor.process(&ctx).expect("process returns");
    assert!(calls.load(Ordering::SeqCst) > first_round);
}
