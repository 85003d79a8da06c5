//! Pipelines: named, ordered chains of processors with a supervised
//! lifecycle.

mod consumer;
mod context;
mod runtime;

pub use consumer::{ConsumerProcessorConfig, QueueConsumerProcessor};
pub use context::{PipelineContext, RunningState};
pub use runtime::{PipelineConfig, PipelineRuntime};

/// One stage of a pipeline. Processors are shared across restarts of their
/// pipeline, so state lives behind interior mutability.
pub trait Processor: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, ctx: &PipelineContext) -> anyhow::Result<()>;

    /// Drop resources held across runs. Called once at runtime shutdown.
    fn release(&self) {}
}

/// Processors run in order; the first error aborts the run. Cancellation is
/// checked between stages.
pub struct ProcessorChain {
    processors: Vec<Box<dyn Processor>>,
}

impl ProcessorChain {
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self { processors }
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn process(&self, ctx: &PipelineContext) -> anyhow::Result<()> {
        for processor in &self.processors {
            if ctx.is_canceled() {
                return Ok(());
            }
            log::trace!("start processing [{}]", processor.name());
            processor
                .process(ctx)
                .map_err(|err| err.context(format!("processor [{}]", processor.name())))?;
            log::trace!("end processing [{}]", processor.name());
        }
        Ok(())
    }

    pub fn release(&self) {
        for processor in &self.processors {
            processor.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Recorder {
        name: String,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Processor for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn process(&self, _ctx: &PipelineContext) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }
    }

    #[test]
    fn chain_stops_at_first_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = ProcessorChain::new(vec![
            Box::new(Recorder {
                name: "ok".into(),
                calls: Arc::clone(&calls),
                fail: false,
            }),
            Box::new(Recorder {
                name: "bad".into(),
                calls: Arc::clone(&calls),
                fail: true,
            }),
            Box::new(Recorder {
                name: "unreached".into(),
                calls: Arc::clone(&calls),
                fail: false,
            }),
        ]);
        let ctx = PipelineContext::new();
        let err = chain.process(&ctx).unwrap_err();
        assert!(err.to_string().contains("bad"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn chain_skips_work_when_canceled() {
        let calls = Arc::new(AtomicUsize::new(0));
        let chain = ProcessorChain::new(vec![Box::new(Recorder {
            name: "ok".into(),
            calls: Arc::clone(&calls),
            fail: false,
        })]);
        let ctx = PipelineContext::new();
        ctx.cancel();
        chain.process(&ctx).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
