//! Pipeline supervision.
//!
//! Each pipeline runs its control loop on a dedicated thread: run the chain,
//! classify the outcome, restart after `retry_delay_in_ms` when
//! `keep_running` asks for it, park on terminal states until resumed.
//! Shutdown cancels every context and waits for quiescence inside a bounded
//! grace period.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::pipeline::context::{PipelineContext, RunningState};
use crate::pipeline::ProcessorChain;
use crate::{Error, Result};

const CONTROL_TICK: Duration = Duration::from_millis(100);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub name: String,
    pub auto_start: bool,
    pub keep_running: bool,
    pub retry_delay_in_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            auto_start: true,
            keep_running: false,
            retry_delay_in_ms: 1000,
        }
    }
}

struct PipelineEntry {
    ctx: Arc<PipelineContext>,
    chain: Arc<ProcessorChain>,
    handle: Option<JoinHandle<()>>,
}

pub struct PipelineRuntime {
    pipelines: Mutex<HashMap<String, PipelineEntry>>,
    started: AtomicBool,
    shutdown_grace: Duration,
}

impl Default for PipelineRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineRuntime {
    pub fn new() -> Self {
        Self {
            pipelines: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Register a pipeline and spawn its control loop.
    pub fn register(&self, cfg: PipelineConfig, chain: ProcessorChain) -> Arc<PipelineContext> {
        let ctx = Arc::new(PipelineContext::new());
        let chain = Arc::new(chain);

        if cfg.auto_start {
            ctx.starting();
        }

        let handle = {
            let cfg = cfg.clone();
            let ctx = Arc::clone(&ctx);
            let chain = Arc::clone(&chain);
            std::thread::Builder::new()
                .name(format!("pipeline-{}", cfg.name))
                .spawn(move || control_loop(cfg, ctx, chain))
                .expect("spawn pipeline thread")
        };

        let mut pipelines = self.pipelines.lock().expect("pipelines lock");
        pipelines.insert(
            cfg.name.clone(),
            PipelineEntry {
                ctx: Arc::clone(&ctx),
                chain,
                handle: Some(handle),
            },
        );
        self.started.store(true, Ordering::SeqCst);
        ctx
    }

    pub fn context(&self, name: &str) -> Option<Arc<PipelineContext>> {
        self.pipelines
            .lock()
            .expect("pipelines lock")
            .get(name)
            .map(|entry| Arc::clone(&entry.ctx))
    }

    pub fn states(&self) -> HashMap<String, RunningState> {
        self.pipelines
            .lock()
            .expect("pipelines lock")
            .iter()
            .map(|(name, entry)| (name.clone(), entry.ctx.state()))
            .collect()
    }

    /// Resume a stopped/failed/finished pipeline.
    pub fn start_task(&self, name: &str) -> Result<()> {
        let ctx = self
            .context(name)
            .ok_or_else(|| Error::NotFound(format!("pipeline [{name}]")))?;
        ctx.resume();
        if ctx.state() != RunningState::Started {
            ctx.starting();
        }
        Ok(())
    }

    /// Cancel a running pipeline and let its loop park.
    pub fn stop_task(&self, name: &str) -> Result<()> {
        let ctx = self
            .context(name)
            .ok_or_else(|| Error::NotFound(format!("pipeline [{name}]")))?;
        if matches!(
            ctx.state(),
            RunningState::Started | RunningState::Starting
        ) {
            ctx.cancel();
            ctx.stopping();
        }
        Ok(())
    }

    /// Cancel everything and wait for workers to reach their cleanup points.
    /// Fails when the grace period runs out with pipelines still live.
    pub fn shutdown(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        log::debug!("shutting down pipeline runtime");
        let start = Instant::now();

        {
            let pipelines = self.pipelines.lock().expect("pipelines lock");
            for (name, entry) in pipelines.iter() {
                log::trace!("stopping pipeline [{name}], state {:?}", entry.ctx.state());
                entry.ctx.cancel();
                entry.ctx.stopping();
                entry.ctx.exit();
            }
        }

        loop {
            let live: Vec<String> = {
                let pipelines = self.pipelines.lock().expect("pipelines lock");
                pipelines
                    .iter()
                    .filter(|(_, entry)| {
                        matches!(
                            entry.ctx.state(),
                            RunningState::Started
                                | RunningState::Starting
                                | RunningState::Stopping
                        )
                    })
                    .map(|(name, _)| name.clone())
                    .collect()
            };
            if live.is_empty() {
                break;
            }
            if start.elapsed() > self.shutdown_grace {
                log::error!("pipeline runtime failed to stop tasks: {live:?}");
                return Err(Error::Unsupported(
                    "pipeline runtime failed to stop tasks within the grace period",
                ));
            }
            std::thread::sleep(CONTROL_TICK);
        }

        let mut pipelines = self.pipelines.lock().expect("pipelines lock");
        for entry in pipelines.values_mut() {
            if let Some(handle) = entry.handle.take() {
                let _ = handle.join();
            }
            entry.chain.release();
        }
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }
}

fn control_loop(cfg: PipelineConfig, ctx: Arc<PipelineContext>, chain: Arc<ProcessorChain>) {
    log::debug!("processing pipeline [{}]", cfg.name);
    loop {
        match ctx.state() {
            RunningState::Starting => {
                ctx.started();
                log::debug!("pipeline [{}] start running", cfg.name);
                let result = chain.process(&ctx);

                match result {
                    Err(err) => {
                        log::error!("error on pipeline [{}]: {err:#}", cfg.name);
                        ctx.record_error(format!("{err:#}"));
                        ctx.failed();
                        if cfg.keep_running && !ctx.is_exited() {
                            retry_sleep(&cfg, &ctx);
                            if !ctx.is_exited() {
                                ctx.resume();
                            }
                        }
                    }
                    Ok(()) => {
                        if ctx.state() == RunningState::Stopping {
                            ctx.stopped();
                        } else if cfg.keep_running && !ctx.is_exited() {
                            log::trace!(
                                "pipeline [{}] end running, restart in {}ms",
                                cfg.name,
                                cfg.retry_delay_in_ms
                            );
                            ctx.finished();
                            retry_sleep(&cfg, &ctx);
                            if !ctx.is_exited() {
                                ctx.resume();
                            }
                        } else {
                            log::debug!("pipeline [{}] finished", cfg.name);
                            ctx.finished();
                        }
                    }
                }
            }
            RunningState::Stopping => {
                ctx.cancel();
                ctx.stopped();
            }
            RunningState::Stopped | RunningState::Failed | RunningState::Finished => {
                if ctx.is_exited() {
                    break;
                }
                std::thread::sleep(CONTROL_TICK);
            }
            RunningState::Started => {
                // Chain still unwinding after an external transition attempt.
                std::thread::sleep(CONTROL_TICK);
            }
        }
    }
    log::debug!("pipeline [{}] control loop exited", cfg.name);
}

fn retry_sleep(cfg: &PipelineConfig, ctx: &PipelineContext) {
    let deadline = Instant::now() + Duration::from_millis(cfg.retry_delay_in_ms);
    while Instant::now() < deadline {
        if ctx.is_exited() {
            return;
        }
        std::thread::sleep(CONTROL_TICK.min(Duration::from_millis(10)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Processor;
    use std::sync::atomic::AtomicUsize;

    struct CountingProcessor {
        runs: Arc<AtomicUsize>,
    }

    impl Processor for CountingProcessor {
        fn name(&self) -> &str {
            "counting"
        }

        fn process(&self, _ctx: &PipelineContext) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn one_shot_pipeline_finishes() {
        let runtime = PipelineRuntime::new().with_shutdown_grace(Duration::from_secs(5));
        let runs = Arc::new(AtomicUsize::new(0));
        runtime.register(
            PipelineConfig {
                name: "p1".into(),
                auto_start: true,
                keep_running: false,
                retry_delay_in_ms: 10,
            },
            ProcessorChain::new(vec![Box::new(CountingProcessor {
                runs: Arc::clone(&runs),
            })]),
        );
        wait_for(|| runtime.states().get("p1") == Some(&RunningState::Finished));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        runtime.shutdown().unwrap();
    }

    #[test]
    fn keep_running_pipeline_restarts_until_shutdown() {
        let runtime = PipelineRuntime::new().with_shutdown_grace(Duration::from_secs(5));
        let runs = Arc::new(AtomicUsize::new(0));
        runtime.register(
            PipelineConfig {
                name: "p1".into(),
                auto_start: true,
                keep_running: true,
                retry_delay_in_ms: 5,
            },
            ProcessorChain::new(vec![Box::new(CountingProcessor {
                runs: Arc::clone(&runs),
            })]),
        );
        wait_for(|| runs.load(Ordering::SeqCst) >= 3);
        runtime.shutdown().unwrap();
        let after = runs.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), after);
    }

    #[test]
    fn stopped_pipeline_can_resume() {
        let runtime = PipelineRuntime::new().with_shutdown_grace(Duration::from_secs(5));
        let runs = Arc::new(AtomicUsize::new(0));
        runtime.register(
            PipelineConfig {
                name: "p1".into(),
                auto_start: false,
                keep_running: false,
                retry_delay_in_ms: 10,
            },
            ProcessorChain::new(vec![Box::new(CountingProcessor {
                runs: Arc::clone(&runs),
            })]),
        );
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        runtime.start_task("p1").unwrap();
        wait_for(|| runs.load(Ordering::SeqCst) == 1);
        runtime.shutdown().unwrap();
    }
}
