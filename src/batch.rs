// src/batch.rs
//
// =============================================================================
// RELAXRUN: BATCH RUNNER
// =============================================================================
//
// Discovers structures in the shared folder and runs a fixed pool of worker
// loops over them. Workers share nothing in memory; the lock files under the
// root are the only coordination.
//
// Worker loop per seed:
//   skip if locked -> exclusive claim -> advisory jobs-log append ->
//   run the driver -> release.
//
// Local failures keep the worker going; Input/FatalExecutor stop the batch
// with a non-zero exit; walltime (or interrupt) is a clean soft-stop.

use crate::codec::Codec;
use crate::config::{ComputeConfig, RunMode};
use crate::core::{CellOptions, ParamOptions, StructDoc};
use crate::driver::{RelaxationDriver, RunOutcome};
use crate::errors::ComputeError;
use crate::logs::SeedSinks;
use crate::workspace::Workspace;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

pub struct BatchRun {
    root: PathBuf,
    nprocesses: usize,
    config: ComputeConfig,
    cell: CellOptions,
    param: ParamOptions,
    codec: Arc<dyn Codec>,
    sinks: SeedSinks,
    shutdown: Arc<AtomicBool>,
    results_tx: Option<UnboundedSender<StructDoc>>,
}

impl std::fmt::Debug for BatchRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchRun")
            .field("root", &self.root)
            .field("nprocesses", &self.nprocesses)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BatchRun {
    /// Validate the allocation, parse the shared cell/param templates and
    /// prepare the pool. `template_seed` names `<seed>.cell`/`<seed>.param`.
    pub fn new(
        root: impl Into<PathBuf>,
        template_seed: &str,
        nprocesses: usize,
        config: ComputeConfig,
        codec: Arc<dyn Codec>,
        sinks: SeedSinks,
    ) -> Result<Self, ComputeError> {
        let root = root.into();
        config.validate()?;

        if nprocesses == 0 {
            return Err(ComputeError::Input("nprocesses must be at least 1".into()));
        }
        let all_cores = num_cpus::get();
        if config.ncores * nprocesses > all_cores {
            return Err(ComputeError::Input(format!(
                "requested more cores ({}) than available ({all_cores})",
                config.ncores * nprocesses
            )));
        }

        // generic mode takes the executable as-is; castep mode needs the
        // shared templates
        let (cell, param) = if config.mode == RunMode::Castep {
            let cell = codec
                .parse_cell_options(&root.join(format!("{template_seed}.cell")))
                .map_err(|e| ComputeError::Input(format!("failed to parse cell template: {e}")))?;
            let param = codec
                .parse_param_options(&root.join(format!("{template_seed}.param")))
                .map_err(|e| {
                    ComputeError::Input(format!("failed to parse param template: {e}"))
                })?;
            (cell, param)
        } else {
            (CellOptions::default(), ParamOptions::default())
        };

        Ok(Self {
            root,
            nprocesses,
            config,
            cell,
            param,
            codec,
            sinks,
            shutdown: Arc::new(AtomicBool::new(false)),
            results_tx: None,
        })
    }

    /// Stream every finalised structure document to a channel.
    pub fn with_results_channel(mut self, tx: UnboundedSender<StructDoc>) -> Self {
        self.results_tx = Some(tx);
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Every claimable `.res` in the root, sorted for deterministic sweeps.
    pub fn discover_seeds(root: &Path) -> Vec<String> {
        let mut seeds: Vec<String> = std::fs::read_dir(root)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| {
                        p.is_file() && p.extension().and_then(|x| x.to_str()) == Some("res")
                    })
                    .filter_map(|p| {
                        p.file_stem()
                            .and_then(|s| s.to_str())
                            .map(|s| s.to_string())
                    })
                    .collect()
            })
            .unwrap_or_default();
        seeds.sort();
        seeds
    }

    /// Spawn the worker pool and wait for it to drain. Returns the number of
    /// successfully completed structures.
    pub async fn spawn(&self) -> Result<usize, ComputeError> {
        let seeds = Self::discover_seeds(&self.root);
        if seeds.is_empty() {
            return Err(ComputeError::Input(format!(
                "no .res files found in {}",
                self.root.display()
            )));
        }
        log::info!(
            "running {} structures across {} workers",
            seeds.len(),
            self.nprocesses
        );

        // interrupts drain the pool exactly like a walltime kill
        let signal_flag = self.shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupt received, stopping all workers");
                signal_flag.store(true, Ordering::SeqCst);
            }
        });

        let mut handles = Vec::new();
        for worker_id in 0..self.nprocesses {
            let ctx = WorkerContext {
                worker_id,
                root: self.root.clone(),
                seeds: seeds.clone(),
                config: self.config.clone(),
                cell: self.cell.clone(),
                param: self.param.clone(),
                codec: self.codec.clone(),
                sinks: self.sinks.clone(),
                shutdown: self.shutdown.clone(),
                results_tx: self.results_tx.clone(),
            };
            handles.push(tokio::spawn(ctx.run()));
        }

        let mut completed = 0;
        let mut fatal: Option<ComputeError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(count)) => completed += count,
                Ok(Err(e)) => {
                    // first fatal error wins; ask the rest to stop
                    self.shutdown.store(true, Ordering::SeqCst);
                    if fatal.is_none() {
                        fatal = Some(e);
                    }
                }
                Err(e) => {
                    self.shutdown.store(true, Ordering::SeqCst);
                    if fatal.is_none() {
                        fatal = Some(ComputeError::FatalExecutor(format!(
                            "worker panicked: {e}"
                        )));
                    }
                }
            }
        }

        match fatal {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }
}

// ============================================================================
// THE WORKER LOOP
// ============================================================================

struct WorkerContext {
    worker_id: usize,
    root: PathBuf,
    seeds: Vec<String>,
    config: ComputeConfig,
    cell: CellOptions,
    param: ParamOptions,
    codec: Arc<dyn Codec>,
    sinks: SeedSinks,
    shutdown: Arc<AtomicBool>,
    results_tx: Option<UnboundedSender<StructDoc>>,
}

impl WorkerContext {
    async fn run(self) -> Result<usize, ComputeError> {
        let mut completed = 0;

        for seed in &self.seeds {
            if self.shutdown.load(Ordering::SeqCst) {
                log::info!("worker {} stopping on shutdown flag", self.worker_id);
                break;
            }

            let workspace = Workspace::new(&self.root, self.config.compute_dir.clone());

            // the structure may already have been finished and moved away
            if !self.root.join(format!("{seed}.res")).is_file() {
                continue;
            }
            // spec'd fast path: an existing lock means another worker owns it
            if workspace.is_locked(seed) {
                log::debug!("worker {}: {seed} is locked, skipping", self.worker_id);
                continue;
            }
            match workspace.claim(seed) {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!("worker {}: lost claim race on {seed}", self.worker_id);
                    continue;
                }
                Err(e) => {
                    log::warn!("worker {}: could not claim {seed}: {e}", self.worker_id);
                    continue;
                }
            }
            workspace.append_jobs_log(seed);
            if let Err(e) = self.sinks.register(seed, &self.root) {
                log::warn!("could not open per-seed log for {seed}: {e}");
            }

            let mut driver = RelaxationDriver::new(
                seed.clone(),
                self.config.clone(),
                self.cell.clone(),
                self.param.clone(),
                self.codec.clone(),
                workspace,
                self.shutdown.clone(),
                self.results_tx.clone(),
            );
            let result = driver.run().await;

            // the claim ends here whatever happened; moves and walltime
            // cleanup have usually removed the lock already
            Workspace::new(&self.root, None).release(seed);
            self.sinks.unregister(seed);

            match result {
                Ok(RunOutcome::Optimised(_)) => {
                    log::info!("completed {seed}");
                    completed += 1;
                }
                Ok(RunOutcome::StructureFailed(reason)) => {
                    log::warn!("structure {seed} failed: {reason}");
                }
                Ok(RunOutcome::MemoryExceeded(reason)) => {
                    log::warn!("structure {seed} skipped: {reason}");
                }
                Err(ComputeError::Walltime(msg)) => {
                    log::warn!(
                        "worker {} hit the walltime on {seed}: {msg}; stopping cleanly",
                        self.worker_id
                    );
                    self.shutdown.store(true, Ordering::SeqCst);
                    break;
                }
                Err(e) => {
                    log::error!("worker {} stopping the batch: {e}", self.worker_id);
                    return Err(e);
                }
            }
        }

        Ok(completed)
    }
}
