// src/driver.rs
//
// =============================================================================
// RELAXRUN: RELAXATION DRIVER
// =============================================================================
//
// The per-structure state machine. One instance per seed.
//
// Lifecycle:
// 1. Pre-flight: self-test, parse, merge, verify, optional memcheck.
// 2. Plan the iteration schedule (rough steps then fine steps).
// 3. Loop: write inputs, launch, supervise, scrape, classify, decide.
// 4. Finalise: write the definitive structure and move the files.
//
// Local failures (StructureFailed, MaxMemory) become the return value so the
// batch keeps going; Input/FatalExecutor/Walltime propagate and stop it.

use crate::classifier;
use crate::codec::Codec;
use crate::config::{ComputeConfig, RunMode};
use crate::core::{CalcDoc, CellOptions, ParamOptions, Schedule, ScrapedDoc, StructDoc};
use crate::errors::ComputeError;
use crate::launcher::Launcher;
use crate::supervisor::{ExitState, SupervisedRun, Supervisor};
use crate::workflow;
use crate::workspace::{KeepPolicy, Workspace};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

const MAX_RETRIES: u32 = 2;

/// What one driver run came to. Local failures land here; global errors
/// come back through `ComputeError`.
#[derive(Debug)]
pub enum RunOutcome {
    Optimised(StructDoc),
    StructureFailed(String),
    MemoryExceeded(String),
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, RunOutcome::Optimised(_))
    }
}

pub struct RelaxationDriver {
    seed: String,
    config: ComputeConfig,
    codec: Arc<dyn Codec>,
    launcher: Launcher,
    supervisor: Supervisor,
    workspace: Workspace,

    cell_options: CellOptions,
    param_options: ParamOptions,

    struct_doc: Option<StructDoc>,
    calc_doc: Option<CalcDoc>,

    retries: u32,
    target_spacing: Option<f64>,
    completed_dir: String,
    conv_mode: bool,

    results_tx: Option<UnboundedSender<StructDoc>>,
}

impl RelaxationDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        seed: impl Into<String>,
        config: ComputeConfig,
        cell_options: CellOptions,
        param_options: ParamOptions,
        codec: Arc<dyn Codec>,
        workspace: Workspace,
        shutdown: Arc<AtomicBool>,
        results_tx: Option<UnboundedSender<StructDoc>>,
    ) -> Self {
        let launcher = Launcher::new(
            config.executable.clone(),
            config.ncores,
            config.nnodes,
            config.node.clone(),
            config.mpi_override,
            config.redirect.clone(),
        );
        let supervisor = Supervisor::new(
            config.polltime,
            config.max_walltime,
            config.start_time,
            shutdown,
        );
        let completed_dir = config.completed_dir.clone();
        Self {
            seed: seed.into(),
            config,
            codec,
            launcher,
            supervisor,
            workspace,
            cell_options,
            param_options,
            struct_doc: None,
            calc_doc: None,
            retries: 0,
            target_spacing: None,
            completed_dir,
            conv_mode: false,
            results_tx,
        }
    }

    pub fn seed(&self) -> &str {
        &self.seed
    }

    pub fn config(&self) -> &ComputeConfig {
        &self.config
    }

    pub fn calc_doc_mut(&mut self) -> &mut CalcDoc {
        self.calc_doc.as_mut().expect("calc doc built in pre-flight")
    }

    fn calc_doc(&self) -> &CalcDoc {
        self.calc_doc.as_ref().expect("calc doc built in pre-flight")
    }

    fn struct_doc_mut(&mut self) -> &mut StructDoc {
        self.struct_doc.as_mut().expect("structure parsed in pre-flight")
    }

    // ========================================================================
    // 1. PUBLIC ENTRY POINT
    // ========================================================================

    /// Run the whole state machine for this structure.
    pub async fn run(&mut self) -> Result<RunOutcome, ComputeError> {
        log::info!(target: &self.seed, "run started for seed {}", self.seed);

        let result = match self.config.mode {
            RunMode::Castep => self.run_castep().await,
            RunMode::Generic => self.run_generic().await,
        };

        // The compute dir is released on every path; the routine refuses to
        // delete anything that still holds a calculation.
        if let Err(e) = self.workspace.remove_compute_dir_if_finished() {
            log::warn!(target: &self.seed, "compute dir cleanup failed: {e}");
        }

        match result {
            Ok(true) => {
                log::info!(target: &self.seed, "driver finished successfully for {}", self.seed);
                Ok(RunOutcome::Optimised(
                    self.struct_doc.clone().unwrap_or_else(|| {
                        // generic mode carries no structure document
                        StructDoc::new(format!("{}.res", self.seed), vec![], vec![], [[0.0; 3]; 3])
                    }),
                ))
            }
            Ok(false) => Ok(RunOutcome::StructureFailed(
                "calculation finished without optimising".into(),
            )),
            Err(ComputeError::StructureFailed(msg)) => {
                log::warn!(target: &self.seed, "structure failed: {msg}");
                self.finalise_failure();
                Ok(RunOutcome::StructureFailed(msg))
            }
            Err(ComputeError::MaxMemory(msg)) => {
                log::warn!(target: &self.seed, "memcheck refused structure: {msg}");
                // deliberately no move: the structure is skipped, not bad,
                // and the claim is freed for a larger-memory worker
                self.workspace.release(&self.seed);
                Ok(RunOutcome::MemoryExceeded(msg))
            }
            Err(e) => {
                log::error!(target: &self.seed, "global error: {e}");
                Err(e)
            }
        }
    }

    // ========================================================================
    // 2. PRE-FLIGHT AND DISPATCH
    // ========================================================================

    async fn run_castep(&mut self) -> Result<bool, ComputeError> {
        log::info!(target: &self.seed, "calling simulator on {}", self.seed);

        if self.config.max_walltime.is_some() && self.config.start_time.is_none() {
            return Err(ComputeError::FatalExecutor(
                "max walltime configured but no start time recorded".into(),
            ));
        }

        if self.config.exec_test {
            let work_dir = self.workspace.work_dir().to_path_buf();
            self.launcher.test_exec(&work_dir).await?;
        }

        if self.config.kpts_1d {
            log::debug!(target: &self.seed, "1D k-point grid requested");
            self.target_spacing = Some(self.cell_options.kpoints_mp_spacing.ok_or_else(|| {
                ComputeError::FatalExecutor(
                    "kpoints_mp_spacing not found, but 1D k-points requested".into(),
                )
            })?);
        }

        // parse the structure; a bad input only fails this seed
        let res_path = self.workspace.root().join(format!("{}.res", self.seed));
        let structure = self.codec.parse_structure(&res_path).map_err(|e| {
            ComputeError::StructureFailed(format!("unable to parse initial structure: {e}"))
        })?;

        let calc = CalcDoc::assemble(structure.clone(), &self.cell_options, &self.param_options);
        self.codec.verify_calculation_parameters(&calc, &structure)?;
        self.codec.verify_simulation_cell(&structure)?;
        self.struct_doc = Some(structure);
        self.calc_doc = Some(calc);

        if self.config.memcheck {
            let maxmem = self.config.resolve_maxmem_mb();
            let estimate = self.do_memcheck().await?;
            log::info!(
                target: &self.seed,
                "memory estimate / available memory (MB): {estimate:8.0} / {maxmem:8.0}"
            );
            if estimate >= 0.9 * maxmem {
                return Err(ComputeError::MaxMemory(format!(
                    "estimated {estimate:.0} MB against a ceiling of {maxmem:.0} MB"
                )));
            }
        }

        if !self.config.conv_cutoff.is_empty() || !self.config.conv_kpt.is_empty() {
            return self.run_convergence_tests().await;
        }

        let task = workflow::Task::parse(&self.calc_doc().task);
        workflow::dispatch(task).run(self).await
    }

    // ========================================================================
    // 3. THE RELAXATION LOOP
    // ========================================================================

    /// Restarted geometry optimisation: short rough runs then longer fine
    /// runs, checkpointing between each so a walltime kill loses at most one
    /// chunk of iterations.
    pub async fn relax(&mut self) -> Result<bool, ComputeError> {
        log::info!(target: &self.seed, "attempting to relax {}", self.seed);
        let schedule = self.setup_relaxation()?;

        let reopt = self.config.reopt;
        let fine_iter = self.config.policy.fine_iter;
        let mut rerun = false;
        let mut idx = 0;
        let mut optimised = false;

        while idx < schedule.len() {
            let mut num_iter = schedule.steps()[idx];
            if reopt && rerun {
                num_iter = fine_iter;
                log::info!(
                    target: &self.seed,
                    "last step was successful, performing one last relaxation"
                );
            }
            self.calc_doc_mut().geom_max_iter = num_iter;

            let seed = self.seed.clone();
            self.update_input_files(&seed)?;

            let run = self.launch_and_supervise(&seed).await?;

            let castep_path = self.workspace.work_dir().join(format!("{seed}.castep"));
            let scrape = self.codec.parse_simulator_log(&castep_path);

            let report =
                classifier::classify(&seed, self.workspace.work_dir(), run.exit_code);
            let skip_postprocess = report.remedy.is_some();

            if report.errors_present {
                let msg = format!(
                    "failed to optimise {seed} as the simulator crashed with error: {}",
                    report.message
                );
                log::warn!(target: &self.seed, "{msg}");
                if let Ok(partial) = &scrape {
                    self.update_output_files(partial)?;
                }
                let can_retry = report.remedy.is_some() && self.retries < MAX_RETRIES;
                if can_retry {
                    log::warn!(
                        target: &self.seed,
                        "attempting to recover: {}",
                        report.remedy.expect("checked above")
                    );
                } else {
                    return Err(ComputeError::StructureFailed(msg));
                }
            }

            let opti = match scrape {
                Ok(doc) => doc,
                Err(e) if report.remedy.is_some() => {
                    // a remedied retry tolerates a half-written log
                    log::debug!(target: &self.seed, "partial scrape during remedy: {e}");
                    ScrapedDoc::default()
                }
                Err(e) => {
                    return Err(ComputeError::StructureFailed(format!(
                        "failed to parse simulator log: {e}"
                    )));
                }
            };

            log::debug!(
                target: &self.seed,
                "intermediate calculation completed, num_iter = {num_iter}"
            );

            if !skip_postprocess {
                // reopt gate: a success must survive one further relaxation
                if reopt && rerun && !opti.optimised {
                    rerun = false;
                    self.update_output_files(&opti)?;
                }
                if reopt && !rerun && opti.optimised {
                    rerun = true;
                    self.update_output_files(&opti)?;
                } else if (!reopt || rerun) && opti.optimised {
                    log::info!(target: &self.seed, "successfully relaxed {seed}");
                    self.update_output_files(&opti)?;
                    optimised = true;
                } else if idx + 1 == schedule.len() {
                    return Err(ComputeError::StructureFailed(format!(
                        "failed to optimise {seed} after {} iterations",
                        schedule.total()
                    )));
                }

                if optimised {
                    break;
                }

                // propagate state into the next step
                if let Some(spins) = &opti.mulliken_spins {
                    self.calc_doc_mut().atomic_init_spins = Some(spins.clone());
                }
                let mut opti = opti.clone();
                if self.calc_doc().write_cell_structure {
                    let out_cell = self
                        .workspace
                        .work_dir()
                        .join(format!("{seed}-out.cell"));
                    if out_cell.is_file() {
                        if let Ok(cell) = self.codec.parse_cell_output(&out_cell) {
                            opti.lattice_cart = Some(cell.lattice_cart);
                        }
                    }
                }
                if let (Some(p), Some(h)) = (opti.pressure, opti.enthalpy_per_atom) {
                    log::debug!(
                        target: &self.seed,
                        "N = {:03} | S = {p:5.5} GPa | H = {h:5.5} eV/atom",
                        schedule.steps()[..=idx].iter().sum::<u32>()
                    );
                }
                self.calc_doc_mut().absorb(&opti);
            } else {
                // the remedied path still records whatever was scraped
                self.calc_doc_mut().absorb(&opti);
            }

            match report.remedy {
                Some(remedy) => {
                    log::info!(target: &self.seed, "trying to remedy error before retrying");
                    remedy.apply(self.calc_doc_mut());
                    self.retries += 1;
                    // the schedule slot is not consumed: the remedy makes the
                    // next attempt a different calculation
                }
                None => idx += 1,
            }
        }

        self.finalise_result()
    }

    fn setup_relaxation(&mut self) -> Result<Schedule, ComputeError> {
        log::info!(target: &self.seed, "preparing to relax {}", self.seed);
        let seed = self.seed.clone();

        self.workspace
            .enter_compute_dir(&seed, self.config.custom_params)?;

        // pick up any intermediate state a previous (killed) run left behind
        let root_castep = self.workspace.root().join(format!("{seed}.castep"));
        let root_res = self.workspace.root().join(format!("{seed}.res"));
        if root_castep.is_file() && root_res.is_file() {
            log::info!(
                target: &self.seed,
                "updating structure with intermediate results found in root"
            );
            if self.workspace.work_dir() != self.workspace.root() {
                let staged = self.workspace.work_dir().join(format!("{seed}.castep"));
                if let Err(e) = std::fs::copy(&root_castep, &staged) {
                    log::warn!(target: &self.seed, "could not stage intermediate log: {e}");
                }
            }
            if let Ok(scrape) = self.codec.parse_simulator_log(&root_castep) {
                if let Some(iter) = scrape.geom_iter {
                    self.struct_doc_mut().geom_iter = iter;
                }
                let newer = match (root_res.metadata(), root_castep.metadata()) {
                    (Ok(r), Ok(c)) => match (r.modified(), c.modified()) {
                        (Ok(r), Ok(c)) => r < c,
                        _ => false,
                    },
                    _ => false,
                };
                if newer {
                    log::info!(
                        target: &self.seed,
                        "simulator log is newer than the structure file, adopting it"
                    );
                    self.struct_doc_mut().absorb(&scrape);
                }
            }
        }

        // write a fresh structure file to start from, and snapshot the input
        let res_path = self.workspace.work_dir().join(format!("{seed}.res"));
        let structure = self.struct_doc.clone().expect("parsed in pre-flight");
        self.codec
            .write_structure(&structure, &res_path)
            .map_err(|e| {
                ComputeError::StructureFailed(format!("could not write structure file: {e}"))
            })?;
        if let Err(e) = self.workspace.snapshot_input(&seed, false) {
            log::warn!(target: &self.seed, "input snapshot failed: {e}");
        }

        let geom_max_iter = self.calc_doc().geom_max_iter;
        let done = self.struct_doc.as_ref().map(|d| d.geom_iter).unwrap_or(0);
        if done >= geom_max_iter {
            return Err(ComputeError::StructureFailed(format!(
                "{done} iterations already performed on structure"
            )));
        }

        let schedule = Schedule::build(
            &self.config.policy,
            geom_max_iter - done,
            self.calc_doc().geom_method.as_deref(),
        )?;
        log::info!(
            target: &self.seed,
            "geometry optimisation scheme set to {:?}",
            schedule.steps()
        );
        Ok(schedule)
    }

    /// Launch one child and see it through. Deadline states unwind here:
    /// walltime and interrupts leave the seed resumable and propagate.
    async fn launch_and_supervise(
        &mut self,
        seed: &str,
    ) -> Result<SupervisedRun, ComputeError> {
        let work_dir = self.workspace.work_dir().to_path_buf();
        let child = self.launcher.launch(seed, &work_dir).await?;
        let castep_path = work_dir.join(format!("{seed}.castep"));
        let run = self.supervisor.supervise(child, &castep_path, seed).await?;

        match run.state {
            ExitState::Finished(_) => Ok(run),
            ExitState::WalltimeExpired | ExitState::Cancelled => {
                self.times_up();
                Err(ComputeError::Walltime(format!(
                    "ran out of time on seed {seed}"
                )))
            }
            ExitState::OutputMissing => Err(ComputeError::StructureFailed(format!(
                "simulator output was never created, check your executable: {}",
                self.config.executable
            ))),
            ExitState::StaleOutput => Err(ComputeError::StructureFailed(format!(
                "simulator output predates this run, check your executable: {}",
                self.config.executable
            ))),
        }
    }

    /// Walltime/interrupt cleanup: bring scratch artifacts home and free the
    /// claim so the seed can be picked up again immediately.
    fn times_up(&mut self) {
        log::info!(target: &self.seed, "ending early for seed {}", self.seed);
        self.workspace.evacuate_compute_dir(&self.seed);
        log::info!(target: &self.seed, "removing lock so the calculation can be continued");
        self.workspace.release(&self.seed);
    }

    // ========================================================================
    // 4. INPUT / OUTPUT FILE MAINTENANCE
    // ========================================================================

    /// Regenerate the cell and parameter files for the next invocation.
    fn update_input_files(&mut self, seed: &str) -> Result<(), ComputeError> {
        if self.config.kpts_1d {
            let spacing = self
                .target_spacing
                .expect("snapshotted during pre-flight");
            let c_len = self.calc_doc().structure.lattice_abc[0][2];
            let mut n_kz = (1.0 / (c_len * spacing)).ceil() as u32;
            if n_kz % 2 == 1 {
                n_kz += 1;
            }
            let calc = self.calc_doc_mut();
            calc.kpoints_mp_grid = Some([1, 1, n_kz]);
            calc.kpoints_mp_spacing = None;
        }

        let work_dir = self.workspace.work_dir().to_path_buf();
        let cell_path = work_dir.join(format!("{seed}.cell"));
        let param_path = work_dir.join(format!("{seed}.param"));

        if cell_path.exists() {
            let _ = std::fs::remove_file(&cell_path);
        }
        let spin = self.config.spin;
        self.codec
            .write_cell(self.calc_doc.as_ref().unwrap(), &cell_path, spin)
            .map_err(|e| {
                ComputeError::StructureFailed(format!("could not write cell file: {e}"))
            })?;

        if !self.config.custom_params {
            if param_path.exists() {
                let _ = std::fs::remove_file(&param_path);
            }
            self.codec
                .write_parameters(self.calc_doc.as_ref().unwrap(), &param_path)
                .map_err(|e| {
                    ComputeError::StructureFailed(format!("could not write param file: {e}"))
                })?;
        }
        Ok(())
    }

    /// Checkpoint: fold the scrape into the structure, rewrite the `.res`
    /// through a backup rename, and copy the results back to the root.
    fn update_output_files(&mut self, opti: &ScrapedDoc) -> Result<(), ComputeError> {
        log::info!(
            target: &self.seed,
            "updating structure file with new results"
        );
        self.struct_doc_mut().absorb(opti);

        let seed = self.seed.clone();
        let res_path = self.workspace.work_dir().join(format!("{seed}.res"));
        let bak_path = self.workspace.work_dir().join(format!("{seed}.res_bak"));
        if res_path.is_file() {
            let _ = std::fs::rename(&res_path, &bak_path);
        }
        let written = self
            .codec
            .write_structure(self.struct_doc.as_ref().unwrap(), &res_path);
        match written {
            Ok(()) => {
                if bak_path.is_file() {
                    let _ = std::fs::remove_file(&bak_path);
                }
            }
            Err(e) => {
                // restore the checkpoint we just displaced
                let _ = std::fs::rename(&bak_path, &res_path);
                return Err(ComputeError::StructureFailed(format!(
                    "could not update structure file: {e}"
                )));
            }
        }

        self.workspace.copy_back(&seed);
        Ok(())
    }

    // ========================================================================
    // 5. ONE-SHOT RUNS (SCF, CONVERGENCE, GENERIC)
    // ========================================================================

    /// Single-shot run of the current calculation under `seed`. Completed
    /// runs move to the completed folder unless `intermediate`; failures
    /// move to `bad_castep`.
    pub async fn scf(
        &mut self,
        seed: &str,
        keep: bool,
        intermediate: bool,
    ) -> Result<bool, ComputeError> {
        log::info!(
            target: &self.seed,
            "performing single-shot run on {seed} with task {}",
            self.calc_doc().task
        );

        let result = self.scf_inner(seed, keep, intermediate).await;
        if let Err(e) = &result {
            if e.is_local() {
                log::error!(target: &self.seed, "single-shot run failed: {e}");
                self.workspace.mv_to_bad(seed);
                if !keep {
                    self.workspace.tidy_up(seed);
                }
            }
        }
        result
    }

    async fn scf_inner(
        &mut self,
        seed: &str,
        keep: bool,
        intermediate: bool,
    ) -> Result<bool, ComputeError> {
        if let Err(e) = self.workspace.snapshot_input(&self.seed, false) {
            log::warn!(target: &self.seed, "input snapshot failed: {e}");
        }
        self.update_input_files(seed)?;

        let run = self.launch_and_supervise(seed).await?;

        let castep_path = self.workspace.work_dir().join(format!("{seed}.castep"));
        let scrape = self.codec.parse_simulator_log(&castep_path);

        let report = classifier::classify(seed, self.workspace.work_dir(), run.exit_code);
        if report.errors_present {
            return Err(ComputeError::StructureFailed(format!(
                "run on {seed} failed with errors: {}",
                report.message
            )));
        }
        let results = scrape.map_err(|e| {
            ComputeError::StructureFailed(format!("error scraping simulator log for {seed}: {e}"))
        })?;

        if !intermediate {
            log::info!(
                target: &self.seed,
                "writing results of single-shot run and tidying up"
            );
            let mut doc = self.struct_doc.clone().expect("parsed in pre-flight");
            doc.absorb(&results);
            doc.source = vec![format!("{seed}.res")];
            let res_path = self.workspace.work_dir().join(format!("{seed}.res"));
            self.codec.write_structure(&doc, &res_path).map_err(|e| {
                ComputeError::StructureFailed(format!("could not write results: {e}"))
            })?;

            let policy = KeepPolicy {
                kpts_1d: self.config.kpts_1d,
                conv_mode: self.conv_mode,
                formatted_density: self.calc_doc().write_formatted_density,
            };
            self.workspace
                .mv_to_completed(seed, &self.completed_dir, keep, policy);
            if !keep {
                self.workspace.tidy_up(seed);
            }
        }
        Ok(true)
    }

    /// Sweep cutoffs and k-point spacings, one single-shot run each, into
    /// `completed_cutoff/` and `completed_kpts/`. Succeeds if anything did.
    pub async fn run_convergence_tests(&mut self) -> Result<bool, ComputeError> {
        log::info!(target: &self.seed, "performing convergence tests");
        self.conv_mode = true;
        let mut successes = Vec::new();
        let cached_cutoff = self.calc_doc().cut_off_energy;

        let cutoffs = self.config.conv_cutoff.clone();
        for cutoff in cutoffs {
            log::info!(target: &self.seed, "cutoff convergence: {cutoff} eV");
            self.calc_doc_mut().cut_off_energy = Some(cutoff);
            self.completed_dir = "completed_cutoff".into();
            let sub_seed = format!("{}_{}eV", self.seed, cutoff);
            successes.push(self.one_conv_run(&sub_seed).await?);
        }

        let kpts = self.config.conv_kpt.clone();
        for kpt in kpts {
            log::info!(target: &self.seed, "k-point convergence: {kpt} 1/A");
            self.calc_doc_mut().cut_off_energy = cached_cutoff;
            let calc = self.calc_doc_mut();
            calc.kpoints_mp_spacing = Some(kpt);
            calc.kpoints_mp_grid = None;
            calc.kpoints_mp_offset = Some([0.0, 0.0, 0.0]);
            self.completed_dir = "completed_kpts".into();
            let sub_seed = format!("{}_{}A", self.seed, kpt);
            successes.push(self.one_conv_run(&sub_seed).await?);
        }

        self.completed_dir = self.config.completed_dir.clone();
        self.conv_mode = false;
        Ok(successes.iter().any(|s| *s))
    }

    /// One convergence point; a local failure records `false` and the sweep
    /// carries on.
    async fn one_conv_run(&mut self, sub_seed: &str) -> Result<bool, ComputeError> {
        match self.scf(sub_seed, false, false).await {
            Ok(ok) => Ok(ok),
            Err(e) if e.is_local() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Generic mode: one invocation of an arbitrary MPI program. Success
    /// moves everything to completed; any failure moves it to bad_castep.
    async fn run_generic(&mut self) -> Result<bool, ComputeError> {
        log::info!(
            target: &self.seed,
            "calling generic MPI program on {}",
            self.seed
        );
        let seed = self.seed.clone();

        let result: Result<bool, ComputeError> = async {
            if let Err(e) = self.workspace.snapshot_input(&seed, true) {
                log::warn!(target: &self.seed, "input snapshot failed: {e}");
            }

            let work_dir = self.workspace.work_dir().to_path_buf();
            let child = self.launcher.launch(&seed, &work_dir).await?;
            let output = child.wait_with_output().await.map_err(|e| {
                ComputeError::StructureFailed(format!("failed to wait on child: {e}"))
            })?;

            let code = output.status.code().unwrap_or(-1);
            if code != 0 || !output.stderr.is_empty() {
                return Err(ComputeError::StructureFailed(format!(
                    "process returned error code {code}\nstdout: {}\nstderr: {}",
                    String::from_utf8_lossy(&output.stdout),
                    String::from_utf8_lossy(&output.stderr)
                )));
            }

            self.workspace
                .mv_to_completed(&seed, &self.completed_dir, true, KeepPolicy::default());
            self.workspace.append_finished_log(&seed);
            log::info!(target: &self.seed, "generic executable finished cleanly");
            Ok(true)
        }
        .await;

        if let Err(e) = &result {
            if e.is_local() {
                self.workspace.mv_to_bad(&seed);
            }
        }
        result
    }

    // ========================================================================
    // 6. MEMCHECK
    // ========================================================================

    /// Dry-run the simulator on a singlepoint copy of the calculation and
    /// return the estimated memory in MB, scaled by cores and nodes.
    async fn do_memcheck(&mut self) -> Result<f64, ComputeError> {
        let mem_seed = format!("{}_memcheck", self.seed);
        log::info!(target: &self.seed, "performing memory check as {mem_seed}");

        let mut doc = self.calc_doc().clone();
        doc.task = "SINGLEPOINT".into();

        let work_dir = self.workspace.work_dir().to_path_buf();
        let write = |r: Result<(), crate::errors::CodecError>| {
            r.map_err(|e| {
                ComputeError::StructureFailed(format!("could not write memcheck input: {e}"))
            })
        };
        write(
            self.codec
                .write_cell(&doc, &work_dir.join(format!("{mem_seed}.cell")), None),
        )?;
        write(
            self.codec
                .write_parameters(&doc, &work_dir.join(format!("{mem_seed}.param"))),
        )?;

        // a local copy of the launcher carries the dryrun flag, so the real
        // argv template is never mutated
        let mut dry_launcher = self
            .launcher
            .with_executable(format!("{} --dryrun", self.config.executable));
        let child = dry_launcher.launch(&mem_seed, &work_dir).await?;
        let _ = child.wait_with_output().await;

        let scrape = self
            .codec
            .parse_simulator_log(&work_dir.join(format!("{mem_seed}.castep")));

        // remove the scratch inputs whatever happened
        if let Ok(entries) = std::fs::read_dir(&work_dir) {
            for entry in entries.filter_map(|e| e.ok()) {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(&format!("{mem_seed}.")) && !name.ends_with(".res") {
                    let _ = std::fs::remove_file(entry.path());
                }
            }
        }

        let estimate = scrape
            .ok()
            .and_then(|s| s.estimated_mem_mb)
            .ok_or_else(|| {
                ComputeError::MaxMemory("dry run reported no memory estimate".into())
            })?;

        Ok(estimate * self.config.ncores as f64 * self.config.nnodes as f64)
    }

    // ========================================================================
    // 7. FINALISATION
    // ========================================================================

    /// Write the definitive structure, move the files, publish the result.
    fn finalise_result(&mut self) -> Result<bool, ComputeError> {
        log::info!(target: &self.seed, "finalising calculation");
        let success = self
            .struct_doc
            .as_ref()
            .map(|d| d.optimised)
            .unwrap_or(false);
        log::info!(target: &self.seed, "was calculation successful? {success}");

        if let (Some(tx), Some(doc)) = (&self.results_tx, &self.struct_doc) {
            log::info!(target: &self.seed, "pushing results to output channel");
            let _ = tx.send(doc.clone());
        }

        if success {
            let policy = KeepPolicy {
                kpts_1d: self.config.kpts_1d,
                conv_mode: self.conv_mode,
                formatted_density: self.calc_doc().write_formatted_density,
            };
            self.workspace
                .mv_to_completed(&self.seed, &self.completed_dir, false, policy);
            self.workspace.append_finished_log(&self.seed);
        } else {
            self.workspace.mv_to_bad(&self.seed);
        }
        self.workspace.tidy_up(&self.seed);
        Ok(success)
    }

    /// Terminal cleanup for a structure-level failure raised anywhere in the
    /// state machine.
    fn finalise_failure(&mut self) {
        if let (Some(tx), Some(doc)) = (&self.results_tx, &self.struct_doc) {
            let _ = tx.send(doc.clone());
        }
        self.workspace.mv_to_bad(&self.seed);
        self.workspace.tidy_up(&self.seed);
        if let Err(e) = self.workspace.remove_compute_dir_if_finished() {
            log::warn!(target: &self.seed, "compute dir cleanup failed: {e}");
        }
    }
}
