// src/main.rs
//
// =============================================================================
// RELAXRUN: COMMAND-LINE ENTRY POINT
// =============================================================================
//
// Runs many geometry optimisations from a folder of .res files plus a single
// cell and param template, spreading the work across a pool of cooperating
// workers coordinated through lock files.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use relaxrun::batch::BatchRun;
use relaxrun::codec::CastepCodec;
use relaxrun::config::{ComputeConfig, RunMode};
use relaxrun::core::RelaxPolicy;
use relaxrun::errors::ComputeError;
use relaxrun::launcher::MpiLibrary;
use relaxrun::logs::RunLogger;
use relaxrun::workspace::Workspace;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Full restarted relaxation state machine.
    Castep,
    /// Single one-shot invocation of an arbitrary MPI program.
    Generic,
}

#[derive(Parser)]
#[command(
    name = "relaxrun",
    about = "Run many geometry optimisations from .res files and shared cell/param templates"
)]
struct Cli {
    /// Seed naming the shared <seed>.cell and <seed>.param templates.
    seed: String,

    /// Cores per job [default: physical cores / nprocesses].
    #[arg(long, short = 'c')]
    ncores: Option<usize>,

    /// Number of concurrent worker calculations.
    #[arg(long, short = 'p', default_value_t = 1)]
    nprocesses: usize,

    /// Nodes per MPI call.
    #[arg(long, default_value_t = 1)]
    nnodes: usize,

    /// Remote node to ssh the launch onto.
    #[arg(long)]
    node: Option<String>,

    /// Walltime budget in seconds; unset disables the deadline.
    #[arg(long)]
    max_walltime: Option<u64>,

    /// Executable template; $seed is substituted.
    #[arg(long, default_value = "castep")]
    executable: String,

    #[arg(long, value_enum, default_value_t = ModeArg::Castep)]
    mode: ModeArg,

    /// Leave per-structure .param files untouched.
    #[arg(long)]
    custom_params: bool,

    /// Dry-run memory estimation before each structure.
    #[arg(long)]
    memcheck: bool,

    /// Memory ceiling in MB for the memcheck gate.
    #[arg(long)]
    maxmem: Option<f64>,

    /// Force aprun over mpirun.
    #[arg(long)]
    archer: bool,

    /// Force srun over mpirun.
    #[arg(long)]
    slurm: bool,

    /// Force Intel-style mpirun.
    #[arg(long)]
    intel: bool,

    /// Cutoffs (eV) for an SCF convergence sweep.
    #[arg(long, num_args = 1..)]
    conv_cutoff: Vec<f64>,

    /// K-point spacings (1/A) for an SCF convergence sweep.
    #[arg(long, num_args = 1..)]
    conv_kpt: Vec<f64>,

    /// Redirect child stdout to this file; $seed is substituted.
    #[arg(long)]
    redirect: Option<String>,

    /// Per-host scratch directory; "auto" uses the hostname.
    #[arg(long)]
    compute_dir: Option<String>,

    /// Supervisor poll interval in seconds.
    #[arg(long, default_value_t = 30)]
    polltime: u64,

    /// Relax once more after first success before accepting it.
    #[arg(long)]
    reopt: bool,

    /// Number of rough steps in the iteration schedule.
    #[arg(long, default_value_t = 4)]
    rough: u32,

    /// Iterations per rough step.
    #[arg(long, default_value_t = 2)]
    rough_iter: u32,

    /// Iterations per fine step.
    #[arg(long, default_value_t = 20)]
    fine_iter: u32,

    /// Build a [1, 1, n] k-point grid treating the c axis as special.
    #[arg(long)]
    kpts_1d: bool,

    /// Break spin symmetry in the first step by this amount.
    #[arg(long)]
    spin: Option<f64>,

    /// Skip the executable --version self-test.
    #[arg(long)]
    no_exec_test: bool,

    /// 0..3 => ERROR/WARN/INFO/DEBUG on stdout.
    #[arg(long, default_value_t = 1)]
    verbosity: u8,
}

impl Cli {
    fn mpi_override(&self) -> Result<Option<MpiLibrary>> {
        let flags = [self.archer, self.slurm, self.intel]
            .iter()
            .filter(|f| **f)
            .count();
        if flags > 1 {
            return Err(anyhow!(
                "conflicting MPI library flags; pick one of --archer/--slurm/--intel"
            ));
        }
        Ok(if self.archer {
            Some(MpiLibrary::Archer)
        } else if self.slurm {
            Some(MpiLibrary::Slurm)
        } else if self.intel {
            Some(MpiLibrary::Intel)
        } else {
            None
        })
    }
}

// ============================================================================
// 2. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let sinks =
        RunLogger::init(cli.verbosity).map_err(|e| anyhow!("could not install logger: {e}"))?;

    let all_cores = num_cpus::get();
    let ncores = cli
        .ncores
        .unwrap_or_else(|| (all_cores / cli.nprocesses).max(1));

    let compute_dir = cli.compute_dir.as_deref().map(|dir| {
        if dir == "auto" {
            PathBuf::from(Workspace::per_host_dir_name())
        } else {
            PathBuf::from(dir)
        }
    });

    let config = ComputeConfig {
        executable: cli.executable.clone(),
        mode: match cli.mode {
            ModeArg::Castep => RunMode::Castep,
            ModeArg::Generic => RunMode::Generic,
        },
        ncores,
        nnodes: cli.nnodes,
        node: cli.node.clone(),
        mpi_override: cli.mpi_override()?,
        policy: RelaxPolicy {
            rough: cli.rough,
            rough_iter: cli.rough_iter,
            fine_iter: cli.fine_iter,
        },
        polltime: Duration::from_secs(cli.polltime),
        max_walltime: cli.max_walltime.map(Duration::from_secs),
        start_time: cli.max_walltime.map(|_| Instant::now()),
        memcheck: cli.memcheck,
        maxmem_mb: cli.maxmem,
        compute_dir,
        redirect: cli.redirect.clone(),
        reopt: cli.reopt,
        custom_params: cli.custom_params,
        kpts_1d: cli.kpts_1d,
        spin: cli.spin,
        conv_cutoff: cli.conv_cutoff.clone(),
        conv_kpt: cli.conv_kpt.clone(),
        exec_test: !cli.no_exec_test,
        verbosity: cli.verbosity,
        completed_dir: "completed".into(),
    };

    let runner = BatchRun::new(
        std::env::current_dir().context("no working directory")?,
        &cli.seed,
        cli.nprocesses,
        config,
        Arc::new(CastepCodec),
        sinks,
    )
    .map_err(exit_error)?;

    match runner.spawn().await {
        Ok(completed) => {
            log::info!("all workers finished; {completed} structures completed");
            Ok(())
        }
        Err(e) => Err(exit_error(e)),
    }
}

fn exit_error(e: ComputeError) -> anyhow::Error {
    log::error!("{e}");
    anyhow!("{e}")
}
