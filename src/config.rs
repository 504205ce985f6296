// src/config.rs
//
// =============================================================================
// RELAXRUN: DRIVER CONFIGURATION
// =============================================================================
//
// Every knob a driver needs, owned per instance. Nothing here is ambient:
// the working directory, the executable template and the walltime clock are
// all explicit fields, so concurrent drivers cannot observe each other's
// state.

use crate::core::RelaxPolicy;
use crate::errors::ComputeError;
use crate::launcher::MpiLibrary;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use sysinfo::{MemoryRefreshKind, RefreshKind, System};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Full restarted state machine for the simulator.
    Castep,
    /// Single one-shot invocation of an arbitrary MPI program.
    Generic,
}

#[derive(Debug, Clone)]
pub struct ComputeConfig {
    /// Executable template; `$seed` tokens are substituted at launch.
    pub executable: String,
    pub mode: RunMode,

    /// Cores per node for the MPI call.
    pub ncores: usize,
    /// Node count; 1 means a single-node launch.
    pub nnodes: usize,
    /// Remote node to ssh into, if any.
    pub node: Option<String>,
    /// User-asserted MPI flavour; `None` means auto-detect on demand.
    pub mpi_override: Option<MpiLibrary>,

    pub policy: RelaxPolicy,

    /// Supervisor poll interval.
    pub polltime: Duration,
    /// Walltime budget paired with the moment the batch started. Both unset
    /// disables the deadline check.
    pub max_walltime: Option<Duration>,
    pub start_time: Option<Instant>,

    /// Dry-run memory estimation before committing to a full run.
    pub memcheck: bool,
    /// Memory ceiling in MB for the memcheck gate.
    pub maxmem_mb: Option<f64>,

    /// Per-host scratch directory; seed files are staged here and copied
    /// back on every exit path.
    pub compute_dir: Option<PathBuf>,
    /// Stdout redirect template; `$seed` is substituted.
    pub redirect: Option<String>,

    /// Re-optimise once more after a first success.
    pub reopt: bool,
    /// Leave the per-seed parameter file untouched.
    pub custom_params: bool,
    /// Treat the c axis as special and build a [1, 1, n] k-point grid.
    pub kpts_1d: bool,
    /// Break spin symmetry in the first written cell by this amount.
    pub spin: Option<f64>,

    /// Cutoffs for an SCF convergence sweep; empty means no sweep.
    pub conv_cutoff: Vec<f64>,
    /// K-point spacings for an SCF convergence sweep.
    pub conv_kpt: Vec<f64>,

    /// Probe the executable with `--version` before the first real launch.
    pub exec_test: bool,

    /// 0..3 => ERROR/WARN/INFO/DEBUG on stdout.
    pub verbosity: u8,

    /// Destination folder (under the root) for successful runs.
    pub completed_dir: String,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            executable: "castep".into(),
            mode: RunMode::Castep,
            ncores: 1,
            nnodes: 1,
            node: None,
            mpi_override: None,
            policy: RelaxPolicy::default(),
            polltime: Duration::from_secs(30),
            max_walltime: None,
            start_time: None,
            memcheck: false,
            maxmem_mb: None,
            compute_dir: None,
            redirect: None,
            reopt: false,
            custom_params: false,
            kpts_1d: false,
            spin: None,
            conv_cutoff: Vec::new(),
            conv_kpt: Vec::new(),
            exec_test: true,
            verbosity: 1,
            completed_dir: "completed".into(),
        }
    }
}

impl ComputeConfig {
    /// Reject configurations the state machine cannot run safely.
    ///
    /// The walltime check in the supervisor compares the remaining budget
    /// against a 5-poll safety margin; a poll interval that eats the margin
    /// would always fire immediately, so it is an input error.
    pub fn validate(&self) -> Result<(), ComputeError> {
        if self.ncores == 0 {
            return Err(ComputeError::Input("ncores must be at least 1".into()));
        }
        if self.nnodes == 0 {
            return Err(ComputeError::Input("nnodes must be at least 1".into()));
        }
        if let Some(walltime) = self.max_walltime {
            if self.polltime * 5 >= walltime {
                return Err(ComputeError::Input(format!(
                    "polltime {}s leaves no safety margin inside max walltime {}s; \
                     reduce polltime below walltime/5",
                    self.polltime.as_secs(),
                    walltime.as_secs()
                )));
            }
        }
        if self.conv_cutoff.iter().any(|c| *c <= 0.0) {
            return Err(ComputeError::Input(
                "convergence cutoffs must be positive".into(),
            ));
        }
        if self.conv_kpt.iter().any(|k| *k <= 0.0) {
            return Err(ComputeError::Input(
                "convergence k-point spacings must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Memory ceiling for the memcheck gate, falling back to the memory
    /// currently available on this host.
    pub fn resolve_maxmem_mb(&self) -> f64 {
        match self.maxmem_mb {
            Some(mb) => mb,
            None => {
                let mut sys = System::new_with_specifics(
                    RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
                );
                sys.refresh_memory();
                (sys.available_memory() / 1024 / 1024) as f64
            }
        }
    }

    /// Remaining walltime, if a deadline is configured.
    pub fn remaining_walltime(&self) -> Option<Duration> {
        let (walltime, start) = (self.max_walltime?, self.start_time?);
        Some(walltime.saturating_sub(start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ComputeConfig::default().validate().is_ok());
    }

    #[test]
    fn oversized_polltime_is_rejected() {
        let cfg = ComputeConfig {
            max_walltime: Some(Duration::from_secs(100)),
            polltime: Duration::from_secs(30),
            start_time: Some(Instant::now()),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ComputeError::Input(_))));
    }

    #[test]
    fn comfortable_polltime_is_accepted() {
        let cfg = ComputeConfig {
            max_walltime: Some(Duration::from_secs(3600)),
            polltime: Duration::from_secs(30),
            start_time: Some(Instant::now()),
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_cores_is_rejected() {
        let cfg = ComputeConfig {
            ncores: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
