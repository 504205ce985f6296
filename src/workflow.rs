// src/workflow.rs
//
// =============================================================================
// RELAXRUN: TASK DISPATCH
// =============================================================================
//
// One layer above the driver: a closed task enumeration and a registry of
// handlers, each of which composes the driver's relax/scf primitives.
//
// The driver never branches on task names itself; it parses the task and
// asks this module for the matching handler.

use crate::driver::RelaxationDriver;
use crate::errors::ComputeError;
use async_trait::async_trait;

// ============================================================================
// 1. THE TASK ENUMERATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    GeometryOptimisation,
    Spectral,
    Phonon,
    Thermodynamics,
    BulkModulus,
    /// Also the fallback for any task the core does not treat specially.
    Singlepoint,
}

impl Task {
    /// Case-insensitive parse accepting both -isation and -ization spellings.
    pub fn parse(task: &str) -> Self {
        match task.trim().to_uppercase().as_str() {
            "GEOMETRYOPTIMISATION" | "GEOMETRYOPTIMIZATION" => Task::GeometryOptimisation,
            "SPECTRAL" => Task::Spectral,
            "PHONON" => Task::Phonon,
            "THERMODYNAMICS" => Task::Thermodynamics,
            "BULK_MODULUS" => Task::BulkModulus,
            _ => Task::Singlepoint,
        }
    }
}

// ============================================================================
// 2. THE HANDLER CONTRACT
// ============================================================================

#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Drive the structure to completion for this task. Returns true on
    /// success; structure-level failures come back as errors.
    async fn run(&self, driver: &mut RelaxationDriver) -> Result<bool, ComputeError>;
}

/// Handler lookup for a parsed task.
pub fn dispatch(task: Task) -> Box<dyn TaskHandler> {
    match task {
        Task::GeometryOptimisation => Box::new(RelaxHandler),
        Task::Spectral => Box::new(TwoStepHandler { second: "SPECTRAL" }),
        Task::Phonon => Box::new(TwoStepHandler { second: "PHONON" }),
        Task::Thermodynamics => Box::new(TwoStepHandler {
            second: "THERMODYNAMICS",
        }),
        Task::BulkModulus => Box::new(BulkModulusHandler),
        Task::Singlepoint => Box::new(SinglepointHandler),
    }
}

// ============================================================================
// 3. HANDLERS
// ============================================================================

/// Full restarted geometry optimisation.
struct RelaxHandler;

#[async_trait]
impl TaskHandler for RelaxHandler {
    async fn run(&self, driver: &mut RelaxationDriver) -> Result<bool, ComputeError> {
        driver.relax().await
    }
}

/// Plain one-shot run; also the fallback for unrecognised tasks.
struct SinglepointHandler;

#[async_trait]
impl TaskHandler for SinglepointHandler {
    async fn run(&self, driver: &mut RelaxationDriver) -> Result<bool, ComputeError> {
        let seed = driver.seed().to_string();
        driver.scf(&seed, true, false).await
    }
}

/// Ground-state run first, then the follow-up task on the converged density.
struct TwoStepHandler {
    second: &'static str,
}

#[async_trait]
impl TaskHandler for TwoStepHandler {
    async fn run(&self, driver: &mut RelaxationDriver) -> Result<bool, ComputeError> {
        let seed = driver.seed().to_string();
        let requested = driver.calc_doc_mut().task.clone();

        driver.calc_doc_mut().task = "SINGLEPOINT".into();
        driver.scf(&seed, true, true).await?;

        driver.calc_doc_mut().task = self.second.into();
        let ok = driver.scf(&seed, true, false).await;
        driver.calc_doc_mut().task = requested;
        ok
    }
}

/// Relax, then sample singlepoints on a small isotropic strain ladder.
struct BulkModulusHandler;

const BULK_STRAINS: [f64; 5] = [-0.04, -0.02, 0.0, 0.02, 0.04];

#[async_trait]
impl TaskHandler for BulkModulusHandler {
    async fn run(&self, driver: &mut RelaxationDriver) -> Result<bool, ComputeError> {
        let seed = driver.seed().to_string();
        let relaxed = driver.relax().await?;

        driver.calc_doc_mut().task = "SINGLEPOINT".into();
        let reference = driver.calc_doc_mut().structure.lattice_cart;

        let mut successes = Vec::new();
        for strain in BULK_STRAINS {
            let scale = 1.0 + strain;
            let mut cart = reference;
            for row in &mut cart {
                for v in row.iter_mut() {
                    *v *= scale;
                }
            }
            driver.calc_doc_mut().structure.set_lattice_cart(cart);

            let sub_seed = format!("{seed}_V{scale:.2}");
            match driver.scf(&sub_seed, false, false).await {
                Ok(ok) => successes.push(ok),
                Err(e) if e.is_local() => successes.push(false),
                Err(e) => return Err(e),
            }
        }
        driver.calc_doc_mut().structure.set_lattice_cart(reference);

        Ok(relaxed && successes.iter().any(|s| *s))
    }
}
