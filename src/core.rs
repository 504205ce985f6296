// src/core.rs
//
// =============================================================================
// RELAXRUN: CORE SCHEMA AUTHORITY
// =============================================================================
//
// The data contracts between the driver, the codec and the batch layer.
//
// Design principles:
// 1. First-class fields for every key the driver inspects.
// 2. A residual map for codec fidelity: unknown keys round-trip untouched.
// 3. The structure owns its geometry; cell options may never leak lattice or
//    atom data into a merged calculation.

use crate::errors::ComputeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Keys that describe the geometry and therefore belong to the structure
/// alone. They are stripped from cell options before any merge.
pub const GEOMETRY_KEYS: [&str; 5] = [
    "atom_types",
    "positions_frac",
    "positions_abs",
    "lattice_cart",
    "lattice_abc",
];

/// Keys scrubbed from every scrape before it is merged back into the live
/// calculation; each must be re-derived on the next step.
pub const RESCRAPE_KEYS: [&str; 5] = [
    "kpoints_mp_spacing",
    "kpoints_mp_grid",
    "species_pot",
    "sedc_apply",
    "sedc_scheme",
];

// ============================================================================
// 1. LATTICE HELPERS
// ============================================================================

/// Lengths and angles `[[a, b, c], [alpha, beta, gamma]]` from a Cartesian
/// lattice. Angles in degrees.
pub fn cart_to_abc(cart: &[[f64; 3]; 3]) -> [[f64; 3]; 2] {
    let norm = |v: &[f64; 3]| (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
    let dot = |u: &[f64; 3], v: &[f64; 3]| u[0] * v[0] + u[1] * v[1] + u[2] * v[2];
    let (a, b, c) = (norm(&cart[0]), norm(&cart[1]), norm(&cart[2]));
    let angle = |u: &[f64; 3], v: &[f64; 3], lu: f64, lv: f64| {
        (dot(u, v) / (lu * lv)).clamp(-1.0, 1.0).acos().to_degrees()
    };
    [
        [a, b, c],
        [
            angle(&cart[1], &cart[2], b, c),
            angle(&cart[0], &cart[2], a, c),
            angle(&cart[0], &cart[1], a, b),
        ],
    ]
}

/// Cartesian lattice in the standard orientation (a along x, b in the xy
/// plane) from lengths and angles in degrees.
pub fn abc_to_cart(abc: &[[f64; 3]; 2]) -> [[f64; 3]; 3] {
    let [a, b, c] = abc[0];
    let (alpha, beta, gamma) = (
        abc[1][0].to_radians(),
        abc[1][1].to_radians(),
        abc[1][2].to_radians(),
    );
    let cx = c * beta.cos();
    let cy = c * (alpha.cos() - beta.cos() * gamma.cos()) / gamma.sin();
    let cz = (c * c - cx * cx - cy * cy).max(0.0).sqrt();
    [
        [a, 0.0, 0.0],
        [b * gamma.cos(), b * gamma.sin(), 0.0],
        [cx, cy, cz],
    ]
}

pub fn cell_volume(cart: &[[f64; 3]; 3]) -> f64 {
    let (a, b, c) = (cart[0], cart[1], cart[2]);
    let cross = [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ];
    (cross[0] * c[0] + cross[1] * c[1] + cross[2] * c[2]).abs()
}

// ============================================================================
// 2. STRUCTURE DOCUMENT
// ============================================================================

/// One crystal structure as read from a `.res` file and updated in place by
/// the driver with scraped intermediate results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructDoc {
    /// Origin filename; always a single element.
    pub source: Vec<String>,

    pub atom_types: Vec<String>,
    pub positions_frac: Vec<[f64; 3]>,

    /// Cartesian lattice vectors, rows are a/b/c.
    pub lattice_cart: [[f64; 3]; 3],
    /// Redundant `[[a,b,c],[alpha,beta,gamma]]` form, kept consistent with
    /// `lattice_cart`.
    pub lattice_abc: [[f64; 3]; 2],

    #[serde(default)]
    pub optimised: bool,
    #[serde(default)]
    pub geom_iter: u32,

    pub enthalpy_per_atom: Option<f64>,
    pub pressure: Option<f64>,
    pub volume: Option<f64>,

    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl StructDoc {
    pub fn new(
        source: impl Into<String>,
        atom_types: Vec<String>,
        positions_frac: Vec<[f64; 3]>,
        lattice_cart: [[f64; 3]; 3],
    ) -> Self {
        Self {
            source: vec![source.into()],
            atom_types,
            positions_frac,
            lattice_abc: cart_to_abc(&lattice_cart),
            lattice_cart,
            optimised: false,
            geom_iter: 0,
            enthalpy_per_atom: None,
            pressure: None,
            volume: Some(cell_volume(&lattice_cart)),
            extra: BTreeMap::new(),
        }
    }

    /// Seed name derived from the mandatory source entry.
    pub fn seed(&self) -> String {
        let name = self.source[0].rsplit('/').next().unwrap_or(&self.source[0]);
        name.trim_end_matches(".res").to_string()
    }

    pub fn set_lattice_cart(&mut self, cart: [[f64; 3]; 3]) {
        self.lattice_abc = cart_to_abc(&cart);
        self.volume = Some(cell_volume(&cart));
        self.lattice_cart = cart;
    }

    /// Merge scraped intermediate results into this structure.
    pub fn absorb(&mut self, scrape: &ScrapedDoc) {
        self.optimised = scrape.optimised;
        if let Some(iter) = scrape.geom_iter {
            self.geom_iter = iter;
        }
        if let Some(h) = scrape.enthalpy_per_atom {
            self.enthalpy_per_atom = Some(h);
        } else if let Some(h) = scrape.extra.get("enthalpy").and_then(Value::as_f64) {
            if !self.atom_types.is_empty() {
                self.enthalpy_per_atom = Some(h / self.atom_types.len() as f64);
            }
        }
        if let Some(p) = scrape.pressure {
            self.pressure = Some(p);
        }
        if let Some(cart) = scrape.lattice_cart {
            self.set_lattice_cart(cart);
        }
        if let Some(pos) = &scrape.positions_frac {
            if pos.len() == self.positions_frac.len() {
                self.positions_frac = pos.clone();
            }
        }
        for (key, value) in &scrape.extra {
            if !RESCRAPE_KEYS.contains(&key.as_str()) {
                self.extra.insert(key.clone(), value.clone());
            }
        }
    }
}

// ============================================================================
// 3. CELL & PARAMETER OPTIONS (shared templates)
// ============================================================================

/// Options parsed from the shared `.cell` template. Any geometry blocks the
/// template carries are parked in `extra` and stripped on assembly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CellOptions {
    pub kpoints_mp_spacing: Option<f64>,
    pub kpoints_mp_grid: Option<[u32; 3]>,
    pub kpoints_mp_offset: Option<[f64; 3]>,
    #[serde(default)]
    pub symmetry_generate: bool,
    pub symmetry_tol: Option<f64>,
    #[serde(default)]
    pub snap_to_symmetry: bool,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

/// Options parsed from the shared `.param` template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamOptions {
    pub task: String,
    pub geom_max_iter: u32,
    pub geom_method: Option<String>,
    pub cut_off_energy: Option<f64>,
    #[serde(default)]
    pub write_cell_structure: bool,
    #[serde(default)]
    pub write_formatted_density: bool,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for ParamOptions {
    fn default() -> Self {
        Self {
            task: "GEOMETRYOPTIMISATION".into(),
            geom_max_iter: 100,
            geom_method: None,
            cut_off_energy: None,
            write_cell_structure: false,
            write_formatted_density: false,
            extra: BTreeMap::new(),
        }
    }
}

// ============================================================================
// 4. CALCULATION DOCUMENT
// ============================================================================

/// A structure merged with cell and parameter options: the exact calculation
/// the next child invocation will run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalcDoc {
    pub structure: StructDoc,

    /// Task name, always stored uppercase.
    pub task: String,
    pub geom_max_iter: u32,
    pub geom_method: Option<String>,
    pub cut_off_energy: Option<f64>,

    pub kpoints_mp_spacing: Option<f64>,
    pub kpoints_mp_grid: Option<[u32; 3]>,
    pub kpoints_mp_offset: Option<[f64; 3]>,

    pub atomic_init_spins: Option<Vec<f64>>,

    pub symmetry_generate: bool,
    pub symmetry_tol: Option<f64>,
    pub snap_to_symmetry: bool,

    pub write_cell_structure: bool,
    pub write_formatted_density: bool,

    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

impl CalcDoc {
    /// Merge a structure with cell and parameter options. Geometry keys are
    /// taken from the structure only; whatever the cell template carried is
    /// discarded here.
    pub fn assemble(structure: StructDoc, cell: &CellOptions, param: &ParamOptions) -> Self {
        let mut extra = BTreeMap::new();
        for (key, value) in &cell.extra {
            if !GEOMETRY_KEYS.contains(&key.as_str()) {
                extra.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in &param.extra {
            extra.insert(key.clone(), value.clone());
        }

        Self {
            structure,
            task: param.task.to_uppercase(),
            geom_max_iter: param.geom_max_iter,
            geom_method: param.geom_method.clone(),
            cut_off_energy: param.cut_off_energy,
            kpoints_mp_spacing: cell.kpoints_mp_spacing,
            kpoints_mp_grid: cell.kpoints_mp_grid,
            kpoints_mp_offset: cell.kpoints_mp_offset,
            atomic_init_spins: None,
            symmetry_generate: cell.symmetry_generate,
            symmetry_tol: cell.symmetry_tol,
            snap_to_symmetry: cell.snap_to_symmetry,
            write_cell_structure: param.write_cell_structure,
            write_formatted_density: param.write_formatted_density,
            extra,
        }
    }

    /// Merge scraped results into the live calculation, scrubbing the keys
    /// that must be re-derived next step.
    pub fn absorb(&mut self, scrape: &ScrapedDoc) {
        // kpoints_mp_* are first-class fields here and deliberately NOT
        // taken from the scrape; species_pot/sedc_* only ever appear in
        // `extra`, which the structure merge scrubs.
        self.structure.absorb(scrape);
    }
}

// ============================================================================
// 5. SCRAPE RESULTS
// ============================================================================

/// Everything the codec could pull out of one simulator log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrapedDoc {
    pub optimised: bool,
    pub geom_iter: Option<u32>,
    pub enthalpy_per_atom: Option<f64>,
    pub pressure: Option<f64>,
    pub max_force_on_atom: Option<f64>,
    pub mulliken_spins: Option<Vec<f64>>,
    pub atom_types: Option<Vec<String>>,
    pub positions_frac: Option<Vec<[f64; 3]>>,
    pub lattice_cart: Option<[[f64; 3]; 3]>,
    pub estimated_mem_mb: Option<f64>,
    #[serde(default)]
    pub extra: BTreeMap<String, Value>,
}

// ============================================================================
// 6. ITERATION SCHEDULE
// ============================================================================

/// Knobs for splitting a geometry optimisation into checkpointed chunks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RelaxPolicy {
    /// Number of short "rough" runs.
    pub rough: u32,
    /// Iterations per rough run.
    pub rough_iter: u32,
    /// Iterations per fine run.
    pub fine_iter: u32,
}

impl Default for RelaxPolicy {
    fn default() -> Self {
        Self {
            rough: 4,
            rough_iter: 2,
            fine_iter: 20,
        }
    }
}

/// Ordered `geom_max_iter` values, one per child invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule(Vec<u32>);

impl Schedule {
    /// Plan the run sequence for `max_iter` residual iterations.
    ///
    /// TPSD relaxations need at least 3 iterations per chunk to make
    /// progress, so `rough_iter` is raised for that method.
    pub fn build(
        policy: &RelaxPolicy,
        max_iter: u32,
        geom_method: Option<&str>,
    ) -> Result<Self, ComputeError> {
        let mut rough_iter = policy.rough_iter;
        if geom_method.is_some_and(|m| m.eq_ignore_ascii_case("tpsd")) && rough_iter < 3 {
            rough_iter = 3;
        }

        let mut steps: Vec<u32> = vec![rough_iter; policy.rough as usize];
        let remaining = max_iter as i64 - (policy.rough * rough_iter) as i64;

        if remaining > 0 {
            let remaining = remaining as u32;
            let mut fine_iter = policy.fine_iter;
            let num_fine = if remaining < fine_iter {
                fine_iter = remaining;
                1
            } else {
                remaining.div_ceil(fine_iter)
            };
            steps.extend(std::iter::repeat(fine_iter).take(num_fine as usize));
        }

        if steps.is_empty() {
            return Err(ComputeError::FatalExecutor(
                "could not divide up relaxation; consider increasing geom_max_iter".into(),
            ));
        }

        Ok(Schedule(steps))
    }

    pub fn steps(&self) -> &[u32] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn total(&self) -> u32 {
        self.0.iter().sum()
    }
}

// ============================================================================
// 7. TESTS
// ============================================================================
