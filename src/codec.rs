// src/codec.rs
//
// =============================================================================
// RELAXRUN: FILE-FORMAT CODEC
// =============================================================================
//
// The hexagonal port between the driver and the simulator's on-disk formats.
//
// The driver only ever talks to the `Codec` trait; `CastepCodec` is the
// production implementation covering the SHELX-style `.res` structure file,
// the `.cell`/`.param` input pair, the `-out.cell` high-precision output and
// the textual `.castep` log.
//
// All writers overwrite in place; duplicate hashing is the caller's concern.

use crate::core::{
    abc_to_cart, cell_volume, CalcDoc, CellOptions, ParamOptions, ScrapedDoc, StructDoc,
};
use crate::errors::{CodecError, ComputeError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Residual keys that belong in the cell file rather than the param file.
const CELL_RESIDUAL_KEYS: [&str; 8] = [
    "species_pot",
    "cell_constraints",
    "fix_all_cell",
    "fix_com",
    "external_pressure",
    "hubbard_u",
    "ionic_constraints",
    "quantisation_axis",
];

/// Lattice and positions pulled from a `-out.cell` file.
#[derive(Debug, Clone)]
pub struct CellOutput {
    pub lattice_cart: [[f64; 3]; 3],
    pub positions_frac: Option<Vec<(String, [f64; 3])>>,
}

pub trait Codec: Send + Sync {
    fn parse_structure(&self, path: &Path) -> Result<StructDoc, CodecError>;
    fn parse_simulator_log(&self, path: &Path) -> Result<ScrapedDoc, CodecError>;
    fn parse_cell_output(&self, path: &Path) -> Result<CellOutput, CodecError>;
    fn parse_cell_options(&self, path: &Path) -> Result<CellOptions, CodecError>;
    fn parse_param_options(&self, path: &Path) -> Result<ParamOptions, CodecError>;

    fn write_structure(&self, doc: &StructDoc, path: &Path) -> Result<(), CodecError>;
    fn write_cell(&self, doc: &CalcDoc, path: &Path, spin: Option<f64>) -> Result<(), CodecError>;
    fn write_parameters(&self, doc: &CalcDoc, path: &Path) -> Result<(), CodecError>;

    /// Catch contradictory parameters before any child is launched.
    fn verify_calculation_parameters(
        &self,
        calc: &CalcDoc,
        structure: &StructDoc,
    ) -> Result<(), ComputeError>;

    /// Catch unphysical cells before any child is launched.
    fn verify_simulation_cell(&self, structure: &StructDoc) -> Result<(), ComputeError>;
}

// ============================================================================
// 1. THE CASTEP CODEC
// ============================================================================

#[derive(Debug, Default, Clone)]
pub struct CastepCodec;

impl CastepCodec {
    fn read(path: &Path) -> Result<String, CodecError> {
        fs::read_to_string(path).map_err(|e| CodecError::io(path.display().to_string(), e))
    }

    fn write(path: &Path, contents: &str) -> Result<(), CodecError> {
        fs::write(path, contents).map_err(|e| CodecError::io(path.display().to_string(), e))
    }

    fn parse_scalar(token: &str) -> Value {
        if let Ok(i) = token.parse::<i64>() {
            return Value::from(i);
        }
        if let Ok(f) = token.parse::<f64>() {
            return Value::from(f);
        }
        match token.to_ascii_lowercase().as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(token.to_string()),
        }
    }

    fn render_value(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// .res structure files
// ----------------------------------------------------------------------------

impl CastepCodec {
    fn render_res(doc: &StructDoc) -> String {
        let mut out = String::new();
        let seed = doc.seed();
        let natoms = doc.atom_types.len();
        let pressure = doc.pressure.unwrap_or(0.0);
        let volume = doc
            .volume
            .unwrap_or_else(|| cell_volume(&doc.lattice_cart));
        let enthalpy = doc.enthalpy_per_atom.unwrap_or(0.0) * natoms as f64;

        let _ = writeln!(
            out,
            "TITL {seed} {pressure:.5} {volume:.6} {enthalpy:.8} 0 0 {natoms} (P1) n - 1"
        );
        let _ = writeln!(out, "REM geom_iter = {}", doc.geom_iter);
        let _ = writeln!(out, "REM optimised = {}", doc.optimised);
        for (key, value) in &doc.extra {
            let _ = writeln!(out, "REM {key} = {}", Self::render_value(value));
        }

        let abc = doc.lattice_abc;
        let _ = writeln!(
            out,
            "CELL 1.0 {:.8} {:.8} {:.8} {:.6} {:.6} {:.6}",
            abc[0][0], abc[0][1], abc[0][2], abc[1][0], abc[1][1], abc[1][2]
        );
        let _ = writeln!(out, "LATT -1");

        let mut species: Vec<&str> = Vec::new();
        for ty in &doc.atom_types {
            if !species.contains(&ty.as_str()) {
                species.push(ty);
            }
        }
        let _ = writeln!(out, "SFAC {}", species.join(" "));
        for (ty, pos) in doc.atom_types.iter().zip(&doc.positions_frac) {
            let idx = species.iter().position(|s| *s == ty).unwrap_or(0) + 1;
            let _ = writeln!(
                out,
                "{ty} {idx} {:.10} {:.10} {:.10} 1.0",
                pos[0], pos[1], pos[2]
            );
        }
        out.push_str("END\n");
        out
    }

    fn parse_res(path: &Path, contents: &str) -> Result<StructDoc, CodecError> {
        let display = path.display().to_string();
        let mut pressure = None;
        let mut volume = None;
        let mut enthalpy_total = None;
        let mut abc: Option<[[f64; 3]; 2]> = None;
        let mut atom_types = Vec::new();
        let mut positions = Vec::new();
        let mut extra = BTreeMap::new();
        let mut geom_iter = 0u32;
        let mut optimised = false;
        let mut in_atoms = false;

        for line in contents.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.is_empty() {
                continue;
            }
            match tokens[0].to_ascii_uppercase().as_str() {
                "TITL" => {
                    if tokens.len() >= 5 {
                        pressure = tokens[2].parse().ok();
                        volume = tokens[3].parse().ok();
                        enthalpy_total = tokens[4].parse().ok();
                    }
                }
                "REM" => {
                    if tokens.len() >= 4 && tokens[2] == "=" {
                        match tokens[1] {
                            "geom_iter" => geom_iter = tokens[3].parse().unwrap_or(0),
                            "optimised" => optimised = tokens[3] == "true",
                            key => {
                                extra.insert(
                                    key.to_string(),
                                    Self::parse_scalar(&tokens[3..].join(" ")),
                                );
                            }
                        }
                    }
                }
                "CELL" => {
                    if tokens.len() < 8 {
                        return Err(CodecError::malformed("res", display, "short CELL line"));
                    }
                    let nums: Vec<f64> =
                        tokens[2..8].iter().filter_map(|t| t.parse().ok()).collect();
                    if nums.len() != 6 {
                        return Err(CodecError::malformed("res", display, "bad CELL numbers"));
                    }
                    abc = Some([[nums[0], nums[1], nums[2]], [nums[3], nums[4], nums[5]]]);
                    in_atoms = false;
                }
                "LATT" => {}
                "SFAC" => in_atoms = true,
                "END" => break,
                _ if in_atoms && tokens.len() >= 5 => {
                    let coords: Vec<f64> =
                        tokens[2..5].iter().filter_map(|t| t.parse().ok()).collect();
                    if coords.len() == 3 {
                        atom_types.push(tokens[0].to_string());
                        positions.push([coords[0], coords[1], coords[2]]);
                    }
                }
                _ => {}
            }
        }

        let abc =
            abc.ok_or_else(|| CodecError::malformed("res", display.clone(), "no CELL line"))?;
        if atom_types.is_empty() {
            return Err(CodecError::malformed("res", display, "no atoms"));
        }

        let lattice_cart = abc_to_cart(&abc);
        let natoms = atom_types.len();
        let mut doc = StructDoc::new(
            path.file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unknown.res"),
            atom_types,
            positions,
            lattice_cart,
        );
        doc.pressure = pressure;
        if volume.is_some() {
            doc.volume = volume;
        }
        doc.enthalpy_per_atom = enthalpy_total.map(|h: f64| h / natoms as f64);
        doc.geom_iter = geom_iter;
        doc.optimised = optimised;
        doc.extra = extra;
        Ok(doc)
    }
}

// ----------------------------------------------------------------------------
// .cell / .param input files
// ----------------------------------------------------------------------------

impl CastepCodec {
    fn render_cell(doc: &CalcDoc, spin: Option<f64>) -> String {
        let mut out = String::new();
        let cart = doc.structure.lattice_cart;
        out.push_str("%BLOCK lattice_cart\n");
        for row in cart {
            let _ = writeln!(out, "  {:.10} {:.10} {:.10}", row[0], row[1], row[2]);
        }
        out.push_str("%ENDBLOCK lattice_cart\n\n%BLOCK positions_frac\n");
        for (i, (ty, pos)) in doc
            .structure
            .atom_types
            .iter()
            .zip(&doc.structure.positions_frac)
            .enumerate()
        {
            let _ = write!(out, "  {ty} {:.10} {:.10} {:.10}", pos[0], pos[1], pos[2]);
            // Per-atom spins from the last step take precedence; otherwise an
            // initial spin on the first atom breaks spin symmetry.
            if let Some(spins) = &doc.atomic_init_spins {
                if let Some(s) = spins.get(i) {
                    let _ = write!(out, " SPIN={s:.4}");
                }
            } else if i == 0 {
                if let Some(s) = spin {
                    let _ = write!(out, " SPIN={s:.4}");
                }
            }
            out.push('\n');
        }
        out.push_str("%ENDBLOCK positions_frac\n\n");

        if let Some(spacing) = doc.kpoints_mp_spacing {
            let _ = writeln!(out, "kpoints_mp_spacing {spacing}");
        }
        if let Some(grid) = doc.kpoints_mp_grid {
            let _ = writeln!(out, "kpoints_mp_grid {} {} {}", grid[0], grid[1], grid[2]);
        }
        if let Some(offset) = doc.kpoints_mp_offset {
            let _ = writeln!(
                out,
                "kpoints_mp_offset {} {} {}",
                offset[0], offset[1], offset[2]
            );
        }
        if doc.symmetry_generate {
            out.push_str("symmetry_generate\n");
        }
        if let Some(tol) = doc.symmetry_tol {
            let _ = writeln!(out, "symmetry_tol {tol}");
        }
        if doc.snap_to_symmetry {
            out.push_str("snap_to_symmetry\n");
        }
        for (key, value) in &doc.extra {
            if CELL_RESIDUAL_KEYS.contains(&key.as_str()) {
                let _ = writeln!(out, "{key} {}", Self::render_value(value));
            }
        }
        out
    }

    fn render_param(doc: &CalcDoc) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "task : {}", doc.task);
        let _ = writeln!(out, "geom_max_iter : {}", doc.geom_max_iter);
        if let Some(method) = &doc.geom_method {
            let _ = writeln!(out, "geom_method : {method}");
        }
        if let Some(cutoff) = doc.cut_off_energy {
            let _ = writeln!(out, "cut_off_energy : {cutoff}");
        }
        if doc.write_cell_structure {
            out.push_str("write_cell_structure : true\n");
        }
        if doc.write_formatted_density {
            out.push_str("write_formatted_density : true\n");
        }
        for (key, value) in &doc.extra {
            if !CELL_RESIDUAL_KEYS.contains(&key.as_str()) {
                let _ = writeln!(out, "{key} : {}", Self::render_value(value));
            }
        }
        out
    }

    fn parse_cell_file(contents: &str) -> (CellOptions, Option<[[f64; 3]; 3]>, Vec<(String, [f64; 3])>) {
        let mut options = CellOptions::default();
        let mut lattice: Option<[[f64; 3]; 3]> = None;
        let mut positions: Vec<(String, [f64; 3])> = Vec::new();
        let mut block: Option<String> = None;
        let mut block_lines: Vec<String> = Vec::new();

        for raw in contents.lines() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let lower = line.to_ascii_lowercase();

            if let Some(name) = lower.strip_prefix("%block") {
                block = Some(name.trim().to_string());
                block_lines.clear();
                continue;
            }
            if lower.starts_with("%endblock") {
                if let Some(name) = block.take() {
                    match name.as_str() {
                        "lattice_cart" => {
                            let rows: Vec<[f64; 3]> = block_lines
                                .iter()
                                .filter_map(|l| {
                                    let v: Vec<f64> = l
                                        .split_whitespace()
                                        .filter_map(|t| t.parse().ok())
                                        .collect();
                                    (v.len() == 3).then(|| [v[0], v[1], v[2]])
                                })
                                .collect();
                            if rows.len() == 3 {
                                lattice = Some([rows[0], rows[1], rows[2]]);
                                // Park the raw block in the residual map so the
                                // purity strip on assembly can discard it.
                                options.extra.insert(
                                    "lattice_cart".into(),
                                    serde_json::json!(rows),
                                );
                            }
                        }
                        "positions_frac" => {
                            for l in &block_lines {
                                let t: Vec<&str> = l.split_whitespace().collect();
                                if t.len() >= 4 {
                                    let v: Vec<f64> =
                                        t[1..4].iter().filter_map(|x| x.parse().ok()).collect();
                                    if v.len() == 3 {
                                        positions.push((t[0].to_string(), [v[0], v[1], v[2]]));
                                    }
                                }
                            }
                            if !positions.is_empty() {
                                options.extra.insert(
                                    "positions_frac".into(),
                                    serde_json::json!(positions
                                        .iter()
                                        .map(|(_, p)| *p)
                                        .collect::<Vec<_>>()),
                                );
                            }
                        }
                        other => {
                            options
                                .extra
                                .insert(other.to_string(), Value::String(block_lines.join("\n")));
                        }
                    }
                }
                continue;
            }
            if block.is_some() {
                block_lines.push(line.to_string());
                continue;
            }

            let tokens: Vec<&str> = line.split_whitespace().collect();
            let key = tokens[0].to_ascii_lowercase();
            match key.as_str() {
                "kpoints_mp_spacing" => {
                    options.kpoints_mp_spacing = tokens.get(1).and_then(|t| t.parse().ok());
                }
                "kpoints_mp_grid" => {
                    let v: Vec<u32> = tokens[1..].iter().filter_map(|t| t.parse().ok()).collect();
                    if v.len() == 3 {
                        options.kpoints_mp_grid = Some([v[0], v[1], v[2]]);
                    }
                }
                "kpoints_mp_offset" => {
                    let v: Vec<f64> = tokens[1..].iter().filter_map(|t| t.parse().ok()).collect();
                    if v.len() == 3 {
                        options.kpoints_mp_offset = Some([v[0], v[1], v[2]]);
                    }
                }
                "symmetry_generate" => options.symmetry_generate = true,
                "symmetry_tol" => {
                    options.symmetry_tol = tokens.get(1).and_then(|t| t.parse().ok());
                }
                "snap_to_symmetry" => options.snap_to_symmetry = true,
                _ => {
                    let value = if tokens.len() > 1 {
                        Self::parse_scalar(&tokens[1..].join(" "))
                    } else {
                        Value::Bool(true)
                    };
                    options.extra.insert(key, value);
                }
            }
        }

        (options, lattice, positions)
    }
}

// ----------------------------------------------------------------------------
// .castep log scraping
// ----------------------------------------------------------------------------

impl CastepCodec {
    fn parse_castep_log(contents: &str) -> ScrapedDoc {
        let mut doc = ScrapedDoc::default();
        let lines: Vec<&str> = contents.lines().collect();
        let mut any_marker = false;

        let first_float = |line: &str| -> Option<f64> {
            line.split_whitespace()
                .filter_map(|t| t.trim_matches(|c| c == '*' || c == '=').parse().ok())
                .next()
        };

        let mut i = 0;
        while i < lines.len() {
            let line = lines[i];

            if line.contains("completed successfully") {
                doc.optimised = true;
                any_marker = true;
            } else if line.contains("failed to converge") {
                doc.optimised = false;
                any_marker = true;
            } else if line.contains("finished iteration") {
                // e.g. "BFGS: finished iteration 12 with enthalpy= -2.15E+002 eV"
                any_marker = true;
                let tokens: Vec<&str> = line.split_whitespace().collect();
                if let Some(pos) = tokens.iter().position(|t| *t == "iteration") {
                    doc.geom_iter = tokens.get(pos + 1).and_then(|t| t.parse().ok());
                }
                if let Some(pos) = tokens.iter().position(|t| t.starts_with("enthalpy=")) {
                    let inline = tokens[pos].trim_start_matches("enthalpy=");
                    let candidate = if inline.is_empty() {
                        tokens.get(pos + 1).copied()
                    } else {
                        Some(inline)
                    };
                    if let Some(h) = candidate.and_then(|t| t.parse::<f64>().ok()) {
                        doc.extra
                            .insert("enthalpy".into(), Value::from(h));
                    }
                }
            } else if line.contains("Final Enthalpy") {
                any_marker = true;
                if let Some(h) = first_float(line.split('=').nth(1).unwrap_or("")) {
                    doc.extra.insert("enthalpy".into(), Value::from(h));
                }
            } else if line.contains("enthalpy per atom") {
                any_marker = true;
                doc.enthalpy_per_atom = first_float(line.split('=').nth(1).unwrap_or(line));
            } else if line.contains("Pressure:") {
                doc.pressure = first_float(line.split("Pressure:").nth(1).unwrap_or(""));
            } else if line.contains("|F|max") && doc.max_force_on_atom.is_none() {
                doc.max_force_on_atom = first_float(line.split('|').next_back().unwrap_or(""));
            } else if line.contains("Approx. total storage required per process") {
                any_marker = true;
                doc.estimated_mem_mb = first_float(line);
            } else if line.contains("Real Lattice(A)") {
                let mut rows = Vec::new();
                for l in lines.iter().skip(i + 1).take(3) {
                    let v: Vec<f64> = l
                        .split_whitespace()
                        .filter_map(|t| t.parse().ok())
                        .take(3)
                        .collect();
                    if v.len() == 3 {
                        rows.push([v[0], v[1], v[2]]);
                    }
                }
                if rows.len() == 3 {
                    doc.lattice_cart = Some([rows[0], rows[1], rows[2]]);
                    any_marker = true;
                }
            } else if line.contains("Fractional coordinates of atoms") {
                let mut types = Vec::new();
                let mut coords = Vec::new();
                for l in lines.iter().skip(i + 1) {
                    let t: Vec<&str> = l.split_whitespace().collect();
                    // table rows look like: "x  Si   1   0.25  0.25  0.25  x"
                    if t.len() >= 6 && t[0] == "x" && t[1].chars().all(char::is_alphabetic) {
                        let v: Vec<f64> =
                            t[3..6].iter().filter_map(|x| x.parse().ok()).collect();
                        if v.len() == 3 {
                            types.push(t[1].to_string());
                            coords.push([v[0], v[1], v[2]]);
                        }
                    } else if !types.is_empty() {
                        break;
                    }
                }
                if !types.is_empty() {
                    doc.atom_types = Some(types);
                    doc.positions_frac = Some(coords);
                    any_marker = true;
                }
            } else if line.contains("Atomic Populations (Mulliken)") {
                let mut spins = Vec::new();
                let mut saw_header = false;
                for l in lines.iter().skip(i + 1) {
                    if l.contains("Spin") {
                        saw_header = true;
                        continue;
                    }
                    let t: Vec<&str> = l.split_whitespace().collect();
                    if saw_header
                        && t.len() >= 3
                        && t[0].chars().all(char::is_alphabetic)
                        && t[1].parse::<u32>().is_ok()
                    {
                        if let Some(s) = t.last().and_then(|x| x.parse::<f64>().ok()) {
                            spins.push(s);
                        }
                    } else if saw_header && !t.is_empty() && spins.len() > 0 {
                        break;
                    }
                }
                if !spins.is_empty() {
                    doc.mulliken_spins = Some(spins);
                }
            } else if line.contains("geom_iter") {
                // checkpoint marker written by some builds
                doc.geom_iter = first_float(line).map(|f| f as u32).or(doc.geom_iter);
            }
            i += 1;
        }

        // enthalpy per atom derives from the last total enthalpy if the log
        // never printed the per-atom form
        if doc.enthalpy_per_atom.is_none() {
            if let (Some(Value::Number(h)), Some(types)) =
                (doc.extra.get("enthalpy"), doc.atom_types.as_ref())
            {
                if let Some(h) = h.as_f64() {
                    doc.enthalpy_per_atom = Some(h / types.len() as f64);
                }
            }
        }

        doc.extra
            .insert("__recognised".into(), Value::Bool(any_marker));
        doc
    }
}

// ----------------------------------------------------------------------------
// Trait wiring
// ----------------------------------------------------------------------------

impl Codec for CastepCodec {
    fn parse_structure(&self, path: &Path) -> Result<StructDoc, CodecError> {
        let contents = Self::read(path)?;
        Self::parse_res(path, &contents)
    }

    fn parse_simulator_log(&self, path: &Path) -> Result<ScrapedDoc, CodecError> {
        let contents = Self::read(path)?;
        let mut doc = Self::parse_castep_log(&contents);
        let recognised = matches!(
            doc.extra.remove("__recognised"),
            Some(Value::Bool(true))
        );
        if !recognised {
            return Err(CodecError::malformed(
                "castep",
                path.display().to_string(),
                "no recognisable simulator output",
            ));
        }
        Ok(doc)
    }

    fn parse_cell_output(&self, path: &Path) -> Result<CellOutput, CodecError> {
        let contents = Self::read(path)?;
        let (_, lattice, positions) = Self::parse_cell_file(&contents);
        let lattice_cart = lattice.ok_or_else(|| {
            CodecError::malformed("cell", path.display().to_string(), "no lattice_cart block")
        })?;
        Ok(CellOutput {
            lattice_cart,
            positions_frac: (!positions.is_empty()).then_some(positions),
        })
    }

    fn parse_cell_options(&self, path: &Path) -> Result<CellOptions, CodecError> {
        let contents = Self::read(path)?;
        let (options, _, _) = Self::parse_cell_file(&contents);
        Ok(options)
    }

    fn parse_param_options(&self, path: &Path) -> Result<ParamOptions, CodecError> {
        let contents = Self::read(path)?;
        let mut options = ParamOptions::default();
        for raw in contents.lines() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once(':') {
                Some((k, v)) => (k.trim().to_ascii_lowercase(), v.trim().to_string()),
                None => {
                    let mut it = line.split_whitespace();
                    let k = it.next().unwrap_or("").to_ascii_lowercase();
                    (k, it.collect::<Vec<_>>().join(" "))
                }
            };
            match key.as_str() {
                "task" => options.task = value,
                "geom_max_iter" => {
                    options.geom_max_iter = value.parse().map_err(|_| {
                        CodecError::malformed(
                            "param",
                            path.display().to_string(),
                            format!("bad geom_max_iter: {value}"),
                        )
                    })?;
                }
                "geom_method" => options.geom_method = Some(value),
                "cut_off_energy" => options.cut_off_energy = value.parse().ok(),
                "write_cell_structure" => {
                    options.write_cell_structure = value.eq_ignore_ascii_case("true")
                }
                "write_formatted_density" => {
                    options.write_formatted_density = value.eq_ignore_ascii_case("true")
                }
                _ => {
                    options.extra.insert(key, Self::parse_scalar(&value));
                }
            }
        }
        Ok(options)
    }

    fn write_structure(&self, doc: &StructDoc, path: &Path) -> Result<(), CodecError> {
        Self::write(path, &Self::render_res(doc))
    }

    fn write_cell(&self, doc: &CalcDoc, path: &Path, spin: Option<f64>) -> Result<(), CodecError> {
        Self::write(path, &Self::render_cell(doc, spin))
    }

    fn write_parameters(&self, doc: &CalcDoc, path: &Path) -> Result<(), CodecError> {
        Self::write(path, &Self::render_param(doc))
    }

    fn verify_calculation_parameters(
        &self,
        calc: &CalcDoc,
        _structure: &StructDoc,
    ) -> Result<(), ComputeError> {
        if calc.task.trim().is_empty() {
            return Err(ComputeError::Input("calculation has no task".into()));
        }
        if calc.kpoints_mp_spacing.is_some() && calc.kpoints_mp_grid.is_some() {
            return Err(ComputeError::Input(
                "kpoints_mp_spacing and kpoints_mp_grid are mutually exclusive".into(),
            ));
        }
        if calc.kpoints_mp_spacing.is_some_and(|s| s <= 0.0) {
            return Err(ComputeError::Input(
                "kpoints_mp_spacing must be positive".into(),
            ));
        }
        if calc.cut_off_energy.is_some_and(|c| c <= 0.0) {
            return Err(ComputeError::Input("cut_off_energy must be positive".into()));
        }
        if calc.task.contains("GEOMETRYOPTIMI") && calc.geom_max_iter == 0 {
            return Err(ComputeError::Input(
                "geom_max_iter must be positive for a geometry optimisation".into(),
            ));
        }
        Ok(())
    }

    fn verify_simulation_cell(&self, structure: &StructDoc) -> Result<(), ComputeError> {
        if structure.atom_types.is_empty() {
            return Err(ComputeError::Input("structure contains no atoms".into()));
        }
        if structure.atom_types.len() != structure.positions_frac.len() {
            return Err(ComputeError::Input(
                "species and position counts disagree".into(),
            ));
        }
        let volume = cell_volume(&structure.lattice_cart);
        if !volume.is_finite() || volume < 1e-3 {
            return Err(ComputeError::Input(format!(
                "simulation cell volume {volume} is unphysical"
            )));
        }
        Ok(())
    }
}

// ============================================================================
// 2. TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StructDoc {
        let mut doc = StructDoc::new(
            "NaCl.res",
            vec!["Na".into(), "Cl".into()],
            vec![[0.0, 0.0, 0.0], [0.5, 0.5, 0.5]],
            [[5.64, 0.0, 0.0], [0.0, 5.64, 0.0], [0.0, 0.0, 5.64]],
        );
        doc.pressure = Some(0.05);
        doc.enthalpy_per_atom = Some(-105.25);
        doc.geom_iter = 6;
        doc.extra
            .insert("spacegroup".into(), Value::String("Fm-3m".into()));
        doc
    }

    #[test]
    fn res_round_trip_preserves_authoritative_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("NaCl.res");
        let codec = CastepCodec;

        let original = sample();
        codec.write_structure(&original, &path).unwrap();
        let parsed = codec.parse_structure(&path).unwrap();

        assert_eq!(parsed.atom_types, original.atom_types);
        for (a, b) in parsed
            .positions_frac
            .iter()
            .zip(&original.positions_frac)
        {
            for k in 0..3 {
                assert!((a[k] - b[k]).abs() < 1e-8);
            }
        }
        for k in 0..3 {
            assert!((parsed.lattice_abc[0][k] - original.lattice_abc[0][k]).abs() < 1e-6);
            assert!((parsed.lattice_abc[1][k] - original.lattice_abc[1][k]).abs() < 1e-4);
        }
        assert_eq!(parsed.geom_iter, 6);
        assert!((parsed.enthalpy_per_atom.unwrap() + 105.25).abs() < 1e-6);
        assert_eq!(
            parsed.extra.get("spacegroup"),
            Some(&Value::String("Fm-3m".into()))
        );
    }

    #[test]
    fn cell_and_param_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let codec = CastepCodec;

        let cell = CellOptions {
            kpoints_mp_spacing: Some(0.05),
            symmetry_generate: true,
            symmetry_tol: Some(0.01),
            ..Default::default()
        };
        let param = ParamOptions {
            task: "geometryoptimisation".into(),
            geom_max_iter: 100,
            geom_method: Some("lbfgs".into()),
            cut_off_energy: Some(500.0),
            ..Default::default()
        };
        let calc = CalcDoc::assemble(sample(), &cell, &param);

        let cell_path = dir.path().join("NaCl.cell");
        let param_path = dir.path().join("NaCl.param");
        codec.write_cell(&calc, &cell_path, None).unwrap();
        codec.write_parameters(&calc, &param_path).unwrap();

        let cell_back = codec.parse_cell_options(&cell_path).unwrap();
        assert_eq!(cell_back.kpoints_mp_spacing, Some(0.05));
        assert!(cell_back.symmetry_generate);
        assert_eq!(cell_back.symmetry_tol, Some(0.01));

        let param_back = codec.parse_param_options(&param_path).unwrap();
        assert_eq!(param_back.task, "GEOMETRYOPTIMISATION");
        assert_eq!(param_back.geom_max_iter, 100);
        assert_eq!(param_back.cut_off_energy, Some(500.0));
        assert_eq!(param_back.geom_method.as_deref(), Some("lbfgs"));
    }

    #[test]
    fn out_cell_lattice_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("NaCl-out.cell");
        std::fs::write(
            &path,
            "%BLOCK lattice_cart\n 5.6000000000 0.0 0.0\n 0.0 5.6000000000 0.0\n 0.0 0.0 5.6000000000\n%ENDBLOCK lattice_cart\n",
        )
        .unwrap();
        let out = CastepCodec.parse_cell_output(&path).unwrap();
        assert!((out.lattice_cart[0][0] - 5.6).abs() < 1e-9);
    }

    #[test]
    fn castep_log_scrape_reads_progress_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("NaCl.castep");
        std::fs::write(
            &path,
            concat!(
                "BFGS: finished iteration 3 with enthalpy= -210.50000000 eV\n",
                " *  Pressure:   0.0510  *\n",
                "BFGS: Geometry optimization completed successfully.\n",
            ),
        )
        .unwrap();
        let scrape = CastepCodec.parse_simulator_log(&path).unwrap();
        assert!(scrape.optimised);
        assert_eq!(scrape.geom_iter, Some(3));
        assert!((scrape.pressure.unwrap() - 0.051).abs() < 1e-9);
    }

    #[test]
    fn dryrun_memory_estimate_is_scraped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem.castep");
        std::fs::write(
            &path,
            "Approx. total storage required per process 2000.0 MB\n",
        )
        .unwrap();
        let scrape = CastepCodec.parse_simulator_log(&path).unwrap();
        assert_eq!(scrape.estimated_mem_mb, Some(2000.0));
    }

    #[test]
    fn unrecognisable_log_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.castep");
        std::fs::write(&path, "segfault core dumped\n").unwrap();
        assert!(CastepCodec.parse_simulator_log(&path).is_err());
    }

    #[test]
    fn contradictory_kpoint_specs_are_rejected() {
        let cell = CellOptions {
            kpoints_mp_spacing: Some(0.05),
            kpoints_mp_grid: Some([2, 2, 2]),
            ..Default::default()
        };
        let calc = CalcDoc::assemble(sample(), &cell, &ParamOptions::default());
        let err = CastepCodec
            .verify_calculation_parameters(&calc, &calc.structure)
            .unwrap_err();
        assert!(matches!(err, ComputeError::Input(_)));
    }

    #[test]
    fn degenerate_cell_is_rejected() {
        let structure = StructDoc::new(
            "flat.res",
            vec!["C".into()],
            vec![[0.0, 0.0, 0.0]],
            [[1.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
        );
        assert!(CastepCodec.verify_simulation_cell(&structure).is_err());
    }
}
