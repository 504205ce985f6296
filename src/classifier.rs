// src/classifier.rs
//
// =============================================================================
// RELAXRUN: ERROR CLASSIFIER
// =============================================================================
//
// Inspects the exit code and any `<seed>*err` sidecar files the simulator
// left behind, and decides whether the failure is worth a retry.
//
// Remedies are tagged values interpreted by the driver; no callbacks are
// smuggled through state.

use crate::core::CalcDoc;
use std::fs;
use std::path::Path;

/// Line emitted when the simulator recovered from a LAPACK issue by itself;
/// the sidecar is noise and is deleted.
const WORKAROUND_LINE: &str = "Work-around was successful, continuing with calculation.";
/// Symmetry failure that usually disappears once symmetry is switched off.
const CONSTRAINT_LINE: &str = "ERROR in cell constraints: attempt to fix";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Remedy {
    /// Drop symmetry_generate / symmetry_tol / snap_to_symmetry.
    StripSymmetry,
}

impl Remedy {
    pub fn apply(&self, doc: &mut CalcDoc) {
        match self {
            Remedy::StripSymmetry => {
                doc.symmetry_generate = false;
                doc.symmetry_tol = None;
                doc.snap_to_symmetry = false;
                for key in ["symmetry_generate", "symmetry_tol", "snap_to_symmetry"] {
                    doc.extra.remove(key);
                }
            }
        }
    }
}

impl std::fmt::Display for Remedy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Remedy::StripSymmetry => f.write_str("strip symmetry keywords"),
        }
    }
}

#[derive(Debug, Default)]
pub struct ErrorReport {
    pub errors_present: bool,
    pub message: String,
    pub remedy: Option<Remedy>,
}

/// Scan `dir` for `<seed>*err` files (ignoring `*opt_err`) and combine them
/// with the exit code into one report.
///
/// A file whose first notable line is the work-around marker is deleted and
/// ignored. A cell-constraints error tags the symmetry remedy but still
/// counts as an error, so the driver's retry path sees it.
pub fn classify(seed: &str, dir: &Path, exit_code: Option<i32>) -> ErrorReport {
    let mut report = ErrorReport::default();

    if let Some(code) = exit_code {
        if code != 0 {
            report.errors_present = true;
            report.message = format!("simulator returned non-zero error code {code}.\n");
        }
    }

    let mut err_files: Vec<_> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
                name.starts_with(seed) && name.ends_with("err") && !name.ends_with("opt_err")
            })
            .collect(),
        Err(_) => Vec::new(),
    };
    err_files.sort();

    for path in err_files {
        let contents = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => continue,
        };

        let mut worked_around = false;
        for line in contents.lines() {
            if line.contains(WORKAROUND_LINE) {
                log::info!(
                    target: seed,
                    "found an issue the simulator circumvented itself, removing {}",
                    path.display()
                );
                let _ = fs::remove_file(&path);
                worked_around = true;
                break;
            }
            if line.contains(CONSTRAINT_LINE) {
                log::info!(target: seed, "tagging symmetry remedy for retry");
                report.remedy = Some(Remedy::StripSymmetry);
            }
        }

        if !worked_around {
            report.errors_present = true;
            report.message.push_str(&contents);
            report.message.push('\n');
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CalcDoc, CellOptions, ParamOptions, StructDoc};
    use std::io::Write;

    fn write_err(dir: &Path, name: &str, contents: &str) {
        let mut f = fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn clean_exit_with_no_sidecars_is_clean() {
        let dir = tempfile::tempdir().unwrap();
        let report = classify("seed", dir.path(), Some(0));
        assert!(!report.errors_present);
        assert!(report.remedy.is_none());
    }

    #[test]
    fn non_zero_exit_code_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let report = classify("seed", dir.path(), Some(139));
        assert!(report.errors_present);
        assert!(report.message.contains("139"));
    }

    #[test]
    fn workaround_file_is_deleted_and_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_err(
            dir.path(),
            "seed.0001.err",
            "some noise\nWork-around was successful, continuing with calculation.\n",
        );
        let report = classify("seed", dir.path(), Some(0));
        assert!(!report.errors_present);
        assert!(!dir.path().join("seed.0001.err").exists());
    }

    #[test]
    fn constraint_error_tags_the_symmetry_remedy() {
        let dir = tempfile::tempdir().unwrap();
        write_err(
            dir.path(),
            "seed.0001.err",
            "ERROR in cell constraints: attempt to fix\n",
        );
        let report = classify("seed", dir.path(), Some(1));
        assert!(report.errors_present);
        assert_eq!(report.remedy, Some(Remedy::StripSymmetry));
        assert!(report.message.contains("cell constraints"));
    }

    #[test]
    fn opt_err_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_err(dir.path(), "seed.opt_err", "line search failed\n");
        let report = classify("seed", dir.path(), Some(0));
        assert!(!report.errors_present);
    }

    #[test]
    fn other_seeds_sidecars_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_err(dir.path(), "other.0001.err", "boom\n");
        let report = classify("seed", dir.path(), Some(0));
        assert!(!report.errors_present);
    }

    #[test]
    fn strip_symmetry_clears_the_doc() {
        let structure = StructDoc::new(
            "x.res",
            vec!["Na".into()],
            vec![[0.0, 0.0, 0.0]],
            [[4.0, 0.0, 0.0], [0.0, 4.0, 0.0], [0.0, 0.0, 4.0]],
        );
        let cell = CellOptions {
            symmetry_generate: true,
            symmetry_tol: Some(0.01),
            snap_to_symmetry: true,
            ..Default::default()
        };
        let mut doc = CalcDoc::assemble(structure, &cell, &ParamOptions::default());
        Remedy::StripSymmetry.apply(&mut doc);
        assert!(!doc.symmetry_generate);
        assert!(doc.symmetry_tol.is_none());
        assert!(!doc.snap_to_symmetry);
    }
}
