// src/workspace.rs
//
// =============================================================================
// RELAXRUN: WORKSPACE COORDINATOR
// =============================================================================
//
// The shared-folder protocol that lets N independent drivers cooperate on
// one directory without double-starting a structure.
//
// Rules:
// - `<seed>.res.lock` in the root is the authoritative claim marker.
// - `input/` holds a pristine copy of every original input, written once.
// - `completed/` and `bad_castep/` are the only final destinations.
// - The optional compute directory is scratch; every exit path copies
//   results back and the cleanup routine is idempotent.
//
// Nothing here touches the process-wide working directory: the active
// directory is an explicit path handed to child processes.

use crate::errors::ComputeError;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub struct Workspace {
    root: PathBuf,
    compute_dir: Option<PathBuf>,
    work_dir: PathBuf,
}

/// Which files survive a move to `completed/` when intermediates are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepPolicy {
    pub kpts_1d: bool,
    pub conv_mode: bool,
    pub formatted_density: bool,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>, compute_dir: Option<PathBuf>) -> Self {
        let root = root.into();
        Self {
            work_dir: root.clone(),
            root,
            compute_dir,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory the child runs in: the compute dir once entered, else root.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Default per-host scratch name, to spread load off shared filesystems.
    pub fn per_host_dir_name() -> String {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "compute".into())
    }

    // ------------------------------------------------------------------------
    // Claim protocol
    // ------------------------------------------------------------------------

    pub fn lock_path(&self, seed: &str) -> PathBuf {
        self.root.join(format!("{seed}.res.lock"))
    }

    pub fn is_locked(&self, seed: &str) -> bool {
        self.lock_path(seed).exists()
    }

    /// Exclusive-create the lock file. A race loser gets `false` and must
    /// move on to the next seed.
    pub fn claim(&self, seed: &str) -> io::Result<bool> {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.lock_path(seed))
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove the claim marker. Idempotent; called on every exit path.
    pub fn release(&self, seed: &str) {
        let lock = self.lock_path(seed);
        if lock.exists() {
            if let Err(e) = fs::remove_file(&lock) {
                log::warn!(target: seed, "could not remove lock file: {e}");
            }
        }
    }

    /// Advisory append to the shared jobs log; the lock file stays
    /// authoritative, so contention here is acceptable.
    pub fn append_jobs_log(&self, seed: &str) {
        use std::io::Write;
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join("jobs.txt"))
            .and_then(|mut f| writeln!(f, "{seed}"));
        if let Err(e) = result {
            log::warn!(target: seed, "could not append to jobs log: {e}");
        }
    }

    pub fn append_finished_log(&self, seed: &str) {
        use std::io::Write;
        let result = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.root.join("finished_cleanly.txt"))
            .and_then(|mut f| writeln!(f, "{seed}"));
        if let Err(e) = result {
            log::warn!(target: seed, "could not append to finished log: {e}");
        }
    }

    // ------------------------------------------------------------------------
    // Input snapshot
    // ------------------------------------------------------------------------

    /// Copy the original input into `input/`, never overwriting an existing
    /// snapshot. `glob_files` grabs every `<seed>*` sibling (generic mode).
    pub fn snapshot_input(&self, seed: &str, glob_files: bool) -> io::Result<()> {
        let input_dir = self.root.join("input");
        fs::create_dir_all(&input_dir)?;

        let candidates: Vec<PathBuf> = if glob_files {
            prefixed_files(&self.work_dir, seed)?
                .into_iter()
                .filter(|p| !has_suffix(p, ".lock"))
                .collect()
        } else {
            vec![self.work_dir.join(format!("{seed}.res"))]
        };

        for path in candidates {
            if !path.is_file() {
                continue;
            }
            let target = input_dir.join(path.file_name().unwrap());
            if !target.exists() {
                log::debug!(target: seed, "snapshotting {} to input/", path.display());
                fs::copy(&path, &target)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Compute-directory discipline
    // ------------------------------------------------------------------------

    /// Create the compute directory, symlink it into the root when it lives
    /// elsewhere, stage pseudopotentials (and the custom param file), and
    /// make it the active working directory.
    pub fn enter_compute_dir(
        &mut self,
        seed: &str,
        custom_params: bool,
    ) -> Result<(), ComputeError> {
        let Some(compute) = self.compute_dir.clone() else {
            return Ok(());
        };
        log::info!(target: seed, "using compute dir {}", compute.display());

        let io_err = |what: &str, e: io::Error| {
            ComputeError::StructureFailed(format!("compute dir {what}: {e}"))
        };

        fs::create_dir_all(&compute).map_err(|e| io_err("create", e))?;

        // Scratch that lives outside the root gets a symlink inside it, so
        // the shared folder still shows where a seed went.
        if !compute.starts_with(&self.root) {
            if let Some(name) = compute.file_name() {
                let link = self.root.join(name);
                // a dangling symlink from an earlier run is replaced; a real
                // file or directory with the same name is left alone
                if link.symlink_metadata().is_ok() && !link.exists() {
                    let _ = fs::remove_file(&link);
                }
                if link.symlink_metadata().is_err() {
                    #[cfg(unix)]
                    std::os::unix::fs::symlink(&compute, &link)
                        .map_err(|e| io_err("symlink", e))?;
                }
            }
        }

        // Pseudopotentials live next to the inputs and are needed in scratch.
        for entry in fs::read_dir(&self.root).map_err(|e| io_err("scan", e))? {
            let path = entry.map_err(|e| io_err("scan", e))?.path();
            if has_suffix(&path, ".usp") && path.is_file() {
                let target = compute.join(path.file_name().unwrap());
                fs::copy(&path, &target).map_err(|e| io_err("stage pspot", e))?;
            }
        }
        if custom_params {
            let param = self.root.join(format!("{seed}.param"));
            if param.is_file() {
                fs::copy(&param, compute.join(format!("{seed}.param")))
                    .map_err(|e| io_err("stage param", e))?;
            }
        }

        self.work_dir = compute;
        Ok(())
    }

    /// Copy the checkpointable artifacts back to the root. Used after every
    /// step so a walltime kill in the next one loses nothing.
    pub fn copy_back(&self, seed: &str) {
        if self.work_dir == self.root {
            return;
        }
        for ext in [".res", ".castep"] {
            let src = self.work_dir.join(format!("{seed}{ext}"));
            if src.is_file() {
                if let Err(e) = fs::copy(&src, self.root.join(format!("{seed}{ext}"))) {
                    log::warn!(target: seed, "could not copy {ext} back to root: {e}");
                }
            }
        }
    }

    /// Move everything for this seed out of scratch and back to the root;
    /// the walltime path, which must leave the seed fully re-claimable.
    pub fn evacuate_compute_dir(&self, seed: &str) {
        if self.work_dir == self.root {
            return;
        }
        if let Ok(files) = prefixed_files(&self.work_dir, seed) {
            for path in files {
                let target = self.root.join(path.file_name().unwrap());
                if fs::copy(&path, &target).is_ok() {
                    let _ = fs::remove_file(&path);
                }
            }
        }
    }

    /// Delete the compute directory if no calculation remains inside it.
    /// Safe to call any number of times, on any exit path.
    pub fn remove_compute_dir_if_finished(&self) -> io::Result<bool> {
        let Some(compute) = &self.compute_dir else {
            return Ok(false);
        };
        if !compute.is_dir() {
            return Ok(false);
        }

        let entries: Vec<PathBuf> = fs::read_dir(compute)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();

        for path in &entries {
            if has_suffix(path, ".res") || has_suffix(path, ".castep") {
                log::debug!(
                    "leaving {} alone, it still holds {}",
                    compute.display(),
                    path.display()
                );
                return Ok(false);
            }
        }

        for path in entries {
            if path.is_file() {
                let _ = fs::remove_file(&path);
            }
        }
        fs::remove_dir(compute)?;

        if let Some(name) = compute.file_name() {
            let link = self.root.join(name);
            if link.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false) {
                let _ = fs::remove_file(&link);
            }
        }
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Final moves
    // ------------------------------------------------------------------------

    /// Move every file belonging to the seed into `bad_castep/`, then purge
    /// whatever is left of the seed in the root (lock included).
    pub fn mv_to_bad(&self, seed: &str) {
        let bad_dir = self.root.join("bad_castep");
        log::info!(target: seed, "moving files to {}", bad_dir.display());
        if let Err(e) = fs::create_dir_all(&bad_dir) {
            log::warn!(target: seed, "could not create bad_castep: {e}");
            return;
        }

        if let Ok(files) = prefixed_files(&self.work_dir, seed) {
            for path in files {
                if has_suffix(&path, ".lock") {
                    continue;
                }
                move_file(&path, &bad_dir.join(path.file_name().unwrap()))
                    .unwrap_or_else(|e| log::warn!(target: seed, "move to bad failed: {e}"));
            }
        }

        // Anything the seed left in the root (including the claim marker)
        // must not survive a failure.
        if let Ok(files) = prefixed_files(&self.root, seed) {
            for path in files {
                let _ = fs::remove_file(&path);
            }
        }
    }

    /// Move the seed's files into `completed/<dir>/`. `keep` preserves every
    /// intermediate; otherwise only the whitelist travels.
    pub fn mv_to_completed(
        &self,
        seed: &str,
        completed_dir: &str,
        keep: bool,
        policy: KeepPolicy,
    ) {
        let completed = self.root.join(completed_dir);
        log::info!(target: seed, "moving files to {}", completed.display());
        if let Err(e) = fs::create_dir_all(&completed) {
            log::warn!(target: seed, "could not create {completed_dir}: {e}");
            return;
        }

        // Backups and claim markers never travel.
        if let Ok(files) = prefixed_files(&self.work_dir, seed) {
            for path in files {
                if has_suffix(&path, "_bak") || has_suffix(&path, ".lock") {
                    let _ = fs::remove_file(&path);
                }
            }
        }

        if keep {
            if let Ok(files) = prefixed_files(&self.work_dir, seed) {
                for path in files {
                    move_file(&path, &completed.join(path.file_name().unwrap()))
                        .unwrap_or_else(
                            |e| log::warn!(target: seed, "move to completed failed: {e}"),
                        );
                }
            }
        } else {
            let mut exts: Vec<String> = vec![".castep".into()];
            if policy.kpts_1d {
                exts.push(".param".into());
            }
            if !policy.conv_mode {
                exts.push(".res".into());
            }
            if self.work_dir.join(format!("{seed}-out.cell")).is_file() {
                exts.push("-out.cell".into());
            }
            if policy.formatted_density {
                exts.push(".den_fmt".into());
            }
            for ext in exts {
                let src = self.work_dir.join(format!("{seed}{ext}"));
                if src.is_file() {
                    move_file(&src, &completed.join(format!("{seed}{ext}")))
                        .unwrap_or_else(
                            |e| log::warn!(target: seed, "move to completed failed: {e}"),
                        );
                }
            }
        }

        // Purge the seed from the root; the claim ends here.
        if let Ok(files) = prefixed_files(&self.root, seed) {
            for path in files {
                let _ = fs::remove_file(&path);
            }
        }
    }

    /// Delete working files the seed no longer needs, keeping the structure
    /// and the log.
    pub fn tidy_up(&self, seed: &str) {
        if let Ok(files) = prefixed_files(&self.work_dir, seed) {
            let survivors: Vec<_> = files
                .iter()
                .filter(|p| !has_suffix(p, ".res") && !has_suffix(p, ".castep"))
                .collect();
            if !survivors.is_empty() {
                log::info!(target: seed, "tidying up {} leftover files", survivors.len());
            }
            for path in survivors {
                let _ = fs::remove_file(path);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

/// Every regular file in `dir` belonging to the seed: `<seed>.*` and
/// `<seed>-out.*`. Prefix matching is exact up to the separator, so seed
/// "Na" never captures "NaCl.res".
fn prefixed_files(dir: &Path, seed: &str) -> io::Result<Vec<PathBuf>> {
    let dot = format!("{seed}.");
    let out = format!("{seed}-out.");
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("");
            (name.starts_with(&dot) || name.starts_with(&out)) && p.is_file()
        })
        .collect();
    files.sort();
    Ok(files)
}

fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(suffix))
}

/// Rename where possible, copy-and-delete across filesystems.
fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)?;
            fs::remove_file(src)
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
