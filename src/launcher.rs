// src/launcher.rs
//
// =============================================================================
// RELAXRUN: PROCESS LAUNCHER
// =============================================================================
//
// Builds the argv for one child invocation and starts it.
//
// Responsibilities:
// 1. `$seed` template substitution (argv and redirect file).
// 2. MPI wrapping: nice / ssh / aprun / srun / mpirun, single- and multi-node.
// 3. Lazy MPI auto-detection, checked against any user assertion.
// 4. One-shot executable self-test with core halving on oversubscription.

use crate::errors::ComputeError;
use std::path::Path;
use std::process::Stdio;
use tokio::process::{Child, Command};

/// Magic string expected from the simulator's `--version` output.
const VERSION_MAGIC: &str = "CASTEP version";
/// OpenMPI oversubscription complaint; remedied by halving the core count.
const SLOTS_ERROR: &str = "not enough slots";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpiLibrary {
    /// OpenMPI-style `mpirun`.
    Default,
    Intel,
    /// Cray `aprun`.
    Archer,
    /// `srun`.
    Slurm,
    /// No wrapper at all.
    None,
}

impl std::fmt::Display for MpiLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MpiLibrary::Default => "default",
            MpiLibrary::Intel => "intel",
            MpiLibrary::Archer => "archer",
            MpiLibrary::Slurm => "slurm",
            MpiLibrary::None => "none",
        };
        f.write_str(name)
    }
}

pub struct Launcher {
    executable: String,
    redirect: Option<String>,
    ncores: usize,
    nnodes: usize,
    node: Option<String>,
    asserted: Option<MpiLibrary>,
    detected: Option<MpiLibrary>,
}

impl Launcher {
    pub fn new(
        executable: impl Into<String>,
        ncores: usize,
        nnodes: usize,
        node: Option<String>,
        asserted: Option<MpiLibrary>,
        redirect: Option<String>,
    ) -> Self {
        Self {
            executable: executable.into(),
            redirect,
            ncores,
            nnodes,
            node,
            asserted,
            detected: None,
        }
    }

    pub fn ncores(&self) -> usize {
        self.ncores
    }

    /// Swap the executable template, keeping MPI state. Used by the memcheck
    /// path, which runs a `--dryrun` variant without touching this launcher.
    pub fn with_executable(&self, executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            redirect: None,
            ncores: self.ncores,
            nnodes: self.nnodes,
            node: self.node.clone(),
            asserted: self.asserted,
            detected: self.detected,
        }
    }

    // ------------------------------------------------------------------------
    // Template parsing
    // ------------------------------------------------------------------------

    /// Split the executable template and substitute `$seed`. If no token
    /// contained `$seed`, the seed is appended as the final argument.
    /// Returns the argv and the substituted redirect filename.
    pub fn parse_executable(&self, seed: &str) -> (Vec<String>, Option<String>) {
        let mut argv = Vec::new();
        let mut found_seed = false;
        for token in self.executable.split_whitespace() {
            if token.contains("$seed") {
                argv.push(token.replace("$seed", seed));
                found_seed = true;
            } else {
                argv.push(token.to_string());
            }
        }
        if !found_seed {
            argv.push(seed.to_string());
        }

        let redirect = self
            .redirect
            .as_ref()
            .map(|template| template.replace("$seed", seed));

        (argv, redirect)
    }

    // ------------------------------------------------------------------------
    // MPI detection
    // ------------------------------------------------------------------------

    /// The MPI library to wrap with, detecting once on first use.
    pub async fn mpi_library(&mut self) -> Result<MpiLibrary, ComputeError> {
        if let Some(lib) = self.detected {
            return Ok(lib);
        }

        let resolved = match self.asserted {
            Some(MpiLibrary::None) => MpiLibrary::None,
            Some(MpiLibrary::Default) => MpiLibrary::Default,
            Some(asserted @ (MpiLibrary::Archer | MpiLibrary::Intel)) => {
                let guessed = Self::detect_mpi().await?;
                if guessed != asserted {
                    let msg = format!(
                        "detected {guessed} MPI but user asked for {asserted}; \
                         please check your environment"
                    );
                    log::error!("{msg}");
                    return Err(ComputeError::FatalExecutor(msg));
                }
                asserted
            }
            Some(MpiLibrary::Slurm) => {
                if let Ok(guessed) = Self::detect_mpi().await {
                    if guessed != MpiLibrary::Slurm {
                        log::warn!("detected {guessed} MPI but user asked for srun; continuing");
                    }
                }
                MpiLibrary::Slurm
            }
            None => Self::detect_mpi().await?,
        };

        log::info!("using {resolved} MPI library");
        self.detected = Some(resolved);
        Ok(resolved)
    }

    /// Probe `mpirun --version`, then `aprun --version`, and classify the
    /// response by substring.
    async fn detect_mpi() -> Result<MpiLibrary, ComputeError> {
        let probe = |cmd: &'static str| async move {
            let out = Command::new(cmd).arg("--version").output().await.ok()?;
            if out.status.success() {
                Some(String::from_utf8_lossy(&out.stdout).into_owned())
            } else {
                None
            }
        };

        let version = match probe("mpirun").await {
            Some(v) => v,
            None => {
                log::info!("failed to find mpirun, checking aprun...");
                probe("aprun").await.ok_or_else(|| {
                    ComputeError::FatalExecutor("failed to find mpirun or aprun".into())
                })?
            }
        };

        let library = if version.contains("Intel") {
            MpiLibrary::Intel
        } else if version.contains("aprun") {
            MpiLibrary::Archer
        } else if version.contains("Open MPI") {
            MpiLibrary::Default
        } else {
            log::debug!("unrecognised MPI version string, assuming OpenMPI: {version}");
            MpiLibrary::Default
        };
        Ok(library)
    }

    // ------------------------------------------------------------------------
    // Command assembly
    // ------------------------------------------------------------------------

    /// Prefix for the wrapping table. `cwd` is only used by the ssh branch.
    pub fn mpi_prefix(&self, library: MpiLibrary, cwd: &Path) -> Vec<String> {
        let n = self.ncores;
        let total = self.ncores * self.nnodes;
        let s = |v: &[&str]| v.iter().map(|t| t.to_string()).collect::<Vec<_>>();

        if self.nnodes <= 1 {
            if let Some(node) = &self.node {
                return s(&[
                    "ssh",
                    node,
                    "cd",
                    &format!("{};", cwd.display()),
                    "mpirun",
                    "-n",
                    &n.to_string(),
                ]);
            }
            if n == 1 {
                return s(&["nice", "-n", "15"]);
            }
            match library {
                MpiLibrary::Archer => s(&["aprun", "-n", &n.to_string()]),
                MpiLibrary::Slurm => s(&["srun", "--exclusive", "-N", "1", "-n", &n.to_string()]),
                MpiLibrary::Intel => s(&["mpirun", "-n", &n.to_string()]),
                MpiLibrary::Default => s(&["nice", "-n", "15", "mpirun", "-n", &n.to_string()]),
                MpiLibrary::None => Vec::new(),
            }
        } else {
            match library {
                MpiLibrary::Archer => s(&[
                    "aprun",
                    "-n",
                    &total.to_string(),
                    "-N",
                    &n.to_string(),
                    "-S",
                    "12",
                    "-d",
                    "1",
                ]),
                MpiLibrary::Slurm => s(&[
                    "srun",
                    "--exclusive",
                    "-N",
                    &self.nnodes.to_string(),
                    "-n",
                    &total.to_string(),
                ]),
                MpiLibrary::Intel => s(&["mpirun", "-n", &total.to_string(), "-ppn", &n.to_string()]),
                MpiLibrary::Default => s(&[
                    "mpirun",
                    "-n",
                    &total.to_string(),
                    "-npernode",
                    &n.to_string(),
                ]),
                MpiLibrary::None => Vec::new(),
            }
        }
    }

    /// Full argv plus redirect filename for one invocation.
    pub async fn build_command(
        &mut self,
        seed: &str,
        cwd: &Path,
    ) -> Result<(Vec<String>, Option<String>), ComputeError> {
        let (argv, redirect) = self.parse_executable(seed);

        // Single core on the local host needs no MPI library at all, so the
        // detection probe is skipped entirely; the prefix is just `nice`.
        let prefix = if self.nnodes <= 1 && self.ncores == 1 && self.node.is_none() {
            self.mpi_prefix(MpiLibrary::None, cwd)
        } else {
            let library = self.mpi_library().await?;
            self.mpi_prefix(library, cwd)
        };

        let mut command = prefix;
        command.extend(argv);
        Ok((command, redirect))
    }

    /// Start the child in `cwd`. Stdout goes to the redirect file when one is
    /// configured, otherwise it is captured; stderr is always captured.
    pub async fn launch(&mut self, seed: &str, cwd: &Path) -> Result<Child, ComputeError> {
        let (argv, redirect) = self.build_command(seed, cwd).await?;
        log::info!(target: seed, "running {argv:?}");

        let stdout = match &redirect {
            Some(filename) => {
                log::info!(target: seed, "redirecting output to {filename}");
                let file = std::fs::File::create(cwd.join(filename)).map_err(|e| {
                    ComputeError::StructureFailed(format!(
                        "could not open redirect file {filename}: {e}"
                    ))
                })?;
                Stdio::from(file)
            }
            None => Stdio::piped(),
        };

        Command::new(&argv[0])
            .args(&argv[1..])
            .current_dir(cwd)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                ComputeError::FatalExecutor(format!("failed to spawn {:?}: {e}", argv[0]))
            })
    }

    // ------------------------------------------------------------------------
    // Self-test
    // ------------------------------------------------------------------------

    /// Invoke the executable once with `--version` and check for the expected
    /// banner. An OpenMPI "not enough slots" complaint halves the core count
    /// and retries; anything else unexpected is fatal.
    pub async fn test_exec(&mut self, cwd: &Path) -> Result<(), ComputeError> {
        loop {
            log::info!("testing executable {}", self.executable);
            let (argv, _) = self.build_command("--version", cwd).await?;

            let output = Command::new(&argv[0])
                .args(&argv[1..])
                .current_dir(cwd)
                .output()
                .await
                .map_err(|e| {
                    ComputeError::FatalExecutor(format!(
                        "unable to call {:?} for self-test: {e}",
                        argv[0]
                    ))
                })?;

            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            if stdout.contains(VERSION_MAGIC) {
                if !stderr.is_empty() {
                    log::info!("executable passed self-test with stderr: {stderr}");
                }
                return Ok(());
            }

            if stderr.contains(SLOTS_ERROR) {
                if self.ncores < 2 {
                    return Err(ComputeError::FatalExecutor(
                        "MPI oversubscription persists even with a single core".into(),
                    ));
                }
                self.ncores /= 2;
                log::warn!(
                    "MPI tried to use too many cores; rescaling to {} and retrying",
                    self.ncores
                );
                continue;
            }

            log::error!("self-test stdout: {stdout}");
            log::error!("self-test stderr: {stderr}");
            return Err(ComputeError::FatalExecutor(format!(
                "executable `{}` failed testing: does it support --version?",
                self.executable
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn launcher(exe: &str, ncores: usize, nnodes: usize) -> Launcher {
        Launcher::new(exe, ncores, nnodes, None, None, None)
    }

    #[test]
    fn seed_is_appended_when_template_has_no_placeholder() {
        let (argv, _) = launcher("castep17", 1, 1).parse_executable("test");
        assert_eq!(argv, vec!["castep17", "test"]);
    }

    #[test]
    fn seed_is_substituted_and_not_appended() {
        let (argv, _) = launcher("pw6.x -i $seed.in", 1, 1).parse_executable("test");
        assert_eq!(argv, vec!["pw6.x", "-i", "test.in"]);
        assert_eq!(argv.iter().filter(|t| t.contains("test")).count(), 1);
    }

    #[test]
    fn multiple_placeholder_tokens_are_all_substituted() {
        let lc = Launcher::new(
            "prog -i $seed.in",
            1,
            1,
            None,
            None,
            Some("$seed.out".into()),
        );
        let (argv, redirect) = lc.parse_executable("NaCl");
        assert_eq!(argv, vec!["prog", "-i", "NaCl.in"]);
        assert_eq!(redirect.as_deref(), Some("NaCl.out"));
    }

    #[test]
    fn single_node_prefixes() {
        let cwd = PathBuf::from("/work");
        let lc = launcher("castep", 4, 1);
        assert_eq!(
            lc.mpi_prefix(MpiLibrary::Archer, &cwd),
            vec!["aprun", "-n", "4"]
        );
        assert_eq!(
            lc.mpi_prefix(MpiLibrary::Slurm, &cwd),
            vec!["srun", "--exclusive", "-N", "1", "-n", "4"]
        );
        assert_eq!(
            lc.mpi_prefix(MpiLibrary::Intel, &cwd),
            vec!["mpirun", "-n", "4"]
        );
        assert_eq!(
            lc.mpi_prefix(MpiLibrary::Default, &cwd),
            vec!["nice", "-n", "15", "mpirun", "-n", "4"]
        );
    }

    #[test]
    fn multi_node_prefixes() {
        let cwd = PathBuf::from("/work");
        let lc = launcher("castep", 8, 2);
        assert_eq!(
            lc.mpi_prefix(MpiLibrary::Archer, &cwd),
            vec!["aprun", "-n", "16", "-N", "8", "-S", "12", "-d", "1"]
        );
        assert_eq!(
            lc.mpi_prefix(MpiLibrary::Slurm, &cwd),
            vec!["srun", "--exclusive", "-N", "2", "-n", "16"]
        );
        assert_eq!(
            lc.mpi_prefix(MpiLibrary::Intel, &cwd),
            vec!["mpirun", "-n", "16", "-ppn", "8"]
        );
        assert_eq!(
            lc.mpi_prefix(MpiLibrary::Default, &cwd),
            vec!["mpirun", "-n", "16", "-npernode", "8"]
        );
    }

    #[test]
    fn remote_node_wraps_with_ssh() {
        let cwd = PathBuf::from("/scratch/run");
        let lc = Launcher::new("castep", 4, 1, Some("node12".into()), None, None);
        assert_eq!(
            lc.mpi_prefix(MpiLibrary::Default, &cwd),
            vec!["ssh", "node12", "cd", "/scratch/run;", "mpirun", "-n", "4"]
        );
    }

    #[test]
    fn single_core_runs_niced() {
        let cwd = PathBuf::from("/work");
        let lc = launcher("castep", 1, 1);
        assert_eq!(lc.mpi_prefix(MpiLibrary::Default, &cwd), vec!["nice", "-n", "15"]);
    }
}
