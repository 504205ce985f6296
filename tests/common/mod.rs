// Shared harness for the end-to-end tests: a temp workspace, a scripted
// stand-in for the simulator binary, and config/doc builders.
#![allow(dead_code)]

use relaxrun::codec::{CastepCodec, Codec};
use relaxrun::config::ComputeConfig;
use relaxrun::core::{CellOptions, ParamOptions, StructDoc};
use relaxrun::driver::RelaxationDriver;
use relaxrun::workspace::Workspace;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

/// Write an executable shell script into the workspace and return its path.
pub fn write_mock_executable(dir: &Path, body: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("mock_castep.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path.to_string_lossy().into_owned()
}

/// A small rock-salt structure written to `<root>/<seed>.res`.
pub fn write_structure(root: &Path, seed: &str) -> StructDoc {
    let doc = StructDoc::new(
        format!("{seed}.res"),
        vec!["Na".into(), "Cl".into()],
        vec![[0.0, 0.0, 0.0], [0.5, 0.5, 0.5]],
        [[5.64, 0.0, 0.0], [0.0, 5.64, 0.0], [0.0, 0.0, 5.64]],
    );
    CastepCodec
        .write_structure(&doc, &root.join(format!("{seed}.res")))
        .unwrap();
    doc
}

/// Fast-polling config pointed at a mock executable; no self-test.
pub fn quick_config(executable: String) -> ComputeConfig {
    ComputeConfig {
        executable,
        polltime: Duration::from_millis(50),
        exec_test: false,
        ..Default::default()
    }
}

/// Driver wired to the given root with a fresh claim on the seed.
pub fn claimed_driver(
    root: &Path,
    seed: &str,
    config: ComputeConfig,
    cell: CellOptions,
    param: ParamOptions,
) -> RelaxationDriver {
    let workspace = Workspace::new(root, config.compute_dir.clone());
    assert!(workspace.claim(seed).unwrap(), "seed already claimed");
    RelaxationDriver::new(
        seed,
        config,
        cell,
        param,
        Arc::new(CastepCodec),
        workspace,
        Arc::new(AtomicBool::new(false)),
        None,
    )
}

pub fn invocation_count(root: &Path) -> u32 {
    std::fs::read_to_string(root.join("invocations.txt"))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}
