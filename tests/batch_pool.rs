// Batch-layer scenarios: the shared-folder claim protocol and the worker
// pool sweeping a directory of structures.

mod common;

use common::*;
use relaxrun::batch::BatchRun;
use relaxrun::codec::CastepCodec;
use relaxrun::config::RunMode;
use relaxrun::logs::SeedSinks;
use relaxrun::workspace::Workspace;
use std::path::Path;
use std::sync::Arc;

const ALWAYS_OPTIMISED_SCRIPT: &str = r#"
seed="$1"
cat > "$seed.castep" <<EOF
BFGS: finished iteration 1 with enthalpy= -50.00000000 eV
BFGS: Geometry optimization completed successfully.
EOF
"#;

fn write_templates(root: &Path) {
    std::fs::write(
        root.join("template.cell"),
        "kpoints_mp_spacing 0.05\nsymmetry_generate\n",
    )
    .unwrap();
    std::fs::write(
        root.join("template.param"),
        "task : geometryoptimisation\ngeom_max_iter : 40\ncut_off_energy : 400\n",
    )
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn pool_sweeps_every_structure_to_completed() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let exe = write_mock_executable(root, ALWAYS_OPTIMISED_SCRIPT);
    write_templates(root);
    write_structure(root, "alpha");
    write_structure(root, "beta");

    let runner = BatchRun::new(
        root,
        "template",
        2,
        quick_config(exe),
        Arc::new(CastepCodec),
        SeedSinks::new(),
    )
    .unwrap();
    let completed = runner.spawn().await.unwrap();

    assert_eq!(completed, 2);
    for seed in ["alpha", "beta"] {
        assert!(root.join(format!("completed/{seed}.res")).exists());
        assert!(!root.join(format!("{seed}.res")).exists());
        assert!(!root.join(format!("{seed}.res.lock")).exists());
        assert!(root.join(format!("logs/{seed}.log")).exists());
    }

    let jobs = std::fs::read_to_string(root.join("jobs.txt")).unwrap();
    assert!(jobs.contains("alpha"));
    assert!(jobs.contains("beta"));
    let finished = std::fs::read_to_string(root.join("finished_cleanly.txt")).unwrap();
    assert!(finished.contains("alpha"));
    assert!(finished.contains("beta"));
}

#[tokio::test(flavor = "multi_thread")]
async fn locked_seed_is_left_for_its_owner() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let exe = write_mock_executable(root, ALWAYS_OPTIMISED_SCRIPT);
    write_templates(root);
    write_structure(root, "alpha");
    write_structure(root, "beta");

    // someone else owns alpha
    let other = Workspace::new(root, None);
    assert!(other.claim("alpha").unwrap());
    let alpha_res = std::fs::read(root.join("alpha.res")).unwrap();

    let runner = BatchRun::new(
        root,
        "template",
        1,
        quick_config(exe),
        Arc::new(CastepCodec),
        SeedSinks::new(),
    )
    .unwrap();
    let completed = runner.spawn().await.unwrap();

    assert_eq!(completed, 1);
    // alpha untouched by the loser: same bytes, still locked, not moved
    assert_eq!(std::fs::read(root.join("alpha.res")).unwrap(), alpha_res);
    assert!(root.join("alpha.res.lock").exists());
    assert!(!root.join("completed/alpha.res").exists());
    assert!(root.join("completed/beta.res").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn bad_structure_does_not_stop_the_batch() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    // never optimises: schedule runs dry and the structure fails
    let exe = write_mock_executable(
        root,
        r#"
seed="$1"
echo "BFGS: finished iteration 1 with enthalpy= -1.0 eV" > "$seed.castep"
"#,
    );
    write_templates(root);
    write_structure(root, "alpha");
    write_structure(root, "beta");

    let runner = BatchRun::new(
        root,
        "template",
        1,
        quick_config(exe),
        Arc::new(CastepCodec),
        SeedSinks::new(),
    )
    .unwrap();
    let completed = runner.spawn().await.unwrap();

    // both failed locally, none completed, but the sweep finished cleanly
    assert_eq!(completed, 0);
    assert!(root.join("bad_castep/alpha.res").exists());
    assert!(root.join("bad_castep/beta.res").exists());
    assert!(!root.join("alpha.res.lock").exists());
    assert!(!root.join("beta.res.lock").exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn generic_mode_moves_inputs_to_completed() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let exe = write_mock_executable(root, "exit 0\n");
    write_structure(root, "alpha");

    let mut config = quick_config(exe);
    config.mode = RunMode::Generic;

    let runner = BatchRun::new(
        root,
        "template",
        1,
        config,
        Arc::new(CastepCodec),
        SeedSinks::new(),
    )
    .unwrap();
    let completed = runner.spawn().await.unwrap();

    assert_eq!(completed, 1);
    assert!(root.join("completed/alpha.res").exists());
    assert!(root.join("input/alpha.res").exists());
    assert!(!root.join("alpha.res.lock").exists());
}
