// End-to-end scenarios for the relaxation driver, using a scripted mock
// executable in a temporary workspace.

mod common;

use common::*;
use relaxrun::core::{CellOptions, ParamOptions};
use relaxrun::driver::RunOutcome;
use relaxrun::errors::ComputeError;
use std::time::{Duration, Instant};

/// Emits an unconverged log on the first invocation and a converged one on
/// the second, counting invocations in the workspace.
const TWO_STEP_SCRIPT: &str = r#"
seed="$1"
n=$(cat invocations.txt 2>/dev/null || echo 0)
n=$((n+1))
echo $n > invocations.txt
if [ $n -ge 2 ]; then
cat > "$seed.castep" <<EOF
BFGS: finished iteration 4 with enthalpy= -210.40000000 eV
 *  Pressure:   0.0100  *
BFGS: Geometry optimization completed successfully.
EOF
else
cat > "$seed.castep" <<EOF
BFGS: finished iteration 2 with enthalpy= -209.90000000 eV
 *  Pressure:   0.0200  *
EOF
fi
"#;

#[tokio::test]
async fn happy_relax_completes_after_two_invocations() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let exe = write_mock_executable(root, TWO_STEP_SCRIPT);
    write_structure(root, "NaCl");

    let mut driver = claimed_driver(
        root,
        "NaCl",
        quick_config(exe),
        CellOptions::default(),
        ParamOptions::default(),
    );
    let outcome = driver.run().await.unwrap();

    assert!(outcome.succeeded(), "expected success, got {outcome:?}");
    assert_eq!(invocation_count(root), 2);
    assert!(root.join("completed/NaCl.res").exists());
    assert!(root.join("completed/NaCl.castep").exists());
    assert!(!root.join("NaCl.res").exists());
    assert!(!root.join("NaCl.res.lock").exists());
    assert!(root.join("input/NaCl.res").exists());

    if let RunOutcome::Optimised(doc) = outcome {
        assert!(doc.optimised);
        assert_eq!(doc.geom_iter, 4);
        assert!((doc.enthalpy_per_atom.unwrap() + 105.2).abs() < 1e-6);
    }
}

#[tokio::test]
async fn walltime_kill_leaves_the_seed_resumable() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    // busy simulator: keeps the log fresh and never finishes on its own
    let exe = write_mock_executable(
        root,
        r#"
seed="$1"
echo "starting" > "$seed.castep"
i=0
while [ $i -lt 400 ]; do
  touch "$seed.castep"
  sleep 0.05
  i=$((i+1))
done
"#,
    );
    write_structure(root, "NaCl");

    let mut config = quick_config(exe);
    config.max_walltime = Some(Duration::from_secs(1));
    config.start_time = Some(Instant::now());
    config.validate().unwrap();

    let started = Instant::now();
    let mut driver = claimed_driver(
        root,
        "NaCl",
        config,
        CellOptions::default(),
        ParamOptions::default(),
    );
    let err = driver.run().await.unwrap_err();

    assert!(matches!(err, ComputeError::Walltime(_)));
    // killed at the safety margin, well before the script would end
    assert!(started.elapsed() < Duration::from_secs(5));
    // resumable: structure still in the root, claim released
    assert!(root.join("NaCl.res").exists());
    assert!(!root.join("NaCl.res.lock").exists());
    assert!(!root.join("bad_castep").exists());
}

#[tokio::test]
async fn symmetry_remedy_is_capped_then_fails_to_bad() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let exe = write_mock_executable(
        root,
        r#"
seed="$1"
n=$(cat invocations.txt 2>/dev/null || echo 0)
echo $((n+1)) > invocations.txt
echo "BFGS: finished iteration 1 with enthalpy= -100.0 eV" > "$seed.castep"
echo "ERROR in cell constraints: attempt to fix" > "$seed.0001.err"
exit 1
"#,
    );
    write_structure(root, "NaCl");

    let cell = CellOptions {
        symmetry_generate: true,
        symmetry_tol: Some(0.01),
        snap_to_symmetry: true,
        ..Default::default()
    };
    let mut driver = claimed_driver(
        root,
        "NaCl",
        quick_config(exe),
        cell,
        ParamOptions::default(),
    );
    let outcome = driver.run().await.unwrap();

    assert!(matches!(outcome, RunOutcome::StructureFailed(_)));
    // initial attempt plus exactly two remedied retries
    assert_eq!(invocation_count(root), 3);
    assert!(root.join("bad_castep/NaCl.res").exists());
    assert!(!root.join("NaCl.res").exists());
    assert!(!root.join("NaCl.res.lock").exists());

    // the remedy stripped the symmetry keywords before the final attempt
    let cell_written =
        std::fs::read_to_string(root.join("bad_castep/NaCl.cell")).unwrap();
    assert!(!cell_written.contains("symmetry_generate"));
    assert!(!cell_written.contains("symmetry_tol"));
    assert!(!cell_written.contains("snap_to_symmetry"));
}

#[tokio::test]
async fn memcheck_abort_never_launches_a_full_child() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let exe = write_mock_executable(
        root,
        r#"
if [ "$1" = "--dryrun" ]; then
  seed="$2"
  echo "Approx. total storage required per process 2000.0 MB" > "$seed.castep"
  exit 0
fi
seed="$1"
echo "full run happened" > full_run_marker.txt
echo "BFGS: Geometry optimization completed successfully." > "$seed.castep"
"#,
    );
    write_structure(root, "NaCl");

    let mut config = quick_config(exe);
    config.memcheck = true;
    config.maxmem_mb = Some(1000.0);

    let mut driver = claimed_driver(
        root,
        "NaCl",
        config,
        CellOptions::default(),
        ParamOptions::default(),
    );
    let outcome = driver.run().await.unwrap();

    assert!(matches!(outcome, RunOutcome::MemoryExceeded(_)));
    // the full child never ran and nothing moved anywhere
    assert!(!root.join("full_run_marker.txt").exists());
    assert!(root.join("NaCl.res").exists());
    assert!(!root.join("completed").exists());
    assert!(!root.join("bad_castep").exists());
    assert!(!root.join("NaCl.res.lock").exists());
    // memcheck scratch files were removed
    assert!(!root.join("NaCl_memcheck.castep").exists());
    assert!(!root.join("NaCl_memcheck.cell").exists());
}

#[tokio::test]
async fn conv_cutoff_sweep_tolerates_one_failure() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let exe = write_mock_executable(
        root,
        r#"
seed="$1"
case "$seed" in
  *400*) echo "SCF cycles exceeded" > "$seed.0001.err"; exit 1;;
  *) printf 'Final Enthalpy = -200.0 eV\n' > "$seed.castep";;
esac
"#,
    );
    write_structure(root, "NaCl");

    let mut config = quick_config(exe);
    config.conv_cutoff = vec![400.0, 500.0, 600.0];

    let mut driver = claimed_driver(
        root,
        "NaCl",
        config,
        CellOptions::default(),
        ParamOptions::default(),
    );
    let outcome = driver.run().await.unwrap();

    // any-success semantics
    assert!(outcome.succeeded(), "expected truthy sweep, got {outcome:?}");
    assert!(root.join("completed_cutoff/NaCl_500eV.castep").exists());
    assert!(root.join("completed_cutoff/NaCl_600eV.castep").exists());
    assert!(!root.join("completed_cutoff/NaCl_400eV.castep").exists());
    assert!(root.join("bad_castep/NaCl_400eV.0001.err").exists());
}

#[tokio::test]
async fn reopt_requires_a_second_optimised_step() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    // optimised from the very first invocation
    let exe = write_mock_executable(
        root,
        r#"
seed="$1"
n=$(cat invocations.txt 2>/dev/null || echo 0)
echo $((n+1)) > invocations.txt
cat > "$seed.castep" <<EOF
BFGS: finished iteration 3 with enthalpy= -210.00000000 eV
BFGS: Geometry optimization completed successfully.
EOF
"#,
    );
    write_structure(root, "NaCl");

    let mut config = quick_config(exe);
    config.reopt = true;

    let mut driver = claimed_driver(
        root,
        "NaCl",
        config,
        CellOptions::default(),
        ParamOptions::default(),
    );
    let outcome = driver.run().await.unwrap();

    assert!(outcome.succeeded());
    // one optimised step arms the rerun, the second confirms it
    assert_eq!(invocation_count(root), 2);
    assert!(root.join("completed/NaCl.res").exists());
}
