//! Runs the compiled `moe-bench` under `moe-launch`, one OS process per rank.

use std::net::TcpListener;
use std::process::{Command, Output};

const SMALL_MODEL: &[&str] = &[
    "--batch_size",
    "4",
    "--num_tokens",
    "32",
    "--model_dim",
    "128",
    "--hidden_size",
    "128",
    "--num_local_experts",
    "4",
];

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn launch(nproc_per_node: usize, extra: &[&str]) -> Output {
    let config_home = tempfile::tempdir().unwrap();
    Command::new(env!("CARGO_BIN_EXE_moe-launch"))
        .args(["--nproc_per_node", &nproc_per_node.to_string()])
        .args(["--master_port", &free_port().to_string()])
        .arg("--")
        .arg(env!("CARGO_BIN_EXE_moe-bench"))
        .args(SMALL_MODEL)
        .args(extra)
        .env("XDG_CONFIG_HOME", config_home.path())
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

fn count_prefixed(stdout: &str, prefix: &str) -> usize {
    stdout.lines().filter(|l| l.starts_with(prefix)).count()
}

// ─── Lifecycle ───────────────────────────────────────────────────────────────

#[test]
fn every_rank_exits_cleanly_after_the_last_step() {
    // The final collective's replies race process exit on the hub rank, so
    // run the session a few times.
    for attempt in 0..3 {
        let output = launch(4, &["--group_count", "2", "--num_steps", "1"]);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            output.status.success(),
            "attempt {attempt}: {:?}\nstdout:\n{stdout}\nstderr:\n{stderr}",
            output.status
        );
        assert_eq!(count_prefixed(&stdout, "Device-"), 4);
        assert_eq!(count_prefixed(&stdout, "STEP-0: DONE"), 1);
        assert_eq!(count_prefixed(&stdout, "[Summary]"), 1);
    }
}

#[test]
fn bfloat16_session_succeeds() {
    let output = launch(2, &["--dtype", "bfloat16", "--num_steps", "2"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "stderr:\n{}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains("dtype = bfloat16"));
    assert_eq!(count_prefixed(&stdout, "STEP-"), 2);
}

// ─── Failures ────────────────────────────────────────────────────────────────

#[test]
fn unknown_dtype_fails_the_session() {
    let output = launch(2, &["--dtype", "float64", "--num_steps", "1"]);
    assert!(!output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(count_prefixed(&stdout, "Device-"), 2);
    assert_eq!(count_prefixed(&stdout, "STEP-"), 0);
}
