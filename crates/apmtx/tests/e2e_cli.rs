use std::fs;
use std::process::{Command, Output};

use serde_json::Value;

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_apmtx")
}

fn run(args: &[&str], envs: &[(&str, &str)]) -> Output {
    let mut cmd = Command::new(bin());
    cmd.args(args).env_remove("RUST_LOG");
    for var in [
        "APMTX_CONFIG",
        "APMTX_APP_NAME",
        "APMTX_FORCE_SYNC_TIMING_HTTP_CLIENT",
        "APMTX_DISTRIBUTED_TRACING",
        "APMTX_CROSS_APPLICATION_TRACING",
        "APMTX_TRUSTED_ACCOUNT_KEY",
        "APMTX_ATTRIBUTE_VALUE_MAX_BYTES",
        "APMTX_ERROR_STACK_TRACE_MAX_FRAMES",
    ] {
        cmd.env_remove(var);
    }
    cmd.envs(envs.iter().copied());
    cmd.output().unwrap()
}

fn stdout_json(output: &Output) -> Value {
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn config_layers_file_then_env() {
    let temp = tempfile::tempdir().unwrap();
    let path = temp.path().join("config.toml");
    fs::write(
        &path,
        "app_name = \"checkout\"\nforce_synchronous_timing_http_client = true\nattribute_value_max_bytes = 64\n",
    )
    .unwrap();
    let path = path.to_string_lossy().to_string();

    let cfg = stdout_json(&run(
        &["config", "--json"],
        &[
            ("APMTX_CONFIG", path.as_str()),
            ("APMTX_ATTRIBUTE_VALUE_MAX_BYTES", "128"),
        ],
    ));
    assert_eq!(cfg["app_name"], "checkout");
    assert_eq!(cfg["force_synchronous_timing_http_client"], true);
    assert_eq!(cfg["attribute_value_max_bytes"], 128);
    assert_eq!(cfg["distributed_tracing_enabled"], true);
}

#[test]
fn invalid_env_value_fails() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("absent.toml");
    let output = run(
        &["config"],
        &[
            ("APMTX_CONFIG", missing.to_str().unwrap()),
            ("APMTX_DISTRIBUTED_TRACING", "maybe"),
        ],
    );
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("APMTX_DISTRIBUTED_TRACING"));
}

#[test]
fn simulate_emits_finished_transaction_and_error_trace() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("absent.toml");
    let report = stdout_json(&run(
        &["simulate", "--completions", "5", "--delay-ms", "2", "--json"],
        &[("APMTX_CONFIG", missing.to_str().unwrap())],
    ));

    let tx = &report["transaction"];
    assert_eq!(tx["name"], "WebTransaction/simulate");
    assert_eq!(tx["attached_to_async"], true);
    let segments = tx["segments"].as_array().unwrap();
    assert_eq!(segments.len(), 6);
    assert!(segments.iter().all(|s| !s["end"].is_null()));

    let traces = report["error_traces"].as_array().unwrap();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0][3], "SimulatedError");
    assert_eq!(traces[0][5], tx["guid"]);
    assert_eq!(traces[0][4]["userAttributes"]["completion.4"], 4);
    assert_eq!(report["suppressed_exceptions"], 0);
}

#[test]
fn simulate_human_output_lists_segments() {
    let temp = tempfile::tempdir().unwrap();
    let missing = temp.path().join("absent.toml");
    let output = run(
        &["simulate", "--completions", "2", "--delay-ms", "1"],
        &[("APMTX_CONFIG", missing.to_str().unwrap())],
    );
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("TRANSACTION WebTransaction/simulate"));
    assert!(stdout.contains("Datastore/statement/MongoDB/users/FindAll"));
    assert!(stdout.contains("External/svc1.example.com/GET"));
    assert!(stdout.contains("-- 1 error traces"));
}
