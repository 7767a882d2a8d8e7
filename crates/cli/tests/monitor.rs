//! End-to-end runs of the real binary: timer dumps, missing-helper
//! validation, and orderly SIGINT shutdown.

mod common;

use common::*;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::time::Duration;
use tempfile::tempdir;

#[test]
fn timer_collects_the_requested_dump_and_exits() {
    let bin_dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let tmp_dir = tempdir().unwrap();
    stub_gcore(bin_dir.path());
    let path_var = path_with(bin_dir.path());

    let target = spawn_sleep();
    let pid = target.id().to_string();
    let out_arg = out_dir.path().to_str().unwrap();

    let child = spawn_procdump(
        &[
            "-n", "1", "-s", "1", "--helper-settle-ms", "0", &pid, out_arg,
        ],
        &path_var,
        tmp_dir.path(),
    );
    let output = wait_for_output(child, Duration::from_secs(20)).unwrap();

    let text = combined(&output);
    assert!(output.status.success(), "unexpected failure:\n{text}");
    assert!(text.contains("Core dump 0 generated"), "missing log:\n{text}");

    let files = files_in(out_dir.path());
    assert_eq!(files.len(), 1, "expected exactly one dump, got {files:?}");
    let name = &files[0];
    assert!(name.starts_with("sleep_time_"), "unexpected name {name}");
    assert!(name.ends_with(&format!(".{pid}")), "unexpected name {name}");

    reap(target);
}

#[test]
fn cpu_trigger_dumps_a_busy_target() {
    let bin_dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let tmp_dir = tempdir().unwrap();
    stub_gcore(bin_dir.path());
    let path_var = path_with(bin_dir.path());

    // A target that pins a core.
    let target = std::process::Command::new("sh")
        .arg("-c")
        .arg("while true; do :; done")
        .spawn()
        .expect("spawn busy loop");
    let pid = target.id().to_string();

    let child = spawn_procdump(
        &[
            "-c",
            "50",
            "-n",
            "1",
            "-s",
            "1",
            "--polling-interval",
            "200",
            "--helper-settle-ms",
            "0",
            &pid,
            out_dir.path().to_str().unwrap(),
        ],
        &path_var,
        tmp_dir.path(),
    );
    let output = wait_for_output(child, Duration::from_secs(30)).unwrap();

    let text = combined(&output);
    assert!(output.status.success(), "unexpected failure:\n{text}");

    let files = files_in(out_dir.path());
    assert_eq!(files.len(), 1, "expected exactly one dump, got {files:?}");
    let name = &files[0];
    assert!(name.starts_with("sh_cpu_"), "unexpected name {name}");
    assert!(name.ends_with(&format!(".{pid}")), "unexpected name {name}");

    reap(target);
}

#[test]
fn multi_threshold_commit_collects_one_dump_per_threshold() {
    let bin_dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let tmp_dir = tempdir().unwrap();
    stub_gcore(bin_dir.path());
    let path_var = path_with(bin_dir.path());

    let target = spawn_sleep();
    let pid = target.id().to_string();

    // Three thresholds every process satisfies: the dump count is fixed to
    // three, one commit dump per threshold in order.
    let child = spawn_procdump(
        &[
            "-m",
            "0,0,0",
            "-s",
            "1",
            "--polling-interval",
            "200",
            "--helper-settle-ms",
            "0",
            &pid,
            out_dir.path().to_str().unwrap(),
        ],
        &path_var,
        tmp_dir.path(),
    );
    let output = wait_for_output(child, Duration::from_secs(30)).unwrap();

    let text = combined(&output);
    assert!(output.status.success(), "unexpected failure:\n{text}");
    assert!(text.contains("Core dump 2 generated"), "missing log:\n{text}");

    let files = files_in(out_dir.path());
    assert_eq!(files.len(), 3, "expected three dumps, got {files:?}");
    for name in &files {
        assert!(name.contains("_commit_"), "unexpected name {name}");
        assert!(name.ends_with(&format!(".{pid}")), "unexpected name {name}");
    }

    reap(target);
}

#[test]
fn missing_helper_fails_before_monitoring_starts() {
    let empty_bin = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let tmp_dir = tempdir().unwrap();
    // No gcore anywhere on PATH.
    let path_var = empty_bin.path().as_os_str().to_os_string();

    let target = spawn_sleep();
    let pid = target.id().to_string();

    let child = spawn_procdump(
        &["-n", "1", "-s", "1", &pid, out_dir.path().to_str().unwrap()],
        &path_var,
        tmp_dir.path(),
    );
    let output = wait_for_output(child, Duration::from_secs(10)).unwrap();

    assert!(!output.status.success());
    let text = combined(&output);
    assert!(text.contains("gcore"), "unhelpful diagnostics:\n{text}");
    assert!(files_in(out_dir.path()).is_empty());

    reap(target);
}

#[test]
fn sigint_shuts_down_cleanly_and_repeats_are_noops() {
    let bin_dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let tmp_dir = tempdir().unwrap();
    stub_gcore(bin_dir.path());
    let path_var = path_with(bin_dir.path());

    let target = spawn_sleep();
    let pid = target.id().to_string();

    // Long threshold: nothing fires before the interrupt.
    let child = spawn_procdump(
        &[
            "-n",
            "5",
            "-s",
            "600",
            "--polling-interval",
            "100",
            &pid,
            out_dir.path().to_str().unwrap(),
        ],
        &path_var,
        tmp_dir.path(),
    );
    let procdump_pid = Pid::from_raw(child.id() as i32);

    std::thread::sleep(Duration::from_millis(800));
    kill(procdump_pid, Signal::SIGINT).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    // Idempotent after quit.
    let _ = kill(procdump_pid, Signal::SIGINT);

    let output = wait_for_output(child, Duration::from_secs(10)).unwrap();
    let text = combined(&output);
    assert!(output.status.success(), "unexpected failure:\n{text}");
    assert!(files_in(out_dir.path()).is_empty(), "no dump was requested");

    reap(target);
}

#[test]
fn unknown_pid_is_reported_and_exits_nonzero() {
    let bin_dir = tempdir().unwrap();
    let out_dir = tempdir().unwrap();
    let tmp_dir = tempdir().unwrap();
    stub_gcore(bin_dir.path());
    let path_var = path_with(bin_dir.path());

    let child = spawn_procdump(
        &["-n", "1", "2147483646", out_dir.path().to_str().unwrap()],
        &path_var,
        tmp_dir.path(),
    );
    let output = wait_for_output(child, Duration::from_secs(10)).unwrap();
    assert!(!output.status.success());
    assert!(combined(&output).contains("no process found"));
}
