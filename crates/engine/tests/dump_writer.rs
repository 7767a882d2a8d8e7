//! Dump-writer integration tests driven by a stub helper on disk and a
//! real (sleeping) target process.

use engine::dump::{CoreDumpWriter, DumpKind};
use engine::proc::TargetProcess;
use engine::target::TargetState;
use engine::triggers::NoopManagedDumper;
use config::{Config, TargetSelector};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn write_stub(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("gcore");
    std::fs::write(&path, body).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A helper that behaves like gcore on success: writes `<prefix>.<pid>` and
/// reports the file it saved.
fn success_stub(dir: &Path) -> PathBuf {
    write_stub(
        dir,
        "#!/bin/sh\n\
         prefix=$2\n\
         pid=$3\n\
         echo \"dummy core\" > \"$prefix.$pid\"\n\
         echo \"Saved corefile $prefix.$pid\"\n",
    )
}

fn spawn_target() -> Child {
    Command::new("sleep").arg("30").spawn().expect("spawn sleep")
}

fn state_for(
    child: &Child,
    out_dir: &Path,
    helper: PathBuf,
    tweak: impl FnOnce(&mut Config),
) -> Arc<TargetState> {
    let pid = child.id() as i32;
    let mut config = Config::new(TargetSelector::Pid(pid));
    config.dump_path = out_dir.to_path_buf();
    config.helper = helper;
    config.helper_settle = Duration::ZERO;
    tweak(&mut config);
    config.validate().unwrap();
    config.apply_defaults();
    TargetState::new(config, pid, "sleep".into(), None)
}

fn reap(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn successful_dump_produces_the_named_file() {
    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let helper = success_stub(scratch.path());

    let child = spawn_target();
    let pid = child.id() as i32;
    let target = state_for(&child, out.path(), helper, |_| {});

    let written = CoreDumpWriter::new(Arc::clone(&target), DumpKind::Cpu)
        .write(&NoopManagedDumper)
        .unwrap()
        .expect("a dump should have been produced");

    assert!(written.exists());
    let name = written.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("sleep_cpu_"), "unexpected name {name}");
    assert!(name.ends_with(&format!(".{pid}")));
    assert_eq!(target.dumps_collected(), 1);
    // Cap of one dump reached: the target's quit event fires.
    assert!(target.quit.is_set());
    // Slot released, helper pid cleared.
    assert_eq!(target.helper_pid(), engine::NO_PID);

    reap(child);
}

#[test]
fn failure_marker_in_last_line_abandons_the_attempt() {
    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    // Exit status 0 but the helper says it failed.
    let helper = write_stub(
        scratch.path(),
        "#!/bin/sh\necho \"gcore: failed to create core.1234\"\n",
    );

    let child = spawn_target();
    let target = state_for(&child, out.path(), helper, |config| {
        config.dumps = Some(3);
    });

    let written = CoreDumpWriter::new(Arc::clone(&target), DumpKind::Commit)
        .write(&NoopManagedDumper)
        .unwrap();
    assert!(written.is_none());
    assert_eq!(target.dumps_collected(), 0);
    assert!(!target.quit.is_set());
    assert!(std::fs::read_dir(out.path()).unwrap().next().is_none());

    reap(child);
}

#[test]
fn nonzero_helper_exit_abandons_the_attempt() {
    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let helper = write_stub(scratch.path(), "#!/bin/sh\nexit 3\n");

    let child = spawn_target();
    let target = state_for(&child, out.path(), helper, |config| {
        config.dumps = Some(2);
    });

    let written = CoreDumpWriter::new(Arc::clone(&target), DumpKind::Thread)
        .write(&NoopManagedDumper)
        .unwrap();
    assert!(written.is_none());
    assert_eq!(target.dumps_collected(), 0);

    reap(child);
}

#[test]
fn missing_helper_is_contained() {
    let out = TempDir::new().unwrap();
    let child = spawn_target();
    let target = state_for(
        &child,
        out.path(),
        PathBuf::from("/nonexistent/bin/gcore"),
        |_| {},
    );

    let written = CoreDumpWriter::new(Arc::clone(&target), DumpKind::Time)
        .write(&NoopManagedDumper)
        .unwrap();
    assert!(written.is_none());
    assert_eq!(target.dumps_collected(), 0);
    // The slot must be free for the next attempt.
    assert_eq!(
        target.acquire_dump_slot(),
        engine::WaitOutcome::Signaled
    );
    target.release_dump_slot();

    reap(child);
}

#[test]
fn existing_file_is_only_replaced_with_overwrite() {
    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let helper = success_stub(scratch.path());

    let child = spawn_target();
    let pid = child.id() as i32;

    // A custom base name makes the output path deterministic.
    let existing = out.path().join(format!("crash.{pid}"));
    std::fs::write(&existing, "older dump").unwrap();

    let target = state_for(&child, out.path(), helper.clone(), |config| {
        config.dump_name = Some("crash".into());
        config.dumps = Some(2);
    });
    let written = CoreDumpWriter::new(Arc::clone(&target), DumpKind::Manual)
        .write(&NoopManagedDumper)
        .unwrap();
    assert!(written.is_none());
    assert_eq!(std::fs::read_to_string(&existing).unwrap(), "older dump");

    let target = state_for(&child, out.path(), helper, |config| {
        config.dump_name = Some("crash".into());
        config.overwrite = true;
        config.dumps = Some(2);
    });
    let written = CoreDumpWriter::new(Arc::clone(&target), DumpKind::Manual)
        .write(&NoopManagedDumper)
        .unwrap();
    assert_eq!(written, Some(existing.clone()));
    assert_eq!(std::fs::read_to_string(&existing).unwrap(), "dummy core\n");

    reap(child);
}

#[test]
fn coredump_filter_is_restored_on_every_path() {
    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();

    let child = spawn_target();
    let process = TargetProcess::new(child.id() as i32);
    let original = process.coredump_filter().unwrap();
    let mask = if original == 0x7 { 0x33 } else { 0x7 };

    // Success path.
    let helper = success_stub(scratch.path());
    let target = state_for(&child, out.path(), helper, |config| {
        config.core_dump_mask = Some(mask);
        config.dumps = Some(5);
    });
    CoreDumpWriter::new(Arc::clone(&target), DumpKind::Cpu)
        .write(&NoopManagedDumper)
        .unwrap()
        .expect("dump");
    assert_eq!(process.coredump_filter().unwrap(), original);

    // Failure path.
    let failing = write_stub(scratch.path(), "#!/bin/sh\nexit 1\n");
    let target = state_for(&child, out.path(), failing, |config| {
        config.core_dump_mask = Some(mask);
        config.dumps = Some(5);
    });
    let written = CoreDumpWriter::new(Arc::clone(&target), DumpKind::Cpu)
        .write(&NoopManagedDumper)
        .unwrap();
    assert!(written.is_none());
    assert_eq!(process.coredump_filter().unwrap(), original);

    reap(child);
}

#[test]
fn quit_during_dump_leaves_no_partial_file() {
    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    // Slow helper: the file is on disk long before it exits.
    let helper = write_stub(
        scratch.path(),
        "#!/bin/sh\n\
         prefix=$2\n\
         pid=$3\n\
         echo \"partial\" > \"$prefix.$pid\"\n\
         sleep 2\n",
    );

    let child = spawn_target();
    let target = state_for(&child, out.path(), helper, |config| {
        config.dumps = Some(2);
    });

    let quitter = Arc::clone(&target);
    let interrupter = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        quitter.quit.set();
    });

    let written = CoreDumpWriter::new(Arc::clone(&target), DumpKind::Cpu)
        .write(&NoopManagedDumper)
        .unwrap();
    interrupter.join().unwrap();

    assert!(written.is_none());
    assert_eq!(target.dumps_collected(), 0);
    assert!(
        std::fs::read_dir(out.path()).unwrap().next().is_none(),
        "partial core dump left behind"
    );

    reap(child);
}

#[test]
fn dump_slot_serialises_helper_invocations() {
    let scratch = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let log = scratch.path().join("invocations.log");
    let helper = write_stub(
        scratch.path(),
        &format!(
            "#!/bin/sh\n\
             prefix=$2\n\
             pid=$3\n\
             echo \"start\" >> {log}\n\
             sleep 0.3\n\
             echo \"end\" >> {log}\n\
             echo \"core\" > \"$prefix.$pid\"\n\
             echo \"Saved corefile $prefix.$pid\"\n",
            log = log.display()
        ),
    );

    let child = spawn_target();
    let target = state_for(&child, out.path(), helper, |config| {
        config.dumps = Some(2);
        // Distinct file per dump.
        config.overwrite = true;
    });

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let target = Arc::clone(&target);
            std::thread::spawn(move || {
                CoreDumpWriter::new(target, DumpKind::Cpu)
                    .write(&NoopManagedDumper)
                    .unwrap()
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    assert_eq!(target.dumps_collected(), 2);
    // With one dump slot, helper runs never overlap.
    let entries: Vec<String> = std::fs::read_to_string(&log)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(entries, vec!["start", "end", "start", "end"]);

    reap(child);
}
