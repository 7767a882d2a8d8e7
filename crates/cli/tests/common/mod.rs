//! Shared harness for driving the real binary against a sleeping target
//! process, with a stub `gcore` placed on `PATH`.

use std::ffi::OsString;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

pub const BIN: &str = env!("CARGO_BIN_EXE_procdump-rs");

/// Write a gcore-compatible stub into `dir`: it creates `<prefix>.<pid>`
/// and reports the file it saved.
pub fn stub_gcore(dir: &Path) -> PathBuf {
    let path = dir.join("gcore");
    std::fs::write(
        &path,
        "#!/bin/sh\n\
         prefix=$2\n\
         pid=$3\n\
         echo \"dummy core\" > \"$prefix.$pid\"\n\
         echo \"Saved corefile $prefix.$pid\"\n",
    )
    .unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// `dir` first, then the inherited `PATH` (the stub still needs `sh`).
pub fn path_with(dir: &Path) -> OsString {
    let mut paths = vec![dir.to_path_buf()];
    if let Some(inherited) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&inherited));
    }
    std::env::join_paths(paths).unwrap()
}

pub fn spawn_sleep() -> Child {
    Command::new("sleep").arg("30").spawn().expect("spawn sleep")
}

pub fn reap(mut child: Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Run the monitored binary with piped output.
pub fn spawn_procdump(args: &[&str], path_var: &OsString, tmpdir: &Path) -> Child {
    Command::new(BIN)
        .args(args)
        .env("PATH", path_var)
        .env("TMPDIR", tmpdir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn procdump-rs")
}

pub fn wait_for_output(mut child: Child, timeout: Duration) -> io::Result<Output> {
    let start = Instant::now();
    loop {
        if child.try_wait()?.is_some() {
            break;
        }
        if start.elapsed() > timeout {
            let _ = child.kill();
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "procdump-rs did not exit",
            ));
        }
        sleep(Duration::from_millis(50));
    }
    child.wait_with_output()
}

pub fn combined(output: &Output) -> String {
    let mut text = String::from_utf8_lossy(&output.stdout).to_string();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    text
}

/// Names of regular files in a directory.
pub fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .flatten()
        .filter(|entry| entry.path().is_file())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
