//! End-to-end tests that start real containers.
//!
//! They need root, cgroup v2 and `/bin/sh` on the host; run with
//! `cargo test --features integration -- --ignored`.
#![cfg(feature = "integration")]

use assert_cmd::Command;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

struct Fixture {
    _temp_dir: TempDir,
    root: PathBuf,
    bundle: PathBuf,
}

/// A bundle that runs `script` under `/bin/sh` in a new PID namespace,
/// chrooted to the host root.
fn fixture(script: &str) -> Fixture {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("corral-root");
    let bundle = temp_dir.path().join("bundle");
    std::fs::create_dir_all(&bundle).unwrap();

    let spec = serde_json::json!({
        "ociVersion": "1.2.0",
        "root": { "path": "/" },
        "process": {
            "args": ["/bin/sh", "-c", script],
            "env": ["PATH=/usr/bin:/bin"],
            "cwd": "/"
        },
        "linux": { "namespaces": [{ "type": "pid" }] }
    });
    std::fs::write(bundle.join("config.json"), spec.to_string()).unwrap();

    Fixture {
        _temp_dir: temp_dir,
        root,
        bundle,
    }
}

/// Run without any new namespace, so the process is not a PID 1 that
/// ignores default-action signals.
fn without_namespaces(fixture: &Fixture) {
    let spec_path = fixture.bundle.join("config.json");
    let spec = std::fs::read_to_string(&spec_path)
        .unwrap()
        .replace("[{\"type\":\"pid\"}]", "[]");
    std::fs::write(&spec_path, spec).unwrap();
}

fn corral(fixture: &Fixture) -> Command {
    let mut cmd = Command::cargo_bin("corral").unwrap();
    cmd.arg("--root").arg(&fixture.root);
    cmd
}

fn state_dir(fixture: &Fixture, id: &str) -> PathBuf {
    fixture.root.join("containers").join(id)
}

/// Host pids of every process whose argv is exactly `argv`.
fn pids_running(argv: &[&str]) -> Vec<i32> {
    let expected: Vec<u8> = argv.iter().flat_map(|arg| [arg.as_bytes(), b"\0"].concat()).collect();
    std::fs::read_dir("/proc")
        .unwrap()
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| std::fs::read(format!("/proc/{pid}/cmdline")).is_ok_and(|c| c == expected))
        .collect()
}

fn assert_gone(pid: i32) {
    // SAFETY: signal 0 only checks for existence.
    let rc = unsafe { libc::kill(pid, 0) };
    let errno = std::io::Error::last_os_error().raw_os_error();
    assert!(rc == -1 && errno == Some(libc::ESRCH), "pid {pid} is still running");
}

#[test]
#[ignore = "requires root"]
fn exit_code_is_forwarded() {
    let fx = fixture("exit 3");
    corral(&fx)
        .args(["start", "-b"])
        .arg(&fx.bundle)
        .arg("exit-code")
        .assert()
        .code(3);
    assert!(!state_dir(&fx, "exit-code").exists());
}

#[test]
#[ignore = "requires root"]
fn death_by_signal_is_128_plus_signal() {
    let fx = fixture("kill -TERM $$");
    without_namespaces(&fx);
    corral(&fx)
        .args(["start", "-b"])
        .arg(&fx.bundle)
        .arg("by-signal")
        .assert()
        .code(128 + libc::SIGTERM);
}

#[test]
#[ignore = "requires root"]
fn launcher_signals_reach_process() {
    let fx = fixture("trap 'exit 7' USR1; while :; do sleep 0.1; done");
    let pid_file = fx.bundle.join("web.pid");

    let mut launcher = std::process::Command::new(assert_cmd::cargo::cargo_bin("corral"))
        .arg("--root")
        .arg(&fx.root)
        .args(["start", "-b"])
        .arg(&fx.bundle)
        .arg("--pid-file")
        .arg(&pid_file)
        .arg("forwarded")
        .stdin(std::process::Stdio::null())
        .spawn()
        .unwrap();

    for _ in 0..100 {
        if pid_file.exists() {
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    assert!(pid_file.exists(), "container never started");

    let launcher_pid = i32::try_from(launcher.id()).unwrap();
    // SAFETY: plain kill(2) on our own child.
    assert_eq!(unsafe { libc::kill(launcher_pid, libc::SIGUSR1) }, 0);

    let status = launcher.wait().unwrap();
    assert_eq!(status.code(), Some(7));
}

#[test]
#[ignore = "requires root"]
fn output_reaches_launcher() {
    let fx = fixture("echo hello from $$");
    corral(&fx)
        .args(["start", "-b"])
        .arg(&fx.bundle)
        .arg("output")
        .assert()
        .success()
        .stdout(predicate::str::contains("hello from 1"));
}

#[test]
#[ignore = "requires root"]
fn detached_container_survives_launcher() {
    // Drop the inherited pipes so the captured output reaches EOF
    let fx = fixture("exec </dev/null >/dev/null 2>&1; exec sleep 3001");
    let pid_file = fx.bundle.join("web.pid");

    corral(&fx)
        .args(["start", "-d", "-b"])
        .arg(&fx.bundle)
        .arg("--pid-file")
        .arg(&pid_file)
        .arg("detached")
        .assert()
        .success();

    let pid: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert!(pid > 1);
    assert_eq!(pids_running(&["sleep", "3001"]), vec![pid]);

    corral(&fx)
        .args(["state", "detached"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"running\""));

    corral(&fx).args(["delete", "detached"]).assert().success();
    assert!(!state_dir(&fx, "detached").exists());
    assert!(pids_running(&["sleep", "3001"]).is_empty());
}

/// Start with a pid file that cannot be written and check that the
/// started process was killed and nothing was left behind.
fn assert_failed_pid_file_cleans_up(detach: bool, id: &str, duration: &str) {
    let fx = fixture(&format!(
        "exec </dev/null >/dev/null 2>&1; exec sleep {duration}"
    ));
    let pid_file = fx.bundle.join("missing").join("web.pid");

    let mut cmd = corral(&fx);
    cmd.arg("start");
    if detach {
        cmd.arg("-d");
    }
    cmd.arg("-b")
        .arg(&fx.bundle)
        .arg("--pid-file")
        .arg(&pid_file)
        .arg(id)
        .assert()
        .failure()
        .stderr(predicate::str::contains("pid file"));

    assert!(pids_running(&["sleep", duration]).is_empty());
    assert!(!pid_file.exists());
    assert!(!state_dir(&fx, id).exists());
}

#[test]
#[ignore = "requires root"]
fn failed_pid_file_leaves_nothing_running_detached() {
    assert_failed_pid_file_cleans_up(true, "no-pid-detached", "3002");
}

#[test]
#[ignore = "requires root"]
fn failed_pid_file_leaves_nothing_running_attached() {
    assert_failed_pid_file_cleans_up(false, "no-pid-attached", "3003");
}

#[test]
#[ignore = "requires root"]
fn attached_exit_does_not_wait_for_orphans() {
    let fx = fixture("sleep 3004 & exit 5");
    without_namespaces(&fx);

    let started = std::time::Instant::now();
    corral(&fx)
        .args(["start", "-b"])
        .arg(&fx.bundle)
        .arg("orphans")
        .assert()
        .code(5);
    assert!(started.elapsed() < std::time::Duration::from_secs(30));

    // Destroy killed the orphan through the cgroup
    for pid in pids_running(&["sleep", "3004"]) {
        assert_gone(pid);
    }
    assert!(!state_dir(&fx, "orphans").exists());
}

#[test]
#[ignore = "requires root"]
fn socket_activation_hands_over_descriptors() {
    let fx = fixture("ls /proc/self/fd; echo FDS=$LISTEN_FDS PID=$LISTEN_PID");
    let first = fx.bundle.join("first.sock");
    let second = fx.bundle.join("second.sock");
    std::fs::write(&first, "").unwrap();
    std::fs::write(&second, "").unwrap();

    let launch = r#"exec env LISTEN_PID=$$ LISTEN_FDS=2 "$0" --root "$1" start -b "$2" activated 3<"$3" 4<"$4""#;
    let output = Command::new("sh")
        .arg("-c")
        .arg(launch)
        .arg(assert_cmd::cargo::cargo_bin("corral"))
        .arg(&fx.root)
        .arg(&fx.bundle)
        .arg(&first)
        .arg(&second)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(output).unwrap();

    // 0-2 stdio, 3-4 the activated descriptors, 5 is ls's own directory handle
    let fds: Vec<&str> = stdout
        .lines()
        .filter(|line| line.chars().all(|c| c.is_ascii_digit()))
        .collect();
    assert_eq!(fds, ["0", "1", "2", "3", "4", "5"]);
    assert!(stdout.contains("FDS=2 PID=1"), "unexpected output: {stdout}");
}

#[test]
#[ignore = "requires root"]
fn failed_init_reports_cause() {
    let fx = fixture("true");
    let spec_path = fx.bundle.join("config.json");
    let spec = std::fs::read_to_string(&spec_path)
        .unwrap()
        .replace("\"cwd\":\"/\"", "\"cwd\":\"/does/not/exist\"");
    std::fs::write(&spec_path, spec).unwrap();

    corral(&fx)
        .args(["start", "-b"])
        .arg(&fx.bundle)
        .arg("bad-cwd")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Container init failed"));
    assert!(!state_dir(&fx, "bad-cwd").exists());
}

#[test]
#[ignore = "requires root"]
fn missing_rootfs_is_reported() {
    let fx = fixture("true");
    let spec_path: &Path = &fx.bundle.join("config.json");
    let spec = std::fs::read_to_string(spec_path)
        .unwrap()
        .replace("\"path\":\"/\"", "\"path\":\"rootfs\"");
    std::fs::write(spec_path, spec).unwrap();

    corral(&fx)
        .args(["start", "-b"])
        .arg(&fx.bundle)
        .arg("no-rootfs")
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}
