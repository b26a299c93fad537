//! Runs the `simplecached` binary as a separate process.

use shmcache_ipc::{ProxyClient, RegionNames};
use std::fs;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn simplecached() -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_simplecached"));
    cmd.env_remove("SHMCACHE_CONFIG")
        .env_remove("SHMCACHE_WORKERS")
        .env("XDG_CONFIG_HOME", "/nonexistent")
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    cmd
}

fn unique_prefix() -> String {
    format!("shmcache-cli-{}", uuid::Uuid::new_v4().simple())
}

/// Attach to `names` once the daemon has published them
fn wait_for_daemon(child: &mut Child, names: &RegionNames) -> ProxyClient {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(client) = ProxyClient::attach(names) {
            return client.with_timeout(Duration::from_secs(10));
        }
        assert!(child.try_wait().unwrap().is_none(), "daemon exited early");
        assert!(Instant::now() < deadline, "daemon did not come up");
        thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn test_help_exits_zero() {
    let status = simplecached().arg("-h").status().unwrap();
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_bad_thread_counts_exit_two() {
    for count in ["0", "-1", "129", "many"] {
        let status = simplecached()
            .args(["-t", count])
            .env("SHMCACHE_SHM_PREFIX", unique_prefix())
            .status()
            .unwrap();
        assert_eq!(status.code(), Some(2), "-t {count}");
    }
}

#[test]
fn test_missing_cache_dir_exits_one() {
    let dir = TempDir::new().unwrap();
    let status = simplecached()
        .arg("-c")
        .arg(dir.path().join("missing"))
        .env("SHMCACHE_SHM_PREFIX", unique_prefix())
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(1));
}

#[test]
fn test_sigterm_shuts_down_cleanly() {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("hello.txt"), b"hello from the daemon").unwrap();
    let prefix = unique_prefix();
    let names = RegionNames::with_prefix(&prefix);

    let mut child = simplecached()
        .arg("-c")
        .arg(dir.path())
        .args(["-t", "2"])
        .env("SHMCACHE_SHM_PREFIX", &prefix)
        .spawn()
        .unwrap();

    let client = wait_for_daemon(&mut child, &names);
    assert_eq!(client.fetch("/hello.txt").unwrap(), b"hello from the daemon");
    client.detach();

    // SAFETY: plain kill(2) on our own child process.
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    assert_eq!(rc, 0);
    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(0));

    assert!(ProxyClient::attach(&names).is_err());
}
