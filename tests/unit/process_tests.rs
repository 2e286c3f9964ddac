//! Unit tests for pid probing and signalling.

#![cfg(unix)]

use std::time::{Duration, Instant};

use agent_dispatch::backend::process;

#[test]
fn reaped_child_is_dead() {
    let mut child = std::process::Command::new("true").spawn().expect("spawn");
    let pid = child.id();
    child.wait().expect("reap");

    assert!(!process::is_alive(pid));
}

#[test]
fn signalling_a_dead_process_is_not_an_error() {
    let mut child = std::process::Command::new("true").spawn().expect("spawn");
    let pid = child.id();
    child.wait().expect("reap");

    process::terminate(pid).expect("terminate");
    process::force_kill(pid).expect("kill");
}

#[test]
fn terminate_ends_a_sleeping_process() {
    let mut child = std::process::Command::new("sleep")
        .arg("30")
        .spawn()
        .expect("spawn");
    let pid = child.id();
    assert!(process::is_alive(pid));

    process::terminate(pid).expect("terminate");
    let status = child.wait().expect("reap");

    assert!(!status.success());
    assert!(!process::is_alive(pid));
}

#[cfg(target_os = "linux")]
#[test]
fn unreaped_zombie_reads_as_dead() {
    let mut child = std::process::Command::new("true").spawn().expect("spawn");
    let pid = child.id();

    let deadline = Instant::now() + Duration::from_secs(5);
    while process::is_alive(pid) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!process::is_alive(pid), "exited child should read as dead before reaping");
    child.wait().expect("reap");
}

#[test]
fn invalid_pids_are_refused() {
    assert!(!process::is_alive(0));
    assert!(process::terminate(0).is_err());
    assert!(process::force_kill(u32::MAX).is_err());
}
