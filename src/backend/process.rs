//! OS process probing and signalling by pid.
//!
//! Used by the reconciler to decide whether a `running` run still has a
//! live process, and by stop to terminate and, after the grace window,
//! force-kill it.

use crate::Result;

/// Whether `pid` names a live process.
///
/// Pid `0` and values outside the positive `i32` range are never alive, so a
/// corrupt record can never address a process group. On Linux a zombie
/// counts as dead.
#[cfg(unix)]
#[must_use]
pub fn is_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;

    let Some(target) = to_pid(pid) else {
        return false;
    };
    match kill(target, None) {
        Ok(()) | Err(Errno::EPERM) => !is_zombie(pid),
        Err(_) => false,
    }
}

/// Send SIGTERM to `pid`.
///
/// # Errors
///
/// Returns `AppError::Backend` if the signal cannot be delivered. A process
/// that is already gone is not an error.
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<()> {
    signal(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Send SIGKILL to `pid`.
///
/// # Errors
///
/// Returns `AppError::Backend` if the signal cannot be delivered. A process
/// that is already gone is not an error.
#[cfg(unix)]
pub fn force_kill(pid: u32) -> Result<()> {
    signal(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn signal(pid: u32, sig: nix::sys::signal::Signal) -> Result<()> {
    use nix::errno::Errno;

    let Some(target) = to_pid(pid) else {
        return Err(crate::AppError::Backend(format!("refusing to signal pid {pid}")));
    };
    match nix::sys::signal::kill(target, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(crate::AppError::Backend(format!(
            "failed to send {sig:?} to {pid}: {err}"
        ))),
    }
}

#[cfg(unix)]
fn to_pid(pid: u32) -> Option<nix::unistd::Pid> {
    i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .map(nix::unistd::Pid::from_raw)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn is_zombie(_pid: u32) -> bool {
    false
}

// TODO: probe and signal through OpenProcess/TerminateProcess on Windows.
/// Liveness probing is unix-only; elsewhere every pid reads as dead.
#[cfg(not(unix))]
#[must_use]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Signals are unix-only.
///
/// # Errors
///
/// Always returns `AppError::Backend`.
#[cfg(not(unix))]
pub fn terminate(pid: u32) -> Result<()> {
    Err(crate::AppError::Backend(format!(
        "cannot signal {pid}: process signals require unix"
    )))
}

/// Signals are unix-only.
///
/// # Errors
///
/// Always returns `AppError::Backend`.
#[cfg(not(unix))]
pub fn force_kill(pid: u32) -> Result<()> {
    terminate(pid)
}
