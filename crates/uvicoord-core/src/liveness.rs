use std::{sync::Arc, time::Duration};

/// A pid whose start marker no longer matches must be reported dead.
pub trait LivenessChecker: Send + Sync + 'static {
    fn start_marker(&self, pid: u32) -> Option<u64>;

    fn is_alive(&self, pid: u32, start_marker: Option<u64>) -> bool;
}

// Pid reuse is only detected on Linux. Non-unix hosts always report alive.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcLiveness;

impl LivenessChecker for ProcLiveness {
    fn start_marker(&self, pid: u32) -> Option<u64> {
        read_proc_stat(pid).map(|s| s.start_ticks)
    }

    fn is_alive(&self, pid: u32, start_marker: Option<u64>) -> bool {
        if !pid_exists(pid) {
            return false;
        }
        let Some(stat) = read_proc_stat(pid) else {
            return true;
        };
        if stat.zombie {
            return false;
        }
        match start_marker {
            Some(marker) => marker == stat.start_ticks,
            None => true,
        }
    }
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ProcStat {
    zombie: bool,
    start_ticks: u64,
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_proc_stat(s: &str) -> Option<ProcStat> {
    // comm may contain spaces and parens; fields resume after the last ')'.
    let end = s.rfind(')')?;
    let rest = s.get((end + 2)..)?;
    let parts: Vec<&str> = rest.split_whitespace().collect();
    let state = parts.first()?;
    // Field 22 (starttime); `rest` begins at field 3.
    let start_ticks: u64 = parts.get(19)?.parse().ok()?;
    Some(ProcStat {
        zombie: matches!(*state, "Z" | "X" | "x"),
        start_ticks,
    })
}

#[cfg(target_os = "linux")]
fn read_proc_stat(pid: u32) -> Option<ProcStat> {
    let s = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_proc_stat(&s)
}

#[cfg(not(target_os = "linux"))]
fn read_proc_stat(_pid: u32) -> Option<ProcStat> {
    None
}

#[cfg(unix)]
fn pid_exists(pid: u32) -> bool {
    // pid 0 would address our own process group.
    if pid == 0 {
        return false;
    }
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_exists(pid: u32) -> bool {
    pid != 0
}

/// A probe that times out or panics counts as alive.
pub async fn probe_alive(
    checker: Arc<dyn LivenessChecker>,
    pid: u32,
    start_marker: Option<u64>,
    timeout: Duration,
) -> bool {
    let task = tokio::task::spawn_blocking(move || checker.is_alive(pid, start_marker));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(alive)) => alive,
        Ok(Err(err)) => {
            tracing::warn!(pid, error = %err, "liveness probe failed; assuming alive");
            true
        }
        Err(_) => {
            tracing::warn!(pid, ?timeout, "liveness probe timed out; assuming alive");
            true
        }
    }
}

pub async fn probe_start_marker(
    checker: Arc<dyn LivenessChecker>,
    pid: u32,
    timeout: Duration,
) -> Option<u64> {
    let task = tokio::task::spawn_blocking(move || checker.start_marker(pid));
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(marker)) => marker,
        _ => {
            tracing::debug!(pid, "could not read process start marker");
            None
        }
    }
}
