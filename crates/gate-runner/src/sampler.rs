use std::fs;
use std::process::Command;

use tracing::debug;

/// Resident set size of `pid` in kB, or 0 if it cannot be read.
pub fn rss_kb(pid: u32) -> u64 {
    if let Some(kb) = rss_from_proc_status(pid) {
        return kb;
    }
    if let Some(kb) = rss_from_ps(pid) {
        return kb;
    }
    debug!(pid, "no rss source available");
    0
}

fn rss_from_proc_status(pid: u32) -> Option<u64> {
    let status = fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
    parse_status_kb(&status, "VmRSS:")
}

fn rss_from_ps(pid: u32) -> Option<u64> {
    let output = Command::new("ps")
        .args(["-o", "rss=", "-p", &pid.to_string()])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_ps_rss(&String::from_utf8_lossy(&output.stdout))
}

pub(crate) fn parse_status_kb(status: &str, key: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with(key))?;
    let mut parts = line.split_whitespace();
    if parts.next()? != key {
        return None;
    }
    parts.next()?.parse::<u64>().ok()
}

pub(crate) fn parse_ps_rss(out: &str) -> Option<u64> {
    out.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())?
        .parse::<u64>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vmrss_line() {
        let status = "Name:\tqdrant\nVmPeak:\t  99999 kB\nVmRSS:\t   51234 kB\nThreads:\t12\n";
        assert_eq!(parse_status_kb(status, "VmRSS:"), Some(51234));
        assert_eq!(parse_status_kb(status, "VmSwap:"), None);
    }

    #[test]
    fn rejects_prefix_collisions() {
        let status = "VmRSSX:\t 10 kB\n";
        assert_eq!(parse_status_kb(status, "VmRSS:"), None);
    }

    #[test]
    fn parses_ps_output() {
        assert_eq!(parse_ps_rss("  4096\n"), Some(4096));
        assert_eq!(parse_ps_rss("\n"), None);
        assert_eq!(parse_ps_rss("RSS\n"), None);
    }

    #[test]
    fn unknown_pid_samples_as_zero() {
        // Above the kernel's pid_max ceiling, so no status file and no ps row.
        assert_eq!(rss_kb(4_194_305 + 12_345), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn own_process_has_nonzero_rss() {
        assert!(rss_kb(std::process::id()) > 0);
    }
}
