//! Resource probes: out-of-process measurement of a worker's memory and
//! handle usage, used by the recycle predicate.
//!
//! A probe answers "how much is this process using right now" or reports
//! that it couldn't find out at all. Platforms with no meaningful notion of
//! "handle count" (anything but Windows) report zero for that field rather
//! than erroring, since the recycle predicate treats zero as "never exceeds
//! this ceiling" for caps that do not apply. A missing process, by
//! contrast, is not "zero usage" — it is reported as `None` so the caller
//! can treat the worker as lost.

/// A point-in-time resource snapshot for a single process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    pub working_set_mb: u64,
    pub gdi_handles: u64,
    pub user_handles: u64,
    pub total_handles: u64,
}

/// Platform-abstracted resource probe.
///
/// # Why
/// `sandbox-pool` depends on this trait rather than a concrete
/// implementation so tests can substitute a fake that returns
/// over-threshold numbers on demand without spawning a real process, and so
/// a future platform-specific probe (e.g. Windows GDI/USER handle counts)
/// can be added without touching the recycle predicate that consumes it.
///
/// # Contract
/// - `sample` must never block for long; it runs inline on the hot path of
///   every `RecycleCheckCalls`-th invocation.
/// - A probe failure (process gone, permission denied, `/proc` entry
///   missing) returns `None`. It must not be coerced to a zeroed
///   [`ResourceUsage`] — that would read as "this worker is well within
///   every threshold" when the truth is "this worker cannot be observed,"
///   and the recycle predicate treats those two cases oppositely.
pub trait ResourceProbe: Send + Sync {
    /// Returns `None` if the process could not be measured at all (e.g. it
    /// has already exited). Callers must treat `None` as "worker lost,"
    /// never as "zero usage."
    fn sample(&self, pid: u32) -> Option<ResourceUsage>;
}

/// Default probe: `/proc` on Linux, zeroed readings everywhere else.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultResourceProbe;

impl ResourceProbe for DefaultResourceProbe {
    #[cfg(target_os = "linux")]
    fn sample(&self, pid: u32) -> Option<ResourceUsage> {
        linux::sample(pid)
    }

    #[cfg(not(target_os = "linux"))]
    fn sample(&self, _pid: u32) -> Option<ResourceUsage> {
        Some(ResourceUsage::default())
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs;

    use super::ResourceUsage;

    pub fn sample(pid: u32) -> Option<ResourceUsage> {
        let working_set_mb = working_set_mb(pid)?;
        Some(ResourceUsage {
            working_set_mb,
            gdi_handles: 0,
            user_handles: 0,
            total_handles: fd_count(pid).unwrap_or(0),
        })
    }

    fn working_set_mb(pid: u32) -> Option<u64> {
        let status = fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
        for line in status.lines() {
            if let Some(rest) = line.strip_prefix("VmRSS:") {
                let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
                return Some(kb / 1024);
            }
        }
        None
    }

    fn fd_count(pid: u32) -> Option<u64> {
        let entries = fs::read_dir(format!("/proc/{pid}/fd")).ok()?;
        Some(entries.count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_os = "linux")]
    fn default_probe_reports_none_for_nonexistent_pid() {
        let probe = DefaultResourceProbe;
        // Pid 0 never belongs to a readable /proc entry; the probe must
        // report the worker as unmeasurable rather than panic or fake zero.
        assert_eq!(probe.sample(0), None);
    }

    #[test]
    #[cfg(not(target_os = "linux"))]
    fn default_probe_reports_zeroed_usage_on_unsupported_platforms() {
        let probe = DefaultResourceProbe;
        assert_eq!(probe.sample(0), Some(ResourceUsage::default()));
    }
}
