//! Per-sandbox resource limits.
//!
//! On hosts with cgroup v2 the child is placed in `ash/<sandbox_id>` with
//! memory, cpu, and pid caps. Without cgroups, setrlimit caps are applied
//! in the child pre-exec and CPU enforcement is skipped. Disk is enforced
//! separately by the pool's 30-second workspace sweep.

use std::io;
use std::path::PathBuf;
use tracing::{debug, warn};

/// cgroup v2 mount point.
const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Period for `cpu.max`, in microseconds.
const CPU_PERIOD_US: u64 = 100_000;

/// Limits applied to every bridge child.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    /// Percent of one core; 100 = one full core.
    pub cpu_percent: u64,
    pub max_pids: u64,
    pub disk_bytes: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 2048 * 1024 * 1024,
            cpu_percent: 100,
            max_pids: 64,
            disk_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// `cpu.max` file contents for a percent-of-one-core cap.
fn cpu_max_value(cpu_percent: u64) -> String {
    let quota = CPU_PERIOD_US * cpu_percent / 100;
    format!("{quota} {CPU_PERIOD_US}")
}

/// Whether a writable cgroup v2 hierarchy is present.
pub fn cgroups_available() -> bool {
    std::path::Path::new(CGROUP_ROOT)
        .join("cgroup.controllers")
        .is_file()
}

/// A per-sandbox cgroup. Removing it is explicit; the kernel refuses to
/// remove a group that still has members.
#[derive(Debug)]
pub struct CgroupScope {
    path: PathBuf,
}

impl CgroupScope {
    /// Create the group and write the caps.
    pub fn create(sandbox_id: &str, limits: &ResourceLimits) -> io::Result<Self> {
        let path = PathBuf::from(CGROUP_ROOT).join("ash").join(sandbox_id);
        std::fs::create_dir_all(&path)?;
        std::fs::write(path.join("memory.max"), limits.memory_bytes.to_string())?;
        std::fs::write(path.join("cpu.max"), cpu_max_value(limits.cpu_percent))?;
        std::fs::write(path.join("pids.max"), limits.max_pids.to_string())?;
        debug!(cgroup = %path.display(), "cgroup created");
        Ok(Self { path })
    }

    /// Move a process into the group.
    pub fn attach(&self, pid: u32) -> io::Result<()> {
        std::fs::write(self.path.join("cgroup.procs"), pid.to_string())
    }

    /// Remove the (now empty) group.
    pub fn remove(&self) {
        if let Err(e) = std::fs::remove_dir(&self.path) {
            warn!(cgroup = %self.path.display(), error = ?e, "cgroup removal failed");
        }
    }
}

/// Place a freshly spawned child under a cgroup, best-effort.
pub fn confine(sandbox_id: &str, pid: u32, limits: &ResourceLimits) -> Option<CgroupScope> {
    if !cgroups_available() {
        return None;
    }
    match CgroupScope::create(sandbox_id, limits) {
        Ok(scope) => {
            if let Err(e) = scope.attach(pid) {
                warn!(sandbox_id = %sandbox_id, error = ?e, "cgroup attach failed");
                scope.remove();
                None
            } else {
                Some(scope)
            }
        }
        Err(e) => {
            warn!(sandbox_id = %sandbox_id, error = ?e, "cgroup creation failed");
            None
        }
    }
}

/// setrlimit fallback applied in the child between fork and exec. CPU is
/// not enforceable this way and is skipped.
pub fn apply_rlimit_fallback(cmd: &mut tokio::process::Command, limits: &ResourceLimits) {
    let memory = limits.memory_bytes;
    let pids = limits.max_pids;
    unsafe {
        cmd.pre_exec(move || {
            let mem = libc::rlimit {
                rlim_cur: memory as libc::rlim_t,
                rlim_max: memory as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &mem) != 0 {
                return Err(io::Error::last_os_error());
            }
            let nproc = libc::rlimit {
                rlim_cur: pids as libc::rlim_t,
                rlim_max: pids as libc::rlim_t,
            };
            if libc::setrlimit(libc::RLIMIT_NPROC, &nproc) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_bytes, 2048 * 1024 * 1024);
        assert_eq!(limits.cpu_percent, 100);
        assert_eq!(limits.max_pids, 64);
        assert_eq!(limits.disk_bytes, 1024 * 1024 * 1024);
    }

    #[test]
    fn test_cpu_max_value() {
        assert_eq!(cpu_max_value(100), "100000 100000");
        assert_eq!(cpu_max_value(50), "50000 100000");
        assert_eq!(cpu_max_value(200), "200000 100000");
    }
}
