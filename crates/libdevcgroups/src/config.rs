use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::common::PathExt;

/// Mount point of the host root filesystem inside the daemon's own container.
pub const DEFAULT_HOST_ROOT: &str = "/host";
/// The daemon shares the host pid namespace, so the host's procfs is its own.
pub const DEFAULT_PROC_ROOT: &str = "/proc";
pub const DEFAULT_DEVICE_PREFIX: &str = "/dev";
pub const DEFAULT_PLUGIN_ID: &str = "dvd";

/// Runtime configuration, built once at start-up and shared by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where the real host root is visible. Host-side device sources and cgroup
    /// mount points are re-rooted under it.
    pub host_root: PathBuf,
    /// Proc filesystem listing host processes.
    pub proc_root: PathBuf,
    /// Mounts whose host source lies below this path are treated as device mounts.
    pub device_prefix: PathBuf,
    /// Identifier used for syslog tagging.
    pub plugin_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_root: PathBuf::from(DEFAULT_HOST_ROOT),
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            device_prefix: PathBuf::from(DEFAULT_DEVICE_PREFIX),
            plugin_id: DEFAULT_PLUGIN_ID.to_owned(),
        }
    }
}

impl Config {
    /// Translates a path on the host into the path this daemon can reach it at.
    pub fn host_path<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.host_root.join_safely(path)
    }

    pub fn proc_path(&self, pid: Pid) -> PathBuf {
        self.proc_root.join(pid.as_raw().to_string())
    }

    /// Component-wise prefix check, `/devices` is not below `/dev`.
    pub fn is_device_path<P: AsRef<Path>>(&self, source: P) -> bool {
        source.as_ref().starts_with(&self.device_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host_root, PathBuf::from("/host"));
        assert_eq!(config.proc_root, PathBuf::from("/proc"));
        assert_eq!(config.plugin_id, "dvd");
    }

    #[test]
    fn test_host_path() {
        let config = Config::default();
        assert_eq!(
            config.host_path("/dev/dri/card0"),
            PathBuf::from("/host/dev/dri/card0")
        );
        assert_eq!(
            config.proc_path(Pid::from_raw(4242)),
            PathBuf::from("/proc/4242")
        );
    }

    #[test]
    fn test_is_device_path() {
        let config = Config::default();
        for (source, expected) in [
            ("/dev/dri", true),
            ("/dev/ttyUSB0", true),
            ("/dev", true),
            ("/data", false),
            ("/devices/gpu", false),
            ("/var/lib/docker/volumes/dev", false),
        ] {
            assert_eq!(config.is_device_path(source), expected, "{source}");
        }
    }
}
