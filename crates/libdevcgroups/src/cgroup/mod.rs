//! Locating a process's device-control cgroup and granting devices through it.
//!
//! Hosts expose device control in one of two ways:
//! - V1: a named `devices` hierarchy with `devices.allow`/`devices.deny` files.
//! - V2: the unified hierarchy, where an attached `BPF_PROG_TYPE_CGROUP_DEVICE`
//!   program decides every device access.
//!
//! Hybrid hosts mount both. There the v1 `devices` controller is the active one.

use std::{
    fmt::{self, Display},
    fs,
    path::{Path, PathBuf},
};

use nix::unistd::Pid;
use procfs::{
    process::{MountInfo, Process},
    ProcError, ProcessCGroup,
};

use crate::common::{PathExt, WrapIoResult, WrappedIoError};
use crate::config::Config;
use crate::device::DeviceRule;

pub mod v1;
pub mod v2;

use v2::{rules::RuleStore, Baseline};

const INIT_PID: i32 = 1;
const DEVICES_CONTROLLER: &str = "devices";
const CGROUP_V1_FS: &str = "cgroup";
const CGROUP_V2_FS: &str = "cgroup2";
const UNIFIED_HIERARCHY_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CgroupVersion {
    V1,
    V2,
}

impl Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let print = match self {
            CgroupVersion::V1 => "v1",
            CgroupVersion::V2 => "v2",
        };

        write!(f, "{print}")
    }
}

/// Where device rules for one process have to be written or attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupTarget {
    pub version: CgroupVersion,
    /// Device-control cgroup directory of the process, as reachable by this daemon.
    pub path: PathBuf,
    /// Root of the hierarchy `path` belongs to.
    pub mount_root: PathBuf,
}

#[derive(thiserror::Error, Debug)]
pub enum CgroupError {
    #[error("failed to read cgroup membership of process {pid}: {err}")]
    Membership { pid: Pid, err: ProcError },
    #[error("failed to read host mount table: {0}")]
    MountInfo(ProcError),
    #[error("no devices cgroup found for process {pid}")]
    Unavailable { pid: Pid },
    #[error("{version} devices cgroup of process {pid} at {path} is not a directory")]
    PathResolution {
        pid: Pid,
        version: CgroupVersion,
        path: PathBuf,
    },
    #[error(transparent)]
    WrappedIo(#[from] WrappedIoError),
}

#[derive(thiserror::Error, Debug)]
pub enum ApplyError {
    #[error("v1 rule was rejected: {0}")]
    V1(#[from] WrappedIoError),
    #[error("v2 program was rejected: {0}")]
    V2(#[from] v2::DevicesControllerError),
}

/// Snapshot of a process's cgroup membership and the host's cgroup mounts.
pub struct Hierarchy {
    pid: Pid,
    memberships: Vec<ProcessCGroup>,
    mounts: Vec<MountInfo>,
}

impl Hierarchy {
    /// Reads `{proc_root}/{pid}/cgroup` and the mount table of the host init process.
    pub fn load(config: &Config, pid: Pid) -> Result<Self, CgroupError> {
        let memberships = Process::new_with_root(config.proc_path(pid))
            .and_then(|process| process.cgroups())
            .map_err(|err| CgroupError::Membership { pid, err })?
            .into_iter()
            .collect();
        let mounts = Process::new_with_root(config.proc_path(Pid::from_raw(INIT_PID)))
            .and_then(|process| process.mountinfo())
            .map_err(CgroupError::MountInfo)?
            .into_iter()
            .collect();

        Ok(Self {
            pid,
            memberships,
            mounts,
        })
    }

    pub fn version(&self) -> Result<CgroupVersion, CgroupError> {
        if self.devices_v1().is_some() {
            return Ok(CgroupVersion::V1);
        }
        if self.unified().is_some() {
            return Ok(CgroupVersion::V2);
        }

        Err(CgroupError::Unavailable { pid: self.pid })
    }

    pub fn target(&self, version: CgroupVersion, config: &Config) -> Result<CgroupTarget, CgroupError> {
        let (membership, mount) = match version {
            CgroupVersion::V1 => self.devices_v1(),
            CgroupVersion::V2 => self.unified(),
        }
        .ok_or(CgroupError::Unavailable { pid: self.pid })?;

        let pathname = Path::new(&membership.pathname);
        // a hierarchy mounted from a sub-cgroup shows paths relative to that cgroup
        let relative = pathname.strip_prefix(&mount.root).unwrap_or(pathname);
        let mount_root = config.host_path(&mount.mount_point);
        let path = mount_root.join_safely(relative);

        let metadata = fs::metadata(&path).wrap_other(&path)?;
        if !metadata.is_dir() {
            return Err(CgroupError::PathResolution {
                pid: self.pid,
                version,
                path,
            });
        }

        Ok(CgroupTarget {
            version,
            path,
            mount_root,
        })
    }

    fn devices_v1(&self) -> Option<(&ProcessCGroup, &MountInfo)> {
        let membership = self.memberships.iter().find(|cgroup| {
            cgroup
                .controllers
                .iter()
                .any(|controller| controller == DEVICES_CONTROLLER)
        })?;
        let mount = self
            .mounts
            .iter()
            .find(|m| m.fs_type == CGROUP_V1_FS && mounts_devices(m))?;

        Some((membership, mount))
    }

    fn unified(&self) -> Option<(&ProcessCGroup, &MountInfo)> {
        let membership = self
            .memberships
            .iter()
            .find(|cgroup| cgroup.hierarchy == UNIFIED_HIERARCHY_ID)?;
        let mount = self.mounts.iter().find(|m| m.fs_type == CGROUP_V2_FS)?;

        Some((membership, mount))
    }
}

fn mounts_devices(mount: &MountInfo) -> bool {
    if mount.super_options.contains_key(DEVICES_CONTROLLER) {
        return true;
    }

    // fall back to the directory name, co-mounted controllers show up as "a,b"
    mount
        .mount_point
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.split(',').any(|c| c == DEVICES_CONTROLLER))
        .unwrap_or(false)
}

/// Determines which cgroup API governs device access for `pid`.
pub fn detect_version(config: &Config, pid: Pid) -> Result<CgroupVersion, CgroupError> {
    Hierarchy::load(config, pid)?.version()
}

/// Computes the host-side device-control cgroup of `pid` for `version`.
pub fn resolve_path(
    version: CgroupVersion,
    config: &Config,
    pid: Pid,
) -> Result<CgroupTarget, CgroupError> {
    Hierarchy::load(config, pid)?.target(version, config)
}

/// The device rule mechanism of one cgroup version.
#[derive(Clone)]
pub enum Backend<'a> {
    V1(v1::Devices),
    V2(v2::Devices<'a>),
}

impl<'a> Backend<'a> {
    /// `baseline` only matters for v2, the v1 allow-list is extended in place.
    pub fn new(version: CgroupVersion, rules: &'a RuleStore, baseline: Baseline) -> Self {
        match version {
            CgroupVersion::V1 => Backend::V1(v1::Devices),
            CgroupVersion::V2 => Backend::V2(v2::Devices::new(rules, baseline)),
        }
    }

    pub fn version(&self) -> CgroupVersion {
        match self {
            Backend::V1(_) => CgroupVersion::V1,
            Backend::V2(_) => CgroupVersion::V2,
        }
    }

    pub fn resolve_path(&self, config: &Config, pid: Pid) -> Result<CgroupTarget, CgroupError> {
        resolve_path(self.version(), config, pid)
    }

    pub fn apply(&self, target: &CgroupTarget, rule: &DeviceRule) -> Result<(), ApplyError> {
        match self {
            Backend::V1(devices) => Ok(devices.apply(target, rule)?),
            Backend::V2(devices) => Ok(devices.apply(target, rule)?),
        }
    }
}
