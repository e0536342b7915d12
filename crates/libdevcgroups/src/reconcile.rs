//! Grants a container access to the devices bind-mounted into it.
//!
//! For every mount whose host source lies below the device prefix, each device node
//! behind it is resolved and allowed in the device-control cgroup of the container's
//! process. Failures are contained to the device or mount they occur on.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use nix::unistd::Pid;

use crate::cgroup::{self, ApplyError, Backend, CgroupError, CgroupVersion};
use crate::cgroup::v2::{program::ProgramRule, rules::RuleStore, Baseline};
use crate::common::WrappedIoError;
use crate::config::Config;
use crate::device::{self, Access, DeviceError, DevicePattern, DeviceRule};

const SHORT_ID_LEN: usize = 10;

/// One bind mount of a running container, as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRequest {
    pub container_id: String,
    pub pid: Pid,
    /// Host-side source of the mount.
    pub source: PathBuf,
    pub destination: PathBuf,
}

/// A host device the runtime passed into the container on its own, `--device`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedDevice {
    pub path_on_host: PathBuf,
    pub access: Access,
}

/// Device access the runtime set up when it created the container. Grants on the
/// unified hierarchy replace the runtime's device program, so they must keep all of it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeDevices {
    pub privileged: bool,
    pub mapped: Vec<MappedDevice>,
    /// `--device-cgroup-rule` entries.
    pub rules: Vec<DevicePattern>,
}

/// Outcome counts of one container pass, in device nodes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn merge(&mut self, other: ReconcileReport) {
        self.applied += other.applied;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error("failed to list devices: {0}")]
    Walk(#[from] WrappedIoError),
    #[error(transparent)]
    Cgroup(#[from] CgroupError),
    #[error("failed to apply {rule} to {path}: {err}")]
    RuleApplication {
        rule: DeviceRule,
        path: PathBuf,
        err: ApplyError,
    },
}

pub fn short_id(id: &str) -> &str {
    id.get(..SHORT_ID_LEN).unwrap_or(id)
}

/// Owns the accumulated v2 rules, so one instance has to serve the whole daemon.
pub struct Reconciler {
    config: Arc<Config>,
    rules: RuleStore,
}

impl Reconciler {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            rules: RuleStore::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    /// Drops recorded rules of cgroups that no longer exist.
    pub fn prune(&self) -> usize {
        let pruned = self.rules.prune();
        if pruned > 0 {
            tracing::debug!(pruned, "pruned rules of removed cgroups");
        }
        pruned
    }

    /// Processes every mount of one container. The cgroup version is detected once,
    /// on the first device found, and reused for the rest of the pass.
    pub fn reconcile_container(
        &self,
        mounts: &[MountRequest],
        runtime: &RuntimeDevices,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut backend = None;

        for mount in mounts {
            if !self.config.is_device_path(&mount.source) {
                continue;
            }
            report.merge(self.reconcile_mount(mount, runtime, &mut backend));
        }

        report
    }

    /// Device nodes behind a host path. The path itself may be a symlink, such as
    /// the entries of `/dev/serial/by-id`.
    fn device_nodes(&self, host_path: &Path) -> Result<Vec<PathBuf>, WrappedIoError> {
        let source = self.config.host_path(host_path);
        let source = device::follow_links(&self.config.host_root, &source)?;
        device::device_nodes(&source)
    }

    fn reconcile_mount<'a>(
        &'a self,
        mount: &MountRequest,
        runtime: &RuntimeDevices,
        backend: &mut Option<Backend<'a>>,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let id = short_id(&mount.container_id);

        let nodes = match self.device_nodes(&mount.source) {
            Ok(nodes) => nodes,
            Err(err) => {
                tracing::warn!(
                    container = id,
                    pid = mount.pid.as_raw(),
                    source = %mount.source.display(),
                    "skipping mount: {}",
                    ReconcileError::from(err)
                );
                report.failed += 1;
                return report;
            }
        };

        for node in nodes {
            match self.grant(mount, runtime, &node, backend) {
                Ok(rule) => {
                    tracing::info!(
                        container = id,
                        pid = mount.pid.as_raw(),
                        path = %node.display(),
                        destination = %mount.destination.display(),
                        %rule,
                        "allowed device"
                    );
                    report.applied += 1;
                }
                Err(ReconcileError::Device(DeviceError::NotADevice { path })) => {
                    tracing::debug!(container = id, path = %path.display(), "not a device");
                    report.skipped += 1;
                }
                Err(err) => {
                    tracing::warn!(
                        container = id,
                        pid = mount.pid.as_raw(),
                        path = %node.display(),
                        "failed to allow device: {}",
                        err
                    );
                    report.failed += 1;
                }
            }
        }

        report
    }

    fn grant<'a>(
        &'a self,
        mount: &MountRequest,
        runtime: &RuntimeDevices,
        node: &Path,
        backend: &mut Option<Backend<'a>>,
    ) -> Result<DeviceRule, ReconcileError> {
        let pid = mount.pid;
        let rule = DeviceRule::allow(device::resolve(node)?);

        let backend = match backend {
            Some(backend) => backend.clone(),
            None => {
                let version = cgroup::detect_version(&self.config, pid)?;
                tracing::info!(pid = pid.as_raw(), %version, "detected cgroup version");
                let baseline = match version {
                    CgroupVersion::V1 => Baseline::default(),
                    CgroupVersion::V2 => self.baseline(short_id(&mount.container_id), runtime),
                };
                let detected = Backend::new(version, &self.rules, baseline);
                *backend = Some(detected.clone());
                detected
            }
        };

        let target = backend.resolve_path(&self.config, pid)?;
        tracing::debug!(
            pid = pid.as_raw(),
            version = %target.version,
            cgroup = %target.path.display(),
            "resolved device cgroup"
        );

        backend
            .apply(&target, &rule)
            .map_err(|err| ReconcileError::RuleApplication {
                rule,
                path: target.path.clone(),
                err,
            })?;

        Ok(rule)
    }

    /// Translates what the runtime granted into the rules every v2 program of the
    /// container has to keep. Entries that cannot be resolved are logged and left out.
    fn baseline(&self, id: &str, runtime: &RuntimeDevices) -> Baseline {
        if runtime.privileged {
            tracing::debug!(container = id, "privileged container");
            return Baseline::privileged();
        }

        let mut rules = Vec::new();
        for pattern in &runtime.rules {
            match ProgramRule::try_from(pattern) {
                Ok(rule) => rules.push(rule),
                Err(err) => tracing::warn!(container = id, "ignoring device cgroup rule: {}", err),
            }
        }

        for mapped in &runtime.mapped {
            let nodes = match self.device_nodes(&mapped.path_on_host) {
                Ok(nodes) => nodes,
                Err(err) => {
                    tracing::warn!(container = id, "ignoring runtime device: {}", err);
                    continue;
                }
            };
            for node in nodes {
                let device = match device::resolve(&node) {
                    Ok(device) => device,
                    Err(err) => {
                        tracing::debug!(container = id, "ignoring runtime device: {}", err);
                        continue;
                    }
                };
                let rule = DeviceRule {
                    device,
                    access: mapped.access,
                    allow: true,
                };
                match ProgramRule::try_from(&rule) {
                    Ok(rule) => rules.push(rule),
                    Err(err) => tracing::warn!(container = id, %rule, "ignoring runtime device: {}", err),
                }
            }
        }

        Baseline::container(rules)
    }
}
