use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

#[cfg(test)]
use super::bpf::mock_prog as bpf_prog;
#[cfg(not(test))]
use super::bpf::prog as bpf_prog;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;

use super::bpf::{AttachedProgram, BpfError};
use super::program::{self, Program, ProgramError, ProgramRule};
use super::rules::{lock, RuleSet, RuleStore};
use crate::cgroup::CgroupTarget;
use crate::device::DeviceRule;

const LICENSE: &str = "Apache";

/// What a container may access before this daemon grants anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Baseline {
    /// The runtime installed no device restriction.
    pub privileged: bool,
    pub rules: Vec<ProgramRule>,
}

impl Baseline {
    /// The container defaults followed by the devices the runtime granted itself.
    pub fn container(runtime_rules: impl IntoIterator<Item = ProgramRule>) -> Self {
        let mut rules = program::container_defaults();
        rules.extend(runtime_rules);
        Self {
            privileged: false,
            rules,
        }
    }

    pub fn privileged() -> Self {
        Self {
            privileged: true,
            rules: Vec::new(),
        }
    }
}

impl Default for Baseline {
    fn default() -> Self {
        Self::container([])
    }
}

/// Unified hierarchy device controller. Grants are kept in a [`RuleStore`] and
/// every grant replaces the cgroup's device program with one allowing the
/// baseline plus everything granted so far. A cgroup without any device program
/// is unrestricted and stays that way.
#[derive(Clone)]
pub struct Devices<'a> {
    rules: &'a RuleStore,
    baseline: Arc<Baseline>,
}

#[derive(thiserror::Error, Debug)]
pub enum DevicesControllerError {
    #[error("bpf error: {0}")]
    Bpf(#[from] BpfError),
    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
    #[error("program error: {0}")]
    Program(#[from] ProgramError),
}

impl<'a> Devices<'a> {
    pub fn new(rules: &'a RuleStore, baseline: Baseline) -> Self {
        Self {
            rules,
            baseline: Arc::new(baseline),
        }
    }

    pub fn apply(
        &self,
        target: &CgroupTarget,
        rule: &DeviceRule,
    ) -> Result<(), DevicesControllerError> {
        let entry = self.rules.entry(&target.path);
        let mut granted = lock(&entry);
        let inserted = granted.insert(*rule);

        if self.baseline.privileged {
            tracing::debug!(cgroup = %target.path.display(), "privileged container, device program left alone");
            return Ok(());
        }

        let result = self.replace_program(&target.path, &granted);
        if result.is_err() && inserted {
            granted.remove(rule);
        }
        result
    }

    fn replace_program(&self, cgroup: &Path, granted: &RuleSet) -> Result<(), DevicesControllerError> {
        let dir = nix::dir::Dir::open(cgroup, OFlag::O_RDONLY | OFlag::O_DIRECTORY, Mode::empty())?;
        let cgroup_fd = dir.as_raw_fd();

        let old_progs = bpf_prog::query(cgroup_fd)?;
        if old_progs.is_empty() {
            tracing::debug!(cgroup = %cgroup.display(), "no device program attached, cgroup is unrestricted");
            return Ok(());
        }

        let result = self.load_and_attach(cgroup_fd, granted, &old_progs);
        for old_prog in &old_progs {
            bpf_prog::close(old_prog.fd);
        }
        result?;

        tracing::debug!(
            cgroup = %cgroup.display(),
            granted = granted.len(),
            "replaced device program"
        );
        Ok(())
    }

    fn load_and_attach(
        &self,
        cgroup_fd: RawFd,
        granted: &RuleSet,
        old_progs: &[AttachedProgram],
    ) -> Result<(), DevicesControllerError> {
        let mut rules = self.baseline.rules.clone();
        for rule in granted {
            rules.push(ProgramRule::try_from(rule)?);
        }
        let prog = Program::from_rules(&rules, false);

        // loading counts against RLIMIT_MEMLOCK on older kernels
        bpf_prog::bump_memlock_rlimit()?;
        let prog_fd = bpf_prog::load(LICENSE, prog.bytecodes())?;

        let result = attach_and_detach(prog_fd, cgroup_fd, old_progs);
        bpf_prog::close(prog_fd);
        result
    }
}

// Attach first, then detach what was there before, so the cgroup is never
// left without a device program.
fn attach_and_detach(
    prog_fd: RawFd,
    cgroup_fd: RawFd,
    old_progs: &[AttachedProgram],
) -> Result<(), DevicesControllerError> {
    bpf_prog::attach(prog_fd, cgroup_fd)?;
    for old_prog in old_progs {
        tracing::debug!(id = old_prog.id, "detach previous device program");
        bpf_prog::detach(old_prog.fd, cgroup_fd)?;
    }
    Ok(())
}
