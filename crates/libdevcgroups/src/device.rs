//! Device identities and the allow-rules granted for them.

use std::{
    fmt::{self, Display},
    fs,
    os::unix::fs::{FileTypeExt, MetadataExt},
    path::{Path, PathBuf},
    str::FromStr,
};

use nix::errno::Errno;
use nix::sys::stat::{major, minor};

use crate::common::{PathExt, WrapIoResult, WrappedIoError};

// same limit as the kernel's path walk
const MAX_SYMLINK_HOPS: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    Char,
    Block,
}

impl DeviceKind {
    fn from_char(c: char) -> Option<Self> {
        match c {
            'c' => Some(DeviceKind::Char),
            'b' => Some(DeviceKind::Block),
            _ => None,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            DeviceKind::Char => 'c',
            DeviceKind::Block => 'b',
        }
    }
}

impl Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// A concrete device node, identified the way the kernel identifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceRef {
    pub kind: DeviceKind,
    pub major: i64,
    pub minor: i64,
}

impl DeviceRef {
    pub fn new(kind: DeviceKind, major: i64, minor: i64) -> Self {
        Self { kind, major, minor }
    }
}

impl Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.kind, self.major, self.minor)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct Access: u8 {
        const READ = 1;
        const WRITE = 1 << 1;
        const MKNOD = 1 << 2;
    }
}

impl Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (flag, letter) in [
            (Access::READ, 'r'),
            (Access::WRITE, 'w'),
            (Access::MKNOD, 'm'),
        ] {
            if self.contains(flag) {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for Access {
    type Err = DeviceError;

    fn from_str(letters: &str) -> Result<Self, Self::Err> {
        let invalid = || DeviceError::InvalidAccess(letters.to_owned());
        if letters.is_empty() {
            return Err(invalid());
        }

        letters.chars().try_fold(Access::empty(), |access, letter| {
            let flag = match letter {
                'r' => Access::READ,
                'w' => Access::WRITE,
                'm' => Access::MKNOD,
                _ => return Err(invalid()),
            };
            Ok(access | flag)
        })
    }
}

/// One entry of a container's device allow-list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceRule {
    pub device: DeviceRef,
    pub access: Access,
    pub allow: bool,
}

impl DeviceRule {
    /// Full read, write and mknod access to `device`.
    pub fn allow(device: DeviceRef) -> Self {
        Self {
            device,
            access: Access::all(),
            allow: true,
        }
    }
}

/// Formats the rule in the syntax of the v1 `devices.allow` and `devices.deny` files.
impl Display for DeviceRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.device, self.access)
    }
}

/// A device cgroup rule as container runtimes accept it, `c 189:* rwm` or `a *:* rwm`.
/// `None` matches anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePattern {
    pub kind: Option<DeviceKind>,
    pub major: Option<i64>,
    pub minor: Option<i64>,
    pub access: Access,
}

impl FromStr for DevicePattern {
    type Err = DeviceError;

    fn from_str(rule: &str) -> Result<Self, Self::Err> {
        let invalid = || DeviceError::InvalidRule(rule.to_owned());
        let fields: Vec<&str> = rule.split_whitespace().collect();
        let [kind, numbers, access] = fields[..] else {
            return Err(invalid());
        };

        let kind = match kind {
            "a" => None,
            _ => {
                let mut chars = kind.chars();
                match (chars.next().and_then(DeviceKind::from_char), chars.next()) {
                    (Some(kind), None) => Some(kind),
                    _ => return Err(invalid()),
                }
            }
        };
        let number = |n: &str| match n {
            "*" => Ok(None),
            _ => n.parse::<i64>().map(Some).map_err(|_| invalid()),
        };
        let (major, minor) = numbers.split_once(':').ok_or_else(invalid)?;

        Ok(Self {
            kind,
            major: number(major)?,
            minor: number(minor)?,
            access: access.parse()?,
        })
    }
}

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("{path} is neither a character nor a block device")]
    NotADevice { path: PathBuf },
    #[error("invalid device access {0:?}")]
    InvalidAccess(String),
    #[error("invalid device cgroup rule {0:?}")]
    InvalidRule(String),
    #[error(transparent)]
    WrappedIo(#[from] WrappedIoError),
}

/// Resolves the device node at `path`. The path is not followed if it is a symlink.
pub fn resolve(path: &Path) -> Result<DeviceRef, DeviceError> {
    let metadata = fs::symlink_metadata(path).wrap_other(path)?;
    let file_type = metadata.file_type();

    let kind = if file_type.is_char_device() {
        DeviceKind::Char
    } else if file_type.is_block_device() {
        DeviceKind::Block
    } else {
        return Err(DeviceError::NotADevice {
            path: path.to_path_buf(),
        });
    };

    let rdev = metadata.rdev();
    let device = DeviceRef::new(kind, major(rdev) as i64, minor(rdev) as i64);
    tracing::debug!(path = %path.display(), %device, "found device");

    Ok(device)
}

/// Follows `path` while it is a symlink, reading absolute link targets as host paths
/// below `host_root`. The kernel follows the same chain when it bind-mounts a source
/// such as `/dev/serial/by-id/usb-...` into a container.
pub fn follow_links(host_root: &Path, path: &Path) -> Result<PathBuf, WrappedIoError> {
    let mut current = path.to_path_buf();

    for _ in 0..MAX_SYMLINK_HOPS {
        let metadata = fs::symlink_metadata(&current).wrap_other(&current)?;
        if !metadata.file_type().is_symlink() {
            return Ok(current);
        }

        let target = fs::read_link(&current).wrap_read(&current)?;
        let next = if target.is_absolute() {
            host_root.join_safely(&target)
        } else {
            let parent = current.parent().unwrap_or(Path::new("/"));
            parent.join(&target)
        };
        tracing::debug!(link = %current.display(), target = %next.display(), "follow symlink");
        current = next;
    }

    Err(std::io::Error::from(Errno::ELOOP)).wrap_other(path)
}

/// Lists the candidate device nodes behind a mount source: the source itself, or every
/// non-directory entry below it when it is a directory such as `/dev/dri`.
pub fn device_nodes(path: &Path) -> Result<Vec<PathBuf>, WrappedIoError> {
    let metadata = fs::metadata(path).wrap_other(path)?;
    if !metadata.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut nodes = Vec::new();
    walk_dir(path, &mut nodes)?;
    nodes.sort();
    Ok(nodes)
}

fn walk_dir(dir: &Path, nodes: &mut Vec<PathBuf>) -> Result<(), WrappedIoError> {
    for entry in fs::read_dir(dir).wrap_read(dir)? {
        let entry = entry.wrap_read(dir)?;
        let path = entry.path();
        // file_type() does not follow symlinks, a link to a directory is not descended
        if entry.file_type().wrap_other(&path)?.is_dir() {
            walk_dir(&path, nodes)?;
        } else {
            nodes.push(path);
        }
    }

    Ok(())
}
