use crate::common::{self, WrappedIoError, DEVICES_ALLOW, DEVICES_DENY};
use crate::device::DeviceRule;

use super::CgroupTarget;

/// Legacy devices controller. The kernel keeps the allow-list itself and merges
/// repeated writes of the same rule, so applying a rule is a single file write.
#[derive(Clone, Copy)]
pub struct Devices;

impl Devices {
    pub fn apply(&self, target: &CgroupTarget, rule: &DeviceRule) -> Result<(), WrappedIoError> {
        let file = if rule.allow {
            DEVICES_ALLOW
        } else {
            DEVICES_DENY
        };

        tracing::debug!(cgroup = %target.path.display(), %rule, "write {}", file);
        common::write_cgroup_file_str(target.path.join(file), &rule.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::read_to_string;
    use std::path::Path;

    use super::*;
    use crate::cgroup::CgroupVersion;
    use crate::device::{Access, DeviceKind, DeviceRef};
    use crate::test::set_fixture;

    fn target(path: &Path) -> CgroupTarget {
        CgroupTarget {
            version: CgroupVersion::V1,
            path: path.to_path_buf(),
            mount_root: path.to_path_buf(),
        }
    }

    fn reset(path: &Path) {
        // cgroup files are not appended to, resetting them mimics the kernel
        set_fixture(path, DEVICES_ALLOW, "").expect("create allowed devices list");
        set_fixture(path, DEVICES_DENY, "").expect("create denied devices list");
    }

    #[test]
    fn test_apply_allow_rule() {
        let tmp = tempfile::tempdir().unwrap();
        reset(tmp.path());
        let rule = DeviceRule::allow(DeviceRef::new(DeviceKind::Char, 226, 0));

        Devices
            .apply(&target(tmp.path()), &rule)
            .expect("apply device rule");

        assert_eq!(
            read_to_string(tmp.path().join(DEVICES_ALLOW)).unwrap(),
            "c 226:0 rwm"
        );
        assert_eq!(read_to_string(tmp.path().join(DEVICES_DENY)).unwrap(), "");
    }

    #[test]
    fn test_apply_deny_rule() {
        let tmp = tempfile::tempdir().unwrap();
        reset(tmp.path());
        let rule = DeviceRule {
            device: DeviceRef::new(DeviceKind::Block, 8, 0),
            access: Access::WRITE,
            allow: false,
        };

        Devices
            .apply(&target(tmp.path()), &rule)
            .expect("apply device rule");

        assert_eq!(
            read_to_string(tmp.path().join(DEVICES_DENY)).unwrap(),
            "b 8:0 w"
        );
    }

    #[test]
    fn test_apply_same_rule_twice() {
        let tmp = tempfile::tempdir().unwrap();
        let rule = DeviceRule::allow(DeviceRef::new(DeviceKind::Char, 188, 0));

        for _ in 0..2 {
            reset(tmp.path());
            Devices
                .apply(&target(tmp.path()), &rule)
                .expect("apply device rule");
            assert_eq!(
                read_to_string(tmp.path().join(DEVICES_ALLOW)).unwrap(),
                "c 188:0 rwm"
            );
        }
    }

    #[test]
    fn test_apply_without_devices_controller() {
        let tmp = tempfile::tempdir().unwrap();
        let rule = DeviceRule::allow(DeviceRef::new(DeviceKind::Char, 226, 0));

        assert!(Devices.apply(&target(tmp.path()), &rule).is_err());
    }
}
