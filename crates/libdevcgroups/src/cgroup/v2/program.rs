use rbpf::insn_builder::{Arch as RbpfArch, *};

use crate::device::{Access, DeviceKind, DevicePattern, DeviceRule};

/// A device rule as the BPF program matches it. A missing kind, major or minor
/// number matches any device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramRule {
    pub kind: Option<DeviceKind>,
    pub major: Option<u32>,
    pub minor: Option<u32>,
    pub access: Access,
    pub allow: bool,
}

impl ProgramRule {
    fn device(kind: DeviceKind, major: u32, minor: u32) -> Self {
        Self {
            kind: Some(kind),
            major: Some(major),
            minor: Some(minor),
            access: Access::all(),
            allow: true,
        }
    }
}

fn device_number(n: i64) -> Result<u32, ProgramError> {
    u32::try_from(n).map_err(|_| ProgramError::DeviceNumber(n))
}

impl TryFrom<&DeviceRule> for ProgramRule {
    type Error = ProgramError;

    fn try_from(rule: &DeviceRule) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: Some(rule.device.kind),
            major: Some(device_number(rule.device.major)?),
            minor: Some(device_number(rule.device.minor)?),
            access: rule.access,
            allow: rule.allow,
        })
    }
}

impl TryFrom<&DevicePattern> for ProgramRule {
    type Error = ProgramError;

    fn try_from(pattern: &DevicePattern) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: pattern.kind,
            major: pattern.major.map(device_number).transpose()?,
            minor: pattern.minor.map(device_number).transpose()?,
            access: pattern.access,
            allow: true,
        })
    }
}

/// Devices every container is allowed to use, the same baseline container
/// runtimes install before any explicitly granted device.
pub fn container_defaults() -> Vec<ProgramRule> {
    use DeviceKind::Char;

    let mknod_any = |kind| ProgramRule {
        kind: Some(kind),
        major: None,
        minor: None,
        access: Access::MKNOD,
        allow: true,
    };

    vec![
        mknod_any(Char),
        mknod_any(DeviceKind::Block),
        // null, zero, full
        ProgramRule::device(Char, 1, 3),
        ProgramRule::device(Char, 1, 5),
        ProgramRule::device(Char, 1, 7),
        // tty
        ProgramRule::device(Char, 5, 0),
        // urandom, random
        ProgramRule::device(Char, 1, 9),
        ProgramRule::device(Char, 1, 8),
        // console, ptmx
        ProgramRule::device(Char, 5, 1),
        ProgramRule::device(Char, 5, 2),
        // /dev/pts/*
        ProgramRule {
            kind: Some(Char),
            major: Some(136),
            minor: None,
            access: Access::all(),
            allow: true,
        },
        // tun
        ProgramRule::device(Char, 10, 200),
    ]
}

pub struct Program {
    prog: BpfCode,
}

#[derive(thiserror::Error, Debug)]
pub enum ProgramError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("device number {0} does not fit a device program")]
    DeviceNumber(i64),
}

impl Program {
    /// Builds a program where later rules take precedence over earlier ones
    /// and unmatched accesses get `default_allow`.
    pub fn from_rules(rules: &[ProgramRule], default_allow: bool) -> Self {
        let mut prog = Program {
            prog: BpfCode::new(),
        };
        prog.init();

        for rule in rules.iter().rev() {
            prog.add_rule(rule);
        }
        prog.finalize(default_allow);
        prog
    }

    pub fn bytecodes(&self) -> &[u8] {
        self.prog.into_bytes()
    }

    fn finalize(&mut self, default_allow: bool) {
        self.prog
            .mov(Source::Imm, RbpfArch::X32)
            .set_dst(0)
            .set_imm(default_allow as i32)
            .push();

        self.prog.exit().push();
    }

    // struct bpf_cgroup_dev_ctx { u32 access_type; u32 major; u32 minor; }
    // R2 <- type (lower 16 bit of access_type at R1[0])
    // R3 <- access (upper 16 bit of access_type at R1[0])
    // R4 <- major (R1[4])
    // R5 <- minor (R1[8])
    fn init(&mut self) {
        self.prog
            .load_x(MemSize::Word)
            .set_src(1)
            .set_off(0)
            .set_dst(2)
            .push();

        self.prog
            .bit_and(Source::Imm, RbpfArch::X32)
            .set_dst(2)
            .set_imm(0xFFFF)
            .push();

        self.prog
            .load_x(MemSize::Word)
            .set_src(1)
            .set_off(0)
            .set_dst(3)
            .push();

        self.prog
            .right_shift(Source::Imm, RbpfArch::X32)
            .set_imm(16)
            .set_dst(3)
            .push();

        self.prog
            .load_x(MemSize::Word)
            .set_src(1)
            .set_off(4)
            .set_dst(4)
            .push();

        self.prog
            .load_x(MemSize::Word)
            .set_src(1)
            .set_off(8)
            .set_dst(5)
            .push();
    }

    fn add_rule(&mut self, rule: &ProgramRule) {
        let access = bpf_access(rule.access);
        if access == 0 {
            return;
        }
        let has_access = access
            != (libbpf_sys::BPF_DEVCG_ACC_READ
                | libbpf_sys::BPF_DEVCG_ACC_WRITE
                | libbpf_sys::BPF_DEVCG_ACC_MKNOD);

        // the return pair, plus one jump per checked field
        let mut instruction_count: i16 = 2;
        if rule.kind.is_some() {
            instruction_count += 1;
        }
        if has_access {
            instruction_count += 3;
        }
        if rule.major.is_some() {
            instruction_count += 1;
        }
        if rule.minor.is_some() {
            instruction_count += 1;
        }

        // counts down with every emitted instruction, so a jump lands on the next rule
        let mut next_rule_offset = instruction_count;

        if let Some(kind) = rule.kind {
            next_rule_offset -= 1;
            // if (R2 != dev_type) goto next rule
            self.prog
                .jump_conditional(Cond::NotEquals, Source::Imm)
                .set_dst(2)
                .set_imm(bpf_dev_type(kind) as i32)
                .set_off(next_rule_offset)
                .push();
        }

        if has_access {
            next_rule_offset -= 3;
            // if (R3 & access != R3) goto next rule, R1 is free after init
            self.prog
                .mov(Source::Reg, RbpfArch::X32)
                .set_dst(1)
                .set_src(3)
                .push();

            self.prog
                .bit_and(Source::Imm, RbpfArch::X32)
                .set_dst(1)
                .set_imm(access as i32)
                .push();

            self.prog
                .jump_conditional(Cond::NotEquals, Source::Reg)
                .set_dst(1)
                .set_src(3)
                .set_off(next_rule_offset)
                .push();
        }

        if let Some(major) = rule.major {
            next_rule_offset -= 1;
            self.prog
                .jump_conditional(Cond::NotEquals, Source::Imm)
                .set_dst(4)
                .set_imm(major as i32)
                .set_off(next_rule_offset)
                .push();
        }

        if let Some(minor) = rule.minor {
            next_rule_offset -= 1;
            self.prog
                .jump_conditional(Cond::NotEquals, Source::Imm)
                .set_dst(5)
                .set_imm(minor as i32)
                .set_off(next_rule_offset)
                .push();
        }

        self.prog
            .mov(Source::Imm, RbpfArch::X32)
            .set_dst(0)
            .set_imm(rule.allow as i32)
            .push();
        self.prog.exit().push();
    }
}

fn bpf_dev_type(kind: DeviceKind) -> u32 {
    match kind {
        DeviceKind::Char => libbpf_sys::BPF_DEVCG_DEV_CHAR,
        DeviceKind::Block => libbpf_sys::BPF_DEVCG_DEV_BLOCK,
    }
}

fn bpf_access(access: Access) -> u32 {
    let mut v = 0_u32;
    for (flag, bit) in [
        (Access::READ, libbpf_sys::BPF_DEVCG_ACC_READ),
        (Access::WRITE, libbpf_sys::BPF_DEVCG_ACC_WRITE),
        (Access::MKNOD, libbpf_sys::BPF_DEVCG_ACC_MKNOD),
    ] {
        if access.contains(flag) {
            v |= bit;
        }
    }
    v
}

/// Runs program bytes the way the kernel would for one device access and
/// returns whether it was allowed.
#[cfg(test)]
pub(crate) fn evaluate(
    bytecodes: &[u8],
    kind: DeviceKind,
    major: u32,
    minor: u32,
    access: Access,
) -> Result<bool, ProgramError> {
    let type_access = (bpf_dev_type(kind) & 0xFFFF) | (bpf_access(access) << 16);

    let mut mem = Vec::with_capacity(12);
    mem.extend_from_slice(&type_access.to_ne_bytes());
    mem.extend_from_slice(&major.to_ne_bytes());
    mem.extend_from_slice(&minor.to_ne_bytes());

    let vm = rbpf::EbpfVmRaw::new(Some(bytecodes))?;
    Ok(vm.execute_program(&mut mem[..])? == 1)
}

#[cfg(test)]
impl Program {
    pub(crate) fn execute(
        &self,
        kind: DeviceKind,
        major: u32,
        minor: u32,
        access: Access,
    ) -> Result<bool, ProgramError> {
        evaluate(self.bytecodes(), kind, major, minor, access)
    }
}
