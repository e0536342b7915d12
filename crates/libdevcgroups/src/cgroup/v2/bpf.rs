use std::os::unix::io::RawFd;

const QUERY_ATTEMPTS: usize = 10;
const INITIAL_QUERY_CAPACITY: usize = 64;

/// A device program attached to a cgroup, opened through its id.
#[derive(Debug, Clone)]
pub struct AttachedProgram {
    pub id: u32,
    pub fd: RawFd,
}

#[derive(thiserror::Error, Debug)]
pub enum BpfError {
    #[error("failed to load device program: {0}")]
    Load(errno::Errno),
    #[error("failed to query attached device programs: {0}")]
    Query(errno::Errno),
    #[error("failed to attach device program: {0}")]
    Attach(errno::Errno),
    #[error("failed to detach device program: {0}")]
    Detach(errno::Errno),
    #[error("failed to increase rlimit")]
    FailedToIncreaseRLimit,
}

#[cfg_attr(test, automock)]
pub mod prog {
    use std::os::unix::io::RawFd;
    use std::ptr;

    use libbpf_sys::{bpf_insn, BPF_CGROUP_DEVICE, BPF_F_ALLOW_MULTI, BPF_PROG_TYPE_CGROUP_DEVICE};
    #[cfg(not(test))]
    use libbpf_sys::{
        bpf_prog_attach, bpf_prog_detach2, bpf_prog_get_fd_by_id, bpf_prog_load, bpf_prog_query,
    };
    #[cfg(not(test))]
    use libc::setrlimit;
    use libc::{rlimit, ENOSPC, RLIMIT_MEMLOCK};

    use super::{AttachedProgram, BpfError, INITIAL_QUERY_CAPACITY, QUERY_ATTEMPTS};
    #[cfg(test)]
    use crate::cgroup::v2::mocks::mock_libbpf_sys::{
        bpf_prog_attach, bpf_prog_detach2, bpf_prog_get_fd_by_id, bpf_prog_load, bpf_prog_query,
    };
    #[cfg(test)]
    use crate::cgroup::v2::mocks::mock_libc::setrlimit;

    pub fn load(license: &str, insns: &[u8]) -> Result<RawFd, BpfError> {
        let insns_cnt = insns.len() / std::mem::size_of::<bpf_insn>();
        let insns = insns as *const _ as *const bpf_insn;
        // libbpf rejects option structs whose size is not set
        let mut opts = libbpf_sys::bpf_prog_load_opts {
            sz: std::mem::size_of::<libbpf_sys::bpf_prog_load_opts>() as libbpf_sys::size_t,
            kern_version: 0,
            log_buf: ptr::null_mut::<::std::os::raw::c_char>(),
            log_size: 0,
            ..Default::default()
        };
        let license = std::ffi::CString::new(license)
            .map_err(|_| BpfError::Load(errno::Errno(libc::EINVAL)))?;

        #[allow(unused_unsafe)]
        let prog_fd = unsafe {
            bpf_prog_load(
                BPF_PROG_TYPE_CGROUP_DEVICE,
                ptr::null::<::std::os::raw::c_char>(),
                license.as_ptr(),
                insns,
                insns_cnt as libbpf_sys::size_t,
                &mut opts as *mut libbpf_sys::bpf_prog_load_opts,
            )
        };

        if prog_fd < 0 {
            return Err(BpfError::Load(errno::errno()));
        }
        Ok(prog_fd)
    }

    /// Opens every device program attached to the cgroup behind `cgroup_fd`.
    /// Programs that vanish between the query and the open are skipped.
    pub fn query(cgroup_fd: RawFd) -> Result<Vec<AttachedProgram>, BpfError> {
        let mut prog_ids: Vec<u32> = vec![0_u32; INITIAL_QUERY_CAPACITY];
        let mut attach_flags = 0_u32;
        let mut complete = false;
        for _ in 0..QUERY_ATTEMPTS {
            let mut prog_cnt = prog_ids.len() as u32;
            #[allow(unused_unsafe)]
            let ret = unsafe {
                bpf_prog_query(
                    cgroup_fd,
                    BPF_CGROUP_DEVICE,
                    0,
                    &mut attach_flags,
                    prog_ids.as_mut_ptr(),
                    &mut prog_cnt,
                )
            };
            if ret != 0 {
                let err = errno::errno();
                if err.0 == ENOSPC && prog_cnt as usize > prog_ids.len() {
                    // the kernel reports how many ids it has, grow and ask again
                    prog_ids.resize(prog_cnt as usize, 0);
                    continue;
                }

                return Err(BpfError::Query(err));
            }

            prog_ids.truncate(prog_cnt as usize);
            complete = true;
            break;
        }
        if !complete {
            return Err(BpfError::Query(errno::Errno(ENOSPC)));
        }

        let mut programs = Vec::with_capacity(prog_ids.len());
        for prog_id in &prog_ids {
            #[allow(unused_unsafe)]
            let prog_fd = unsafe { bpf_prog_get_fd_by_id(*prog_id) };
            if prog_fd < 0 {
                tracing::debug!("bpf_prog_get_fd_by_id({}) failed: {}", prog_id, errno::errno());
                continue;
            }
            programs.push(AttachedProgram {
                id: *prog_id,
                fd: prog_fd,
            });
        }
        Ok(programs)
    }

    pub fn attach(prog_fd: RawFd, cgroup_fd: RawFd) -> Result<(), BpfError> {
        #[allow(unused_unsafe)]
        let ret =
            unsafe { bpf_prog_attach(prog_fd, cgroup_fd, BPF_CGROUP_DEVICE, BPF_F_ALLOW_MULTI) };

        if ret != 0 {
            return Err(BpfError::Attach(errno::errno()));
        }
        Ok(())
    }

    pub fn detach(prog_fd: RawFd, cgroup_fd: RawFd) -> Result<(), BpfError> {
        #[allow(unused_unsafe)]
        let ret = unsafe { bpf_prog_detach2(prog_fd, cgroup_fd, BPF_CGROUP_DEVICE) };
        if ret != 0 {
            return Err(BpfError::Detach(errno::errno()));
        }
        Ok(())
    }

    /// Releases a program fd. An attached program stays referenced by its cgroup.
    pub fn close(fd: RawFd) {
        if let Err(err) = nix::unistd::close(fd) {
            tracing::debug!("failed to close program fd {}: {}", fd, err);
        }
    }

    pub fn bump_memlock_rlimit() -> Result<(), BpfError> {
        let rlimit = rlimit {
            rlim_cur: 128 << 20,
            rlim_max: 128 << 20,
        };

        #[allow(unused_unsafe)]
        if unsafe { setrlimit(RLIMIT_MEMLOCK, &rlimit) } != 0 {
            return Err(BpfError::FailedToIncreaseRLimit);
        }

        Ok(())
    }
}
