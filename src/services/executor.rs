//! 特权操作执行
//!
//! 执行前总是重新确认身份，pid 已被复用或进程已退出时返回 `TargetGone`。
//! 对已经满足要求的进程重复执行同一动作是无害的。

use log::debug;
use std::io;
use std::sync::Arc;

use crate::error::{ActionError, LookupError};
use crate::models::{MemoryRegion, PriorityLevel, ProcessIdentity, RuleAction};
use crate::services::identity::{IdentityResolver, ProcessInspector};

/// 特权操作端口
pub trait ActionExecutor: Send + Sync {
    fn apply(&self, identity: &ProcessIdentity, action: &RuleAction) -> Result<(), ActionError>;
}

const IOV_MAX: usize = 1024;

fn os_error(identity: &ProcessIdentity, err: io::Error) -> ActionError {
    match err.raw_os_error() {
        Some(libc::ESRCH) => ActionError::TargetGone(*identity),
        Some(libc::EPERM) | Some(libc::EACCES) => ActionError::PermissionDenied,
        Some(libc::ENOSYS) => ActionError::Unsupported(err.to_string()),
        Some(libc::EINVAL) => ActionError::Invalid(err.to_string()),
        _ => ActionError::Failed(err.to_string()),
    }
}

/// pidfd 固定住目标进程，之后的信号和 madvise 不会落到复用的 pid 上
struct PidFd(libc::c_int);

impl PidFd {
    fn open(identity: &ProcessIdentity) -> Result<Self, ActionError> {
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, identity.pid as libc::pid_t, 0) };
        if fd < 0 {
            return Err(os_error(identity, io::Error::last_os_error()));
        }
        Ok(PidFd(fd as libc::c_int))
    }
}

impl Drop for PidFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.0);
        }
    }
}

/// Linux 实现
pub struct LinuxActionExecutor {
    inspector: Arc<dyn ProcessInspector>,
}

impl LinuxActionExecutor {
    pub fn new(inspector: Arc<dyn ProcessInspector>) -> Self {
        Self { inspector }
    }

    fn revalidate(&self, identity: &ProcessIdentity) -> Result<(), ActionError> {
        self.inspector.revalidate(identity).map_err(|e| match e {
            LookupError::Unreadable { reason, .. } => ActionError::Failed(reason),
            LookupError::NotFound(_) | LookupError::Stale(_) => ActionError::TargetGone(*identity),
        })
    }

    /// 目标进程的所有线程；读不到时只处理主线程
    fn thread_ids(&self, identity: &ProcessIdentity) -> Vec<u32> {
        match self.inspector.threads(identity.pid) {
            Ok(tids) if !tids.is_empty() => tids,
            _ => vec![identity.pid],
        }
    }

    /// 对每个线程执行 op；主线程失败即整体失败，其它线程中途退出忽略
    fn for_each_thread<F>(&self, identity: &ProcessIdentity, op: F) -> Result<(), ActionError>
    where
        F: Fn(u32) -> libc::c_int,
    {
        for tid in self.thread_ids(identity) {
            if op(tid) == 0 {
                continue;
            }
            let err = io::Error::last_os_error();
            if tid != identity.pid && err.raw_os_error() == Some(libc::ESRCH) {
                debug!("Thread {} of {} exited during action", tid, identity);
                continue;
            }
            return Err(os_error(identity, err));
        }
        Ok(())
    }

    fn set_priority(&self, identity: &ProcessIdentity, level: PriorityLevel) -> Result<(), ActionError> {
        self.revalidate(identity)?;
        let nice = level.nice_value();
        // Linux 上 PRIO_PROCESS 只作用于单个线程
        self.for_each_thread(identity, |tid| unsafe {
            libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice)
        })
    }

    fn set_affinity(&self, identity: &ProcessIdentity, mask: u64) -> Result<(), ActionError> {
        if mask == 0 {
            return Err(ActionError::Invalid("empty affinity mask".to_string()));
        }
        self.revalidate(identity)?;

        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for cpu in 0..64usize {
            if mask & (1u64 << cpu) != 0 {
                unsafe { libc::CPU_SET(cpu, &mut set) };
            }
        }
        self.for_each_thread(identity, |tid| unsafe {
            libc::sched_setaffinity(
                tid as libc::pid_t,
                std::mem::size_of::<libc::cpu_set_t>(),
                &set,
            )
        })
    }

    fn empty_working_set(&self, identity: &ProcessIdentity) -> Result<(), ActionError> {
        self.revalidate(identity)?;
        let pidfd = PidFd::open(identity)?;
        // 打开 pidfd 之前进程可能已被替换
        self.revalidate(identity)?;

        let regions: Vec<MemoryRegion> = self
            .inspector
            .resources(identity.pid)
            .map_err(|_| ActionError::TargetGone(*identity))?
            .regions;
        let iovecs: Vec<libc::iovec> = regions
            .iter()
            .map(|r| libc::iovec {
                iov_base: r.base_address as *mut libc::c_void,
                iov_len: r.size as usize,
            })
            .collect();

        for chunk in iovecs.chunks(IOV_MAX) {
            let rc = unsafe {
                libc::syscall(
                    libc::SYS_process_madvise,
                    pidfd.0,
                    chunk.as_ptr(),
                    chunk.len(),
                    libc::MADV_PAGEOUT,
                    0u32,
                )
            };
            if rc < 0 {
                return Err(os_error(identity, io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    fn terminate(&self, identity: &ProcessIdentity) -> Result<(), ActionError> {
        self.revalidate(identity)?;
        let pidfd = PidFd::open(identity)?;
        // 打开 pidfd 之前进程可能已被替换
        self.revalidate(identity)?;

        let rc = unsafe {
            libc::syscall(
                libc::SYS_pidfd_send_signal,
                pidfd.0,
                libc::SIGKILL,
                std::ptr::null::<libc::siginfo_t>(),
                0u32,
            )
        };
        if rc < 0 {
            return Err(os_error(identity, io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl ActionExecutor for LinuxActionExecutor {
    fn apply(&self, identity: &ProcessIdentity, action: &RuleAction) -> Result<(), ActionError> {
        match action {
            RuleAction::ChangePriority { level } => self.set_priority(identity, *level),
            RuleAction::ChangeAffinity { mask } => self.set_affinity(identity, *mask),
            RuleAction::EmptyWorkingSet => self.empty_working_set(identity),
            RuleAction::TerminateProcess => self.terminate(identity),
        }
    }
}
