use crate::error::LookupError;
use crate::models::{ProcessIdentity, ProcessMetadata, ResourceSet};

/// 身份解析：pid -> (pid, 创建时间)
///
/// 每次调用都重新查询 OS，进程已退出时返回 `LookupError::NotFound`。
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, pid: u32) -> Result<ProcessIdentity, LookupError>;

    /// 该身份是否仍对应同一个存活进程（pid 未被复用）
    fn is_current(&self, identity: &ProcessIdentity) -> bool {
        matches!(self.resolve(identity.pid), Ok(current) if current == *identity)
    }

    /// 解析并确认与期望的身份一致
    fn revalidate(&self, identity: &ProcessIdentity) -> Result<(), LookupError> {
        let current = self.resolve(identity.pid)?;
        if current == *identity {
            Ok(())
        } else {
            Err(LookupError::Stale(*identity))
        }
    }
}

/// 进程枚举与资源读取（对账、轮询事件源使用）
pub trait ProcessInspector: IdentityResolver {
    /// 当前所有存活进程的 pid
    fn list_pids(&self) -> Vec<u32>;

    fn metadata(&self, pid: u32) -> Result<ProcessMetadata, LookupError>;

    fn threads(&self, pid: u32) -> Result<Vec<u32>, LookupError>;

    /// 完整读取线程、模块、句柄、内存区域
    fn resources(&self, pid: u32) -> Result<ResourceSet, LookupError>;

    /// 枚举所有可解析的存活进程
    fn enumerate(&self) -> Vec<(ProcessIdentity, ProcessMetadata)> {
        self.list_pids()
            .into_iter()
            .filter_map(|pid| {
                let identity = self.resolve(pid).ok()?;
                let metadata = self.metadata(pid).ok()?;
                Some((identity, metadata))
            })
            .collect()
    }
}
