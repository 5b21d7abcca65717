//! 基于 /proc 的身份解析与资源读取
//!
//! 创建时间取自 `/proc/<pid>/stat` 第 22 个字段（开机后的时钟节拍），
//! 换算成纳秒后与 eBPF 的 `bpf_ktime_get_boot_ns` 处于同一时钟域。

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::LookupError;
use crate::models::{
    LoadedModule, MemoryRegion, OpenHandle, ProcessIdentity, ProcessMetadata, ResourceSet,
};
use crate::services::identity::{IdentityResolver, ProcessInspector};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// 系统时钟节拍（USER_HZ）
pub fn clk_tck() -> u64 {
    static CLK_TCK: OnceLock<u64> = OnceLock::new();
    *CLK_TCK.get_or_init(|| {
        let tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
        if tck > 0 {
            tck as u64
        } else {
            100
        }
    })
}

/// 当前 CLOCK_BOOTTIME（纳秒）
pub fn boot_clock_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
    if rc != 0 {
        return 0;
    }
    ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
}

fn ticks_to_ns(ticks: u64) -> u64 {
    ticks.saturating_mul(NANOS_PER_SEC) / clk_tck()
}

/// 解析 stat 内容，返回 (comm, starttime ticks)
///
/// 格式: pid (comm) state ppid ...，comm 中可能含空格和括号
pub fn parse_stat(content: &str) -> Option<(String, u64)> {
    let open = content.find('(')?;
    let close = content.rfind(')')?;
    if close <= open {
        return None;
    }
    let comm = content[open + 1..close].to_string();
    let rest = content.get(close + 2..)?;
    // rest 从第 3 个字段 (state) 开始，starttime 是第 22 个字段
    let starttime = rest.split_whitespace().nth(19)?.parse::<u64>().ok()?;
    Some((comm, starttime))
}

/// 解析 maps 的一行: start-end perms offset dev inode [path]
fn parse_maps_line(line: &str) -> Option<(u64, u64, &str, Option<&str>)> {
    let mut fields = line.splitn(6, char::is_whitespace);
    let range = fields.next()?;
    let perms = fields.next()?;
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next().map(str::trim).filter(|p| !p.is_empty());

    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    if end < start {
        return None;
    }
    Some((start, end, perms, path))
}

/// 从 maps 中提取模块（带可执行映射的文件）和匿名私有内存区域
pub fn parse_maps(content: &str) -> (Vec<LoadedModule>, Vec<MemoryRegion>) {
    // path -> (min start, max end, 是否有可执行映射)
    let mut images: HashMap<&str, (u64, u64, bool)> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    let mut regions = Vec::new();

    for line in content.lines() {
        let Some((start, end, perms, path)) = parse_maps_line(line) else {
            continue;
        };
        match path {
            Some(p) if p.starts_with('/') => {
                let entry = images.entry(p).or_insert_with(|| {
                    order.push(p);
                    (start, end, false)
                });
                entry.0 = entry.0.min(start);
                entry.1 = entry.1.max(end);
                entry.2 |= perms.contains('x');
            }
            Some(p) if p.starts_with('[') && p != "[heap]" && p != "[stack]" => {}
            _ => {
                if perms.ends_with('p') {
                    regions.push(MemoryRegion {
                        base_address: start,
                        size: end - start,
                    });
                }
            }
        }
    }

    let modules = order
        .into_iter()
        .filter_map(|path| {
            let (start, end, executable) = images.get(path)?;
            executable.then(|| LoadedModule {
                path: path.to_string(),
                base_address: *start,
                size: end - start,
            })
        })
        .collect();

    (modules, regions)
}

/// 根据 fd 链接目标构造句柄
pub fn handle_from_link(fd: u64, target: &str) -> OpenHandle {
    let (handle_type, object_address) = if target.starts_with('/') {
        ("file", 0)
    } else if let Some((kind, rest)) = target.split_once(':') {
        let inode = rest
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<u64>()
            .unwrap_or(0);
        (kind, inode)
    } else {
        ("other", 0)
    };
    OpenHandle {
        value: fd,
        handle_type: handle_type.to_string(),
        object_address,
        name: target.to_string(),
    }
}

/// /proc 实现
#[derive(Debug, Clone)]
pub struct ProcfsInspector {
    root: PathBuf,
}

impl ProcfsInspector {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// 指定 proc 根目录（测试用）
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn pid_path(&self, pid: u32, entry: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(entry)
    }

    fn read(&self, pid: u32, entry: &str) -> Result<String, LookupError> {
        fs::read_to_string(self.pid_path(pid, entry)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LookupError::NotFound(pid),
            _ => LookupError::unreadable(pid, e.to_string()),
        })
    }

    fn read_numeric_dir(&self, path: &Path, pid: u32) -> Result<Vec<u64>, LookupError> {
        let entries = fs::read_dir(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => LookupError::NotFound(pid),
            _ => LookupError::unreadable(pid, e.to_string()),
        })?;
        let mut values: Vec<u64> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u64>().ok())
            .collect();
        values.sort_unstable();
        Ok(values)
    }

    fn handles(&self, pid: u32) -> Result<Vec<OpenHandle>, LookupError> {
        let dir = self.pid_path(pid, "fd");
        let fds = self.read_numeric_dir(&dir, pid)?;
        Ok(fds
            .into_iter()
            .filter_map(|fd| {
                let target = fs::read_link(dir.join(fd.to_string())).ok()?;
                Some(handle_from_link(fd, &target.to_string_lossy()))
            })
            .collect())
    }

    /// fd 当前指向的对象（文件路径、socket:[inode] 等）
    pub fn fd_target(&self, pid: u32, fd: u64) -> Option<String> {
        let link = fs::read_link(self.pid_path(pid, "fd").join(fd.to_string())).ok()?;
        Some(link.to_string_lossy().into_owned())
    }
}

impl Default for ProcfsInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityResolver for ProcfsInspector {
    fn resolve(&self, pid: u32) -> Result<ProcessIdentity, LookupError> {
        let stat = self.read(pid, "stat")?;
        let (_, starttime) =
            parse_stat(&stat).ok_or_else(|| LookupError::unreadable(pid, "malformed stat"))?;
        Ok(ProcessIdentity::new(pid, ticks_to_ns(starttime)))
    }
}

impl ProcessInspector for ProcfsInspector {
    fn list_pids(&self) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut pids: Vec<u32> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .collect();
        pids.sort_unstable();
        pids
    }

    fn metadata(&self, pid: u32) -> Result<ProcessMetadata, LookupError> {
        let comm = self.read(pid, "comm")?.trim().to_string();
        let image_path = fs::read_link(self.pid_path(pid, "exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        // comm 最多 15 个字符，能读到 exe 时以文件名为准
        let name = Path::new(&image_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or(comm);
        let command_line = self
            .read(pid, "cmdline")
            .map(|raw| {
                raw.split('\0')
                    .filter(|s| !s.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        Ok(ProcessMetadata {
            name,
            image_path,
            command_line,
        })
    }

    fn threads(&self, pid: u32) -> Result<Vec<u32>, LookupError> {
        let tids = self.read_numeric_dir(&self.pid_path(pid, "task"), pid)?;
        Ok(tids.into_iter().map(|tid| tid as u32).collect())
    }

    fn resources(&self, pid: u32) -> Result<ResourceSet, LookupError> {
        let threads = self.threads(pid)?;
        let (modules, regions) = parse_maps(&self.read(pid, "maps")?);
        // 没有权限读 fd 目录时只返回空集合
        let handles = match self.handles(pid) {
            Ok(handles) => handles,
            Err(LookupError::NotFound(pid)) => return Err(LookupError::NotFound(pid)),
            Err(_) => Vec::new(),
        };
        Ok(ResourceSet {
            threads,
            modules,
            handles,
            regions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT: &str = "4242 (my (odd) proc) S 1 4242 4242 0 -1 4194560 1197 0 0 0 \
                        12 5 0 0 20 0 3 0 987654 10305536 1320 18446744073709551615";

    #[test]
    fn test_parse_stat_handles_parens_in_comm() {
        let (comm, starttime) = parse_stat(STAT).unwrap();
        assert_eq!(comm, "my (odd) proc");
        assert_eq!(starttime, 987654);
    }

    #[test]
    fn test_parse_stat_rejects_truncated() {
        assert!(parse_stat("12 (x) S 1 2").is_none());
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn test_parse_maps() {
        let maps = "\
55d0c0a00000-55d0c0a02000 r--p 00000000 08:01 131 /usr/bin/app
55d0c0a02000-55d0c0a08000 r-xp 00002000 08:01 131 /usr/bin/app
55d0c1c00000-55d0c1c21000 rw-p 00000000 00:00 0 [heap]
7f1a00000000-7f1a00021000 rw-p 00000000 00:00 0
7f1a10000000-7f1a10010000 r--p 00000000 08:01 99 /usr/share/locale/data.mo
7f1a20000000-7f1a20002000 r-xp 00000000 00:00 0 [vdso]";
        let (modules, regions) = parse_maps(maps);
        assert_eq!(
            modules,
            vec![LoadedModule {
                path: "/usr/bin/app".into(),
                base_address: 0x55d0c0a00000,
                size: 0x8000,
            }]
        );
        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].base_address, 0x55d0c1c00000);
        assert_eq!(regions[1].size, 0x21000);
    }

    #[test]
    fn test_handle_from_link() {
        let socket = handle_from_link(3, "socket:[12345]");
        assert_eq!(socket.handle_type, "socket");
        assert_eq!(socket.object_address, 12345);

        let file = handle_from_link(4, "/var/log/app.log");
        assert_eq!(file.handle_type, "file");
        assert_eq!(file.name, "/var/log/app.log");

        let anon = handle_from_link(5, "anon_inode:[eventfd]");
        assert_eq!(anon.handle_type, "anon_inode");
        assert_eq!(anon.object_address, 0);
    }

    #[test]
    fn test_resolve_current_process() {
        let inspector = ProcfsInspector::new();
        let pid = std::process::id();
        let identity = inspector.resolve(pid).unwrap();
        assert_eq!(identity.pid, pid);
        assert!(identity.creation_time <= boot_clock_ns());
        assert!(inspector.is_current(&identity));
        assert!(!inspector.is_current(&ProcessIdentity::new(pid, identity.creation_time + 1)));
    }

    #[test]
    fn test_missing_process_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let inspector = ProcfsInspector::with_root(dir.path());
        assert_eq!(inspector.resolve(77), Err(LookupError::NotFound(77)));
        assert!(inspector.list_pids().is_empty());
    }

    #[test]
    fn test_fake_proc_tree() {
        let dir = tempfile::tempdir().unwrap();
        let proc_dir = dir.path().join("321");
        fs::create_dir_all(proc_dir.join("task/321")).unwrap();
        fs::create_dir_all(proc_dir.join("task/322")).unwrap();
        fs::write(proc_dir.join("stat"), STAT.replace("4242 (", "321 (")).unwrap();
        fs::write(proc_dir.join("comm"), "worker\n").unwrap();
        fs::write(proc_dir.join("cmdline"), "worker\0--fast\0").unwrap();

        let inspector = ProcfsInspector::with_root(dir.path());
        assert_eq!(inspector.list_pids(), vec![321]);
        assert_eq!(inspector.threads(321).unwrap(), vec![321, 322]);

        let metadata = inspector.metadata(321).unwrap();
        assert_eq!(metadata.name, "worker");
        assert_eq!(metadata.command_line, "worker --fast");

        let enumerated = inspector.enumerate();
        assert_eq!(enumerated.len(), 1);
        assert_eq!(enumerated[0].0.creation_time, ticks_to_ns(987654));
    }
}
