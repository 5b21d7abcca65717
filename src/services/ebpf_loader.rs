use anyhow::Context;
use aya::{
    maps::perf::AsyncPerfEventArray,
    programs::TracePoint,
    util::online_cpus,
    Ebpf,
};
use aya_log::EbpfLogger;
use bytes::BytesMut;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::SourceError;
use crate::models::{EventKind, ProcessMetadata, RawEvent};
use crate::services::event_source::EventSource;
use crate::services::identity::ProcessInspector;
use crate::services::ingestor::LifecycleIngestor;
use crate::services::procfs::{handle_from_link, ProcfsInspector};

pub const DEFAULT_EBPF_OBJECT: &str = "ebpf/target/bpfel-unknown-none/release/lifecycle-monitor";

/// 每个 CPU 的读缓冲数量
const BUFFER_COUNT: usize = 16;

/// 读者与解码线程之间的队列长度，满了读者就等待
const RECORD_QUEUE: usize = 4096;

/// (程序名, tracepoint 类别, tracepoint 名)
const TRACEPOINTS: &[(&str, &str, &str)] = &[
    ("sched_process_exec", "sched", "sched_process_exec"),
    ("sched_process_exit", "sched", "sched_process_exit"),
    ("task_newtask", "task", "task_newtask"),
    ("sys_enter_mmap", "syscalls", "sys_enter_mmap"),
    ("sys_exit_mmap", "syscalls", "sys_exit_mmap"),
    ("sys_enter_munmap", "syscalls", "sys_enter_munmap"),
    ("sys_exit_openat", "syscalls", "sys_exit_openat"),
    ("sys_enter_close", "syscalls", "sys_enter_close"),
    ("sys_exit_dup", "syscalls", "sys_exit_dup"),
];

pub const KIND_EXEC: u32 = 1;
pub const KIND_FORK: u32 = 2;
pub const KIND_EXIT: u32 = 3;
pub const KIND_THREAD_START: u32 = 4;
pub const KIND_THREAD_EXIT: u32 = 5;
pub const KIND_MMAP_ANON: u32 = 6;
pub const KIND_MMAP_IMAGE: u32 = 7;
pub const KIND_MUNMAP: u32 = 8;
pub const KIND_FD_OPEN: u32 = 9;
pub const KIND_FD_CLOSE: u32 = 10;
pub const KIND_FD_DUP: u32 = 11;

/// 内核程序通过 perf buffer 发出的记录，布局与 ebpf crate 中的定义一致
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleRecord {
    /// bpf_ktime_get_boot_ns
    pub timestamp: u64,
    pub address: u64,
    pub length: u64,
    pub kind: u32,
    /// tgid
    pub pid: u32,
    pub tid: u32,
    pub fd: i32,
    pub comm: [u8; 16],
}

unsafe impl aya::Pod for LifecycleRecord {}

impl LifecycleRecord {
    pub fn from_bytes(buf: &[u8]) -> Option<Self> {
        if buf.len() < std::mem::size_of::<Self>() {
            return None;
        }
        Some(unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const Self) })
    }

    pub fn comm(&self) -> String {
        let end = self.comm.iter().position(|b| *b == 0).unwrap_or(self.comm.len());
        String::from_utf8_lossy(&self.comm[..end]).into_owned()
    }
}

/// 把内核记录转换成原始事件；fd 和映射的目标路径从 /proc 补全
pub fn decode(record: &LifecycleRecord, procfs: &ProcfsInspector) -> Option<RawEvent> {
    let pid = record.pid;
    let kind = match record.kind {
        KIND_EXEC | KIND_FORK => {
            let metadata = procfs
                .metadata(pid)
                .unwrap_or_else(|_| ProcessMetadata::new(record.comm()));
            EventKind::ProcessStart {
                pid,
                creation_time: None,
                image_name: metadata.name,
                image_path: metadata.image_path,
                command_line: metadata.command_line,
            }
        }
        KIND_EXIT => EventKind::ProcessStop { pid },
        KIND_THREAD_START => EventKind::ThreadStart { pid, tid: record.tid },
        KIND_THREAD_EXIT => EventKind::ThreadStop { pid, tid: record.tid },
        KIND_MMAP_ANON => EventKind::VirtualAlloc {
            pid,
            base: record.address,
            size: record.length,
        },
        KIND_MMAP_IMAGE => EventKind::ImageLoad {
            pid,
            path: procfs.fd_target(pid, u64::try_from(record.fd).ok()?)?,
            base: record.address,
            size: record.length,
        },
        KIND_MUNMAP => EventKind::VirtualFree {
            pid,
            base: record.address,
        },
        KIND_FD_OPEN => {
            let fd = u64::try_from(record.fd).ok()?;
            let handle = handle_from_link(fd, &procfs.fd_target(pid, fd).unwrap_or_default());
            EventKind::HandleCreate {
                pid: Some(pid),
                handle: fd,
                object: handle.object_address,
                name: handle.name,
            }
        }
        KIND_FD_CLOSE => EventKind::HandleClose {
            pid: Some(pid),
            handle: u64::try_from(record.fd).ok()?,
        },
        KIND_FD_DUP => {
            let fd = u64::try_from(record.fd).ok()?;
            let handle = handle_from_link(fd, &procfs.fd_target(pid, fd).unwrap_or_default());
            EventKind::HandleDuplicate {
                source_pid: pid,
                target_pid: pid,
                handle: fd,
                object: handle.object_address,
                name: handle.name,
            }
        }
        other => {
            debug!("Unknown lifecycle record kind {}", other);
            return None;
        }
    };
    Some(RawEvent::new(record.timestamp, kind))
}

/// 在阻塞线程里解码并入库，直到所有读者退出；返回入库的事件数
pub fn drain(
    mut records: mpsc::Receiver<LifecycleRecord>,
    procfs: &ProcfsInspector,
    ingestor: &LifecycleIngestor,
) -> usize {
    let mut handled = 0;
    while let Some(record) = records.blocking_recv() {
        if let Some(event) = decode(&record, procfs) {
            ingestor.handle(event);
            handled += 1;
        }
    }
    handled
}

/// eBPF tracepoint 事件源
pub struct EbpfEventSource {
    object_path: PathBuf,
    procfs: Arc<ProcfsInspector>,
}

impl EbpfEventSource {
    pub fn new<P: Into<PathBuf>>(object_path: P, procfs: Arc<ProcfsInspector>) -> Self {
        Self {
            object_path: object_path.into(),
            procfs,
        }
    }

    fn load(&self) -> anyhow::Result<Ebpf> {
        let mut ebpf = Ebpf::load_file(&self.object_path)
            .with_context(|| format!("Failed to load eBPF object {}", self.object_path.display()))?;

        if let Err(e) = EbpfLogger::init(&mut ebpf) {
            warn!("Failed to init eBPF logger: {}", e);
        } else {
            info!("✓ eBPF logger initialized");
        }

        for (name, category, tracepoint) in TRACEPOINTS {
            let program: &mut TracePoint = ebpf
                .program_mut(name)
                .ok_or_else(|| anyhow::anyhow!("{} program not found", name))?
                .try_into()
                .map_err(|e| anyhow::anyhow!("Failed to convert {} to TracePoint: {:?}", name, e))?;

            program
                .load()
                .with_context(|| format!("Failed to load {}", name))?;
            program
                .attach(category, tracepoint)
                .with_context(|| format!("Failed to attach {}/{}", category, tracepoint))?;
            info!("✓ Attached tracepoint: {}/{}", category, tracepoint);
        }

        Ok(ebpf)
    }

    /// 读者只拷贝记录，读 /proc 的解码放到阻塞线程上
    fn open_readers(
        &self,
        ebpf: &mut Ebpf,
        ingestor: Arc<LifecycleIngestor>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<(Vec<JoinHandle<()>>, JoinHandle<usize>)> {
        let map = ebpf
            .take_map("EVENTS")
            .ok_or_else(|| anyhow::anyhow!("EVENTS map not found"))?;
        let mut events = AsyncPerfEventArray::try_from(map).context("EVENTS is not a perf event array")?;
        let cpus = online_cpus().map_err(|(path, e)| anyhow::anyhow!("Failed to read {}: {}", path, e))?;

        let (tx, rx) = mpsc::channel(RECORD_QUEUE);
        let mut readers = Vec::with_capacity(cpus.len());
        for cpu in cpus {
            let mut buf = events
                .open(cpu, None)
                .with_context(|| format!("Failed to open perf buffer on CPU {}", cpu))?;
            let tx = tx.clone();
            let mut shutdown = shutdown.clone();

            readers.push(tokio::spawn(async move {
                let mut buffers = (0..BUFFER_COUNT)
                    .map(|_| BytesMut::with_capacity(std::mem::size_of::<LifecycleRecord>()))
                    .collect::<Vec<_>>();
                loop {
                    tokio::select! {
                        result = buf.read_events(&mut buffers) => {
                            let batch = match result {
                                Ok(batch) => batch,
                                Err(e) => {
                                    warn!("Perf buffer on CPU {} failed: {}", cpu, e);
                                    break;
                                }
                            };
                            if batch.lost > 0 {
                                debug!("Lost {} lifecycle records on CPU {}", batch.lost, cpu);
                            }
                            for raw in buffers.iter().take(batch.read) {
                                let Some(record) = LifecycleRecord::from_bytes(raw) else {
                                    continue;
                                };
                                if tx.send(record).await.is_err() {
                                    return;
                                }
                            }
                        }
                        _ = shutdown.changed() => break,
                    }
                }
            }));
        }
        // 只剩读者持有发送端，读者全退出后解码线程自然结束
        drop(tx);

        let procfs = self.procfs.clone();
        let worker = tokio::task::spawn_blocking(move || drain(rx, &procfs, &ingestor));
        Ok((readers, worker))
    }
}

impl EventSource for EbpfEventSource {
    fn name(&self) -> &'static str {
        "ebpf"
    }

    fn start(
        &self,
        ingestor: Arc<LifecycleIngestor>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, SourceError> {
        let mut ebpf = self.load().map_err(SourceError::Unavailable)?;
        let (readers, worker) = self
            .open_readers(&mut ebpf, ingestor, shutdown)
            .map_err(SourceError::Unavailable)?;
        info!("🎉 eBPF event source started on {} CPUs", readers.len());

        Ok(tokio::spawn(async move {
            // 程序随 Ebpf 一起卸载，读者全部退出后再释放
            let _ebpf = ebpf;
            for reader in readers {
                let _ = reader.await;
            }
            match worker.await {
                Ok(handled) => info!("eBPF event source stopped after {} events", handled),
                Err(e) => warn!("eBPF decode worker failed: {}", e),
            }
        }))
    }
}
