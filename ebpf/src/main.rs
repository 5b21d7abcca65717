#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{bpf_get_current_comm, bpf_get_current_pid_tgid, gen::bpf_ktime_get_boot_ns},
    macros::{map, tracepoint},
    maps::{HashMap, PerfEventArray},
    programs::TracePointContext,
};
use aya_log_ebpf::debug;

const KIND_EXEC: u32 = 1;
const KIND_FORK: u32 = 2;
const KIND_EXIT: u32 = 3;
const KIND_THREAD_START: u32 = 4;
const KIND_THREAD_EXIT: u32 = 5;
const KIND_MMAP_ANON: u32 = 6;
const KIND_MMAP_IMAGE: u32 = 7;
const KIND_MUNMAP: u32 = 8;
const KIND_FD_OPEN: u32 = 9;
const KIND_FD_CLOSE: u32 = 10;
const KIND_FD_DUP: u32 = 11;

const CLONE_THREAD: u64 = 0x0001_0000;
const PROT_EXEC: u64 = 0x4;
const MAP_PRIVATE: u64 = 0x02;
const MAP_ANONYMOUS: u64 = 0x20;

// syscalls 类 tracepoint 的参数从偏移 16 开始，每个 8 字节
const ARG0: usize = 16;
const ARG1: usize = 24;
const ARG2: usize = 32;
const ARG3: usize = 40;
const ARG4: usize = 48;
const RET: usize = 16;

// task_newtask: pid @8, comm[16] @12, clone_flags @32
const NEWTASK_PID: usize = 8;
const NEWTASK_FLAGS: usize = 32;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct LifecycleRecord {
    pub timestamp: u64,
    pub address: u64,
    pub length: u64,
    pub kind: u32,
    pub pid: u32,
    pub tid: u32,
    pub fd: i32,
    pub comm: [u8; 16],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct MmapArgs {
    pub length: u64,
    pub prot: u64,
    pub flags: u64,
    pub fd: i64,
}

#[map]
static EVENTS: PerfEventArray<LifecycleRecord> = PerfEventArray::new(0);

/// sys_enter_mmap 到 sys_exit_mmap 之间暂存参数，按 tid 索引
#[map]
static PENDING_MMAP: HashMap<u32, MmapArgs> = HashMap::with_max_entries(10240, 0);

fn current() -> (u32, u32) {
    let pid_tgid = bpf_get_current_pid_tgid();
    ((pid_tgid >> 32) as u32, (pid_tgid & 0xFFFFFFFF) as u32)
}

fn emit(ctx: &TracePointContext, kind: u32, pid: u32, tid: u32, fd: i32, address: u64, length: u64) {
    let record = LifecycleRecord {
        timestamp: unsafe { bpf_ktime_get_boot_ns() },
        address,
        length,
        kind,
        pid,
        tid,
        fd,
        comm: bpf_get_current_comm().unwrap_or([0u8; 16]),
    };
    EVENTS.output(ctx, &record, 0);
}

#[tracepoint]
pub fn sched_process_exec(ctx: TracePointContext) -> u32 {
    let (tgid, tid) = current();
    debug!(&ctx, "[EXEC] TGID={}", tgid);
    emit(&ctx, KIND_EXEC, tgid, tid, -1, 0, 0);
    0
}

#[tracepoint]
pub fn sched_process_exit(ctx: TracePointContext) -> u32 {
    let (tgid, tid) = current();
    if tgid == tid {
        emit(&ctx, KIND_EXIT, tgid, tid, -1, 0, 0);
    } else {
        emit(&ctx, KIND_THREAD_EXIT, tgid, tid, -1, 0, 0);
    }
    0
}

#[tracepoint]
pub fn task_newtask(ctx: TracePointContext) -> u32 {
    match try_task_newtask(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_task_newtask(ctx: &TracePointContext) -> Result<u32, i64> {
    let child: i32 = unsafe { ctx.read_at(NEWTASK_PID)? };
    let clone_flags: u64 = unsafe { ctx.read_at(NEWTASK_FLAGS)? };
    let (tgid, _) = current();

    if clone_flags & CLONE_THREAD != 0 {
        emit(ctx, KIND_THREAD_START, tgid, child as u32, -1, 0, 0);
    } else {
        // 新进程：此时 current 还是父进程
        emit(ctx, KIND_FORK, child as u32, child as u32, -1, 0, 0);
    }
    Ok(0)
}

#[tracepoint]
pub fn sys_enter_mmap(ctx: TracePointContext) -> u32 {
    match try_sys_enter_mmap(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_sys_enter_mmap(ctx: &TracePointContext) -> Result<u32, i64> {
    let (_, tid) = current();
    let args = MmapArgs {
        length: unsafe { ctx.read_at(ARG1)? },
        prot: unsafe { ctx.read_at(ARG2)? },
        flags: unsafe { ctx.read_at(ARG3)? },
        fd: unsafe { ctx.read_at(ARG4)? },
    };
    PENDING_MMAP.insert(&tid, &args, 0)?;
    Ok(0)
}

#[tracepoint]
pub fn sys_exit_mmap(ctx: TracePointContext) -> u32 {
    match try_sys_exit_mmap(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_sys_exit_mmap(ctx: &TracePointContext) -> Result<u32, i64> {
    let (tgid, tid) = current();
    let args = match unsafe { PENDING_MMAP.get(&tid) } {
        Some(args) => *args,
        None => return Ok(0),
    };
    let _ = PENDING_MMAP.remove(&tid);

    let ret: i64 = unsafe { ctx.read_at(RET)? };
    // 负数是错误码
    if ret < 0 {
        return Ok(0);
    }
    let address = ret as u64;

    if args.fd >= 0 && args.prot & PROT_EXEC != 0 {
        emit(ctx, KIND_MMAP_IMAGE, tgid, tid, args.fd as i32, address, args.length);
    } else if args.flags & MAP_ANONYMOUS != 0 && args.flags & MAP_PRIVATE != 0 {
        emit(ctx, KIND_MMAP_ANON, tgid, tid, -1, address, args.length);
    }
    Ok(0)
}

#[tracepoint]
pub fn sys_enter_munmap(ctx: TracePointContext) -> u32 {
    match try_sys_enter_munmap(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_sys_enter_munmap(ctx: &TracePointContext) -> Result<u32, i64> {
    let (tgid, tid) = current();
    let address: u64 = unsafe { ctx.read_at(ARG0)? };
    let length: u64 = unsafe { ctx.read_at(ARG1)? };
    emit(ctx, KIND_MUNMAP, tgid, tid, -1, address, length);
    Ok(0)
}

#[tracepoint]
pub fn sys_exit_openat(ctx: TracePointContext) -> u32 {
    match try_fd_returned(&ctx, KIND_FD_OPEN) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

#[tracepoint]
pub fn sys_exit_dup(ctx: TracePointContext) -> u32 {
    match try_fd_returned(&ctx, KIND_FD_DUP) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

/// 返回值是新 fd 的系统调用
fn try_fd_returned(ctx: &TracePointContext, kind: u32) -> Result<u32, i64> {
    let ret: i64 = unsafe { ctx.read_at(RET)? };
    if ret < 0 {
        return Ok(0);
    }
    let (tgid, tid) = current();
    emit(ctx, kind, tgid, tid, ret as i32, 0, 0);
    Ok(0)
}

#[tracepoint]
pub fn sys_enter_close(ctx: TracePointContext) -> u32 {
    match try_sys_enter_close(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_sys_enter_close(ctx: &TracePointContext) -> Result<u32, i64> {
    let fd: u64 = unsafe { ctx.read_at(ARG0)? };
    let (tgid, tid) = current();
    emit(ctx, KIND_FD_CLOSE, tgid, tid, fd as i32, 0, 0);
    Ok(0)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
