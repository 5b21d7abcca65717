use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

use process_watchdog::models::{EventKind, ProcessIdentity, RawEvent};
use process_watchdog::services::ingestor::{DropReason, IngestOutcome};
use process_watchdog::services::{ChangeHub, LifecycleIngestor, SnapshotStore};
use process_watchdog::testing::FakeResolver;

#[derive(Debug, Clone)]
enum Op {
    Start { pid: u32, created: u64 },
    Stop { pid: u32, ts: u64 },
    Thread { pid: u32, tid: u32, ts: u64 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..4, 1u64..50).prop_map(|(pid, created)| Op::Start { pid, created }),
        (1u32..4, 0u64..60).prop_map(|(pid, ts)| Op::Stop { pid, ts }),
        (1u32..4, 100u32..104, 0u64..60).prop_map(|(pid, tid, ts)| Op::Thread { pid, tid, ts }),
    ]
}

fn event(op: &Op) -> RawEvent {
    match *op {
        Op::Start { pid, created } => RawEvent::new(
            created,
            EventKind::ProcessStart {
                pid,
                creation_time: Some(created),
                image_name: format!("proc{}", pid),
                image_path: String::new(),
                command_line: String::new(),
            },
        ),
        Op::Stop { pid, ts } => RawEvent::new(ts, EventKind::ProcessStop { pid }),
        Op::Thread { pid, tid, ts } => RawEvent::new(ts, EventKind::ThreadStart { pid, tid }),
    }
}

fn ingestor() -> LifecycleIngestor {
    LifecycleIngestor::new(
        Arc::new(SnapshotStore::new()),
        Arc::new(FakeResolver::new()),
        ChangeHub::new(),
    )
}

proptest! {
    #[test]
    fn interleavings_keep_store_consistent(ops in prop::collection::vec(op(), 1..80)) {
        let ingestor = ingestor();
        let store = ingestor.store().clone();
        let mut removed: HashSet<ProcessIdentity> = HashSet::new();

        for op in &ops {
            let before: HashSet<ProcessIdentity> = store.identities().into_iter().collect();
            ingestor.handle(event(op));
            let after: HashSet<ProcessIdentity> = store.identities().into_iter().collect();

            removed.extend(before.difference(&after).copied());

            // 被移除的身份不会复活
            prop_assert!(after.is_disjoint(&removed));

            // 每个 pid 至多一个身份，且索引指向它
            let pids: HashSet<u32> = after.iter().map(|id| id.pid).collect();
            prop_assert_eq!(pids.len(), after.len());
            for identity in &after {
                prop_assert_eq!(store.identity_for_pid(identity.pid), Some(*identity));
                let snapshot = store.snapshot(identity).unwrap();
                prop_assert!(snapshot.last_updated >= identity.creation_time);
            }
        }
    }
}

/// 单个 pid 上的一次进程实例：若干线程，可能已经退出
#[derive(Debug, Clone)]
struct Incarnation {
    threads: u32,
    stopped: bool,
}

fn incarnations() -> impl Strategy<Value = Vec<Incarnation>> {
    prop::collection::vec((0u32..3, any::<bool>()), 1..4).prop_map(|raw| {
        let last = raw.len() - 1;
        raw.into_iter()
            .enumerate()
            // 只有最后一个实例可以还活着，之前的都已退出后 pid 才被复用
            .map(|(k, (threads, stopped))| Incarnation {
                threads,
                stopped: stopped || k < last,
            })
            .collect()
    })
}

/// 一个 pid 上按时间排序的事件
fn script(pid: u32, incarnations: &[Incarnation]) -> Vec<RawEvent> {
    let mut events = Vec::new();
    for (k, incarnation) in incarnations.iter().enumerate() {
        let created = pid as u64 * 1_000 + k as u64 * 100 + 1;
        events.push(event(&Op::Start { pid, created }));
        for t in 0..incarnation.threads {
            events.push(event(&Op::Thread {
                pid,
                tid: pid * 100 + t + 1,
                ts: created + 1 + t as u64,
            }));
        }
        if incarnation.stopped {
            events.push(event(&Op::Stop { pid, ts: created + 50 }));
        }
    }
    events
}

proptest! {
    #[test]
    fn store_holds_exactly_started_and_not_stopped(
        plans in prop::collection::vec(incarnations(), 3),
        picks in prop::collection::vec(any::<usize>(), 1..64),
    ) {
        let ingestor = ingestor();
        let store = ingestor.store().clone();
        let mut queues: Vec<std::collections::VecDeque<RawEvent>> = plans
            .iter()
            .enumerate()
            .map(|(i, plan)| script(i as u32 + 1, plan).into())
            .collect();
        let mut model: HashSet<ProcessIdentity> = HashSet::new();

        let mut step = 0;
        loop {
            let pending: Vec<usize> = (0..queues.len()).filter(|&q| !queues[q].is_empty()).collect();
            if pending.is_empty() {
                break;
            }
            let q = pending[picks[step % picks.len()] % pending.len()];
            step += 1;
            let Some(raw) = queues[q].pop_front() else { break };

            match &raw.kind {
                EventKind::ProcessStart { pid, creation_time: Some(created), .. } => {
                    model.insert(ProcessIdentity::new(*pid, *created));
                }
                EventKind::ProcessStop { pid } => {
                    model.retain(|id| id.pid != *pid);
                }
                _ => {}
            }
            ingestor.handle(raw);

            let tracked: HashSet<ProcessIdentity> = store.identities().into_iter().collect();
            prop_assert_eq!(&tracked, &model);
        }
    }
}

#[test]
fn pid_reuse_separates_incarnations() {
    let ingestor = ingestor();
    let start = |pid: u32, created: u64, name: &str| {
        RawEvent::new(
            created,
            EventKind::ProcessStart {
                pid,
                creation_time: Some(created),
                image_name: name.to_string(),
                image_path: String::new(),
                command_line: String::new(),
            },
        )
    };

    assert_eq!(ingestor.handle(start(10, 100, "first")), IngestOutcome::Applied);
    assert_eq!(
        ingestor.handle(RawEvent::new(150, EventKind::ThreadStart { pid: 10, tid: 11 })),
        IngestOutcome::Applied
    );

    // 第一个实例的退出事件丢了，pid 被复用
    assert_eq!(ingestor.handle(start(10, 200, "second")), IngestOutcome::Applied);
    let second = ProcessIdentity::new(10, 200);
    let store = ingestor.store();
    assert_eq!(store.identity_for_pid(10), Some(second));
    assert!(!store.contains(&ProcessIdentity::new(10, 100)));

    // 旧实例迟到的事件不能污染新实例
    assert_eq!(
        ingestor.handle(RawEvent::new(180, EventKind::ThreadStart { pid: 10, tid: 12 })),
        IngestOutcome::Dropped(DropReason::StaleIncarnation)
    );
    assert_eq!(
        ingestor.handle(RawEvent::new(190, EventKind::ProcessStop { pid: 10 })),
        IngestOutcome::Dropped(DropReason::StaleIncarnation)
    );
    assert_eq!(
        ingestor.handle(start(10, 100, "first")),
        IngestOutcome::Dropped(DropReason::AlreadyRemoved)
    );

    let snapshot = store.snapshot(&second).unwrap();
    assert_eq!(snapshot.metadata.name, "second");
    assert_eq!(snapshot.threads.iter().copied().collect::<Vec<_>>(), vec![10]);

    assert_eq!(
        ingestor.handle(RawEvent::new(250, EventKind::ProcessStop { pid: 10 })),
        IngestOutcome::Applied
    );
    assert!(store.is_empty());
}
