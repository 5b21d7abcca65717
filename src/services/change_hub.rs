use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crate::models::{ProcessIdentity, StoreChange};

pub type ChangeHandler = Arc<dyn Fn(&StoreChange) + Send + Sync>;

struct Registration {
    filter: Option<ProcessIdentity>,
    handler: ChangeHandler,
}

#[derive(Default)]
struct HubInner {
    handlers: DashMap<u64, Registration>,
    next_id: AtomicU64,
}

/// 变更通知中心
///
/// `subscribe` 返回 `Subscription`，持有者 drop 之后处理器自动解除注册。
#[derive(Clone, Default)]
pub struct ChangeHub {
    inner: Arc<HubInner>,
}

impl ChangeHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器；`filter` 为 Some 时只接收该身份的变更
    pub fn subscribe(&self, filter: Option<ProcessIdentity>, handler: ChangeHandler) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .handlers
            .insert(id, Registration { filter, handler });
        Subscription {
            id,
            filter,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// 分发变更；先复制处理器列表再调用，处理器内部可以安全地订阅或退订
    pub fn publish(&self, change: &StoreChange) {
        let targets: Vec<ChangeHandler> = self
            .inner
            .handlers
            .iter()
            .filter(|entry| match entry.filter {
                Some(identity) => identity == change.identity,
                None => true,
            })
            .map(|entry| entry.handler.clone())
            .collect();

        for handler in targets {
            handler(change);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.len()
    }
}

/// 订阅凭证
#[must_use = "dropping the subscription detaches the handler"]
pub struct Subscription {
    id: u64,
    filter: Option<ProcessIdentity>,
    hub: Weak<HubInner>,
}

impl Subscription {
    pub fn filter(&self) -> Option<ProcessIdentity> {
        self.filter
    }

    /// 显式解除注册
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.handlers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChangeKind;
    use std::sync::atomic::AtomicUsize;

    fn change(pid: u32) -> StoreChange {
        StoreChange {
            identity: ProcessIdentity::new(pid, 1),
            change: ChangeKind::ProcessAdded,
        }
    }

    fn counter() -> (Arc<AtomicUsize>, ChangeHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handler: ChangeHandler = Arc::new(move |_: &StoreChange| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, handler)
    }

    #[test]
    fn test_filtered_subscription() {
        let hub = ChangeHub::new();
        let (all, all_handler) = counter();
        let (one, one_handler) = counter();
        let _all = hub.subscribe(None, all_handler);
        let _one = hub.subscribe(Some(ProcessIdentity::new(1, 1)), one_handler);

        hub.publish(&change(1));
        hub.publish(&change(2));

        assert_eq!(all.load(Ordering::SeqCst), 2);
        assert_eq!(one.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_detaches_only_that_handler() {
        let hub = ChangeHub::new();
        let (first, first_handler) = counter();
        let (second, second_handler) = counter();
        let sub_first = hub.subscribe(None, first_handler);
        let _sub_second = hub.subscribe(None, second_handler);

        drop(sub_first);
        hub.publish(&change(1));

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_handler_may_subscribe_during_publish() {
        let hub = ChangeHub::new();
        let inner_hub = hub.clone();
        let held = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let held_clone = held.clone();
        let _sub = hub.subscribe(
            None,
            Arc::new(move |_: &StoreChange| {
                let sub = inner_hub.subscribe(None, Arc::new(|_: &StoreChange| {}));
                held_clone.lock().push(sub);
            }),
        );

        hub.publish(&change(1));
        assert_eq!(hub.subscriber_count(), 2);
    }
}
