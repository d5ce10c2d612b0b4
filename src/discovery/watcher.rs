//! Watcher 注册表与扇出投递
//!
//! 每个注册的 Watcher 都有一个由解析器持有的有界邮箱和一个独立的投递任务：
//! - 扇出时对每个邮箱 `try_send`，邮箱已满则丢弃本次投递并计数，从不等待
//! - 投递任务按顺序调用 `update_state`，同一个 Watcher 收到的版本号严格递增
//! - 一个慢 Watcher 只会堵住自己的邮箱，不影响其它 Watcher

use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::discovery::endpoint::State;
use crate::metrics::ResolverMetrics;

/// 快照消费者（负载均衡器、连接池等）
///
/// 只有副作用，没有返回值，不应长时间阻塞。同一个实例可以注册到多个服务下，
/// 因此必须能够被多个服务的投递任务并发调用。
pub trait Watcher: Send + Sync {
    fn update_state(&self, state: Arc<State>);
}

impl<F> Watcher for F
where
    F: Fn(Arc<State>) + Send + Sync,
{
    fn update_state(&self, state: Arc<State>) {
        self(state)
    }
}

/// 按指针判断是否为同一个 Watcher
pub(crate) fn same_watcher(a: &Arc<dyn Watcher>, b: &Arc<dyn Watcher>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// 一次扇出的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub dropped: usize,
}

struct Registration {
    watcher: Arc<dyn Watcher>,
    mailbox: mpsc::Sender<Arc<State>>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RegistryInner {
    registrations: Vec<Registration>,
    current: Option<Arc<State>>,
}

/// 单个服务的 Watcher 注册表
///
/// 注册、注销和扇出都在同一把锁下进行，扇出不会遍历一个正在变化的集合。
/// 锁内只做 `try_send`，不会等待任何 Watcher。
pub struct WatcherRegistry {
    service: String,
    inner: Mutex<RegistryInner>,
    metrics: Arc<ResolverMetrics>,
    mailbox_capacity: usize,
    cancel: CancellationToken,
}

impl WatcherRegistry {
    pub fn new(
        service: impl Into<String>,
        mailbox_capacity: usize,
        metrics: Arc<ResolverMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            service: service.into(),
            inner: Mutex::new(RegistryInner::default()),
            metrics,
            mailbox_capacity: mailbox_capacity.max(1),
            cancel,
        }
    }

    /// 以已有快照初始化，新注册的 Watcher 会先收到它
    pub fn with_current(mut self, current: Option<Arc<State>>) -> Self {
        self.inner.get_mut().current = current;
        self
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// 注册 Watcher，已注册时返回 `false`
    ///
    /// 如果服务已经有快照，新 Watcher 会立即收到当前快照。
    pub async fn add(&self, watcher: Arc<dyn Watcher>) -> bool {
        let mut inner = self.inner.lock().await;
        if inner
            .registrations
            .iter()
            .any(|r| same_watcher(&r.watcher, &watcher))
        {
            return false;
        }

        let (tx, rx) = mpsc::channel(self.mailbox_capacity);
        let cancel = self.cancel.child_token();
        spawn_mailbox(self.service.clone(), watcher.clone(), rx, cancel.clone());

        let registration = Registration {
            watcher,
            mailbox: tx,
            cancel,
        };
        if let Some(current) = &inner.current {
            self.deliver(&registration, current.clone());
        }
        inner.registrations.push(registration);
        true
    }

    /// 注销 Watcher，返回剩余的 Watcher 数量；未注册时为空操作
    pub async fn remove(&self, watcher: &Arc<dyn Watcher>) -> usize {
        let mut inner = self.inner.lock().await;
        if let Some(idx) = inner
            .registrations
            .iter()
            .position(|r| same_watcher(&r.watcher, watcher))
        {
            let registration = inner.registrations.swap_remove(idx);
            registration.cancel.cancel();
        }
        inner.registrations.len()
    }

    /// 把快照投递给当前所有 Watcher
    pub async fn notify(&self, state: Arc<State>) -> FanoutReport {
        let mut inner = self.inner.lock().await;
        inner.current = Some(state.clone());

        let mut report = FanoutReport::default();
        for registration in &inner.registrations {
            if self.deliver(registration, state.clone()) {
                report.delivered += 1;
            } else {
                report.dropped += 1;
            }
        }
        report
    }

    fn deliver(&self, registration: &Registration, state: Arc<State>) -> bool {
        let revision = state.revision();
        let delivered = registration.mailbox.try_send(state).is_ok();
        self.metrics.record_delivery(delivered);
        if !delivered {
            debug!(
                service = %self.service,
                revision,
                "Watcher mailbox full, update dropped"
            );
        }
        delivered
    }

    /// 最近一次投递的快照
    pub async fn current(&self) -> Option<Arc<State>> {
        self.inner.lock().await.current.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.registrations.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// 停止所有投递任务
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        for registration in inner.registrations.drain(..) {
            registration.cancel.cancel();
        }
    }
}

fn spawn_mailbox(
    service: String,
    watcher: Arc<dyn Watcher>,
    mut rx: mpsc::Receiver<Arc<State>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(state) => watcher.update_state(state),
                    None => break,
                },
            }
        }
        debug!(service = %service, "Watcher mailbox closed");
    });
}
