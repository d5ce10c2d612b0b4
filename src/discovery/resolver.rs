//! 服务解析器
//!
//! 按服务协调变更源、防抖求值器、快照构建器和扇出投递，并管理生命周期：
//!
//! - `Created`: 服务从未被 watch
//! - `Watching`: 第一次 `add_watch` 时进入，订阅变更源并立即构建一次快照
//! - `Idle`: 最后一个 Watcher 被移除后进入，取消订阅并停止所有定时器
//! - `Stopped`: 解析器整体停止，拒绝新的 `add_watch`
//!
//! 每个被 watch 的服务有三个独立的后台任务：
//! 1. 信号接收：读取变更源的信号流，只记录到防抖器，从不等待求值
//! 2. 求值：串行执行快照构建和扇出，同一服务同一时刻最多一次构建
//! 3. 重同步：按固定间隔强制求值（可禁用）

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::discovery::backend::{ChangeSignal, ChangeSource};
use crate::discovery::config::ResolverConfig;
use crate::discovery::debounce::{Debouncer, Trigger};
use crate::discovery::endpoint::State;
use crate::discovery::filter::FilterPolicy;
use crate::discovery::snapshot::SnapshotBuilder;
use crate::discovery::watcher::{Watcher, WatcherRegistry};
use crate::error::{ErrorHook, ResolverError, Result};
use crate::metrics::{MetricsSnapshot, ResolverMetrics};
use crate::retry::ExponentialBackoff;

/// 服务的 watch 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Created,
    Watching,
    Idle,
    Stopped,
}

/// 单个被 watch 服务的后台任务共享的上下文
struct ServiceContext {
    resolver: String,
    service: String,
    policy: FilterPolicy,
    source: Arc<dyn ChangeSource>,
    builder: SnapshotBuilder,
    registry: Arc<WatcherRegistry>,
    debouncer: Debouncer,
    metrics: Arc<ResolverMetrics>,
    error_hook: Option<ErrorHook>,
    backoff: ExponentialBackoff,
    cancel: CancellationToken,
}

impl ServiceContext {
    fn report_error(&self, err: &ResolverError) {
        warn!(
            resolver = %self.resolver,
            service = %self.service,
            code = %err.code(),
            error = %err,
            "Change source error, keeping last snapshot"
        );
        if let Some(hook) = &self.error_hook {
            hook(&self.service, err);
        }
    }
}

struct ServiceEntry {
    registry: Arc<WatcherRegistry>,
    cancel: CancellationToken,
}

impl ServiceEntry {
    async fn shutdown(self) {
        self.cancel.cancel();
        self.registry.close().await;
    }
}

/// 服务进入 Idle 后仍然保留的信息
#[derive(Default)]
struct ServiceHistory {
    // 版本号永不复用
    revision: Arc<AtomicU64>,
    // 最后一次成功构建的快照，重新 watch 时先投递它
    last_state: Option<Arc<State>>,
}

#[derive(Default)]
struct ResolverInner {
    services: HashMap<String, ServiceEntry>,
    history: HashMap<String, ServiceHistory>,
    stopped: bool,
}

/// 服务解析器
///
/// 每个逻辑名称（如 "default"）创建一次，生命周期与持有它的客户端相同。
///
/// # 使用示例
/// ```rust,no_run
/// use std::sync::Arc;
/// use flare_resolver::{MemorySource, Resolver, ResolverConfig, State};
///
/// # async fn run() -> flare_resolver::Result<()> {
/// let source = Arc::new(MemorySource::new());
/// let resolver = Resolver::new("default", source, ResolverConfig::new("default", ["grpc"]));
///
/// resolver
///     .add_watch("user-service", Arc::new(|state: Arc<State>| {
///         tracing::info!(revision = state.revision(), endpoints = state.len(), "update");
///     }))
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Resolver {
    name: String,
    source: Arc<dyn ChangeSource>,
    config: ResolverConfig,
    inner: Mutex<ResolverInner>,
    metrics: Arc<ResolverMetrics>,
    error_hook: Option<ErrorHook>,
    backoff: ExponentialBackoff,
    cancel: CancellationToken,
}

impl Resolver {
    /// 创建解析器
    ///
    /// 配置在 `add_watch` 时校验，错误同步返回给调用方。
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn ChangeSource>,
        config: ResolverConfig,
    ) -> Self {
        Self {
            name: name.into(),
            source,
            config,
            inner: Mutex::new(ResolverInner::default()),
            metrics: Arc::new(ResolverMetrics::new()),
            error_hook: None,
            backoff: ExponentialBackoff::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// 设置错误观察回调
    pub fn with_error_hook(mut self, hook: ErrorHook) -> Self {
        self.error_hook = Some(hook);
        self
    }

    /// 设置重新订阅的退避策略
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// 指标快照
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// 注册 Watcher
    ///
    /// 服务的第一个 Watcher 会触发订阅和一次立即构建；服务已有快照时新 Watcher 立即收到它。
    /// 解析器已停止时返回 `ResolverError::Stopped`，配置错误返回 `ResolverError::InvalidConfig`。
    pub async fn add_watch(&self, service: &str, watcher: Arc<dyn Watcher>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.stopped {
            return Err(ResolverError::Stopped(self.name.clone()));
        }

        self.config.validate()?;
        let policy = self.config.policy_for(service);
        policy.validate()?;

        if let Some(entry) = inner.services.get(service) {
            if entry.registry.add(watcher).await {
                debug!(resolver = %self.name, service = %service, "Watcher added");
            }
            return Ok(());
        }

        let history = inner.history.entry(service.to_string()).or_default();
        let revision = history.revision.clone();
        let last_state = history.last_state.clone();
        let entry = self.start_service(service, policy, revision, last_state);
        entry.registry.add(watcher).await;
        inner.services.insert(service.to_string(), entry);

        info!(
            resolver = %self.name,
            service = %service,
            source = %self.source.name(),
            "Watch started"
        );
        Ok(())
    }

    /// 注销 Watcher；未注册时为空操作
    ///
    /// 最后一个 Watcher 被移除后服务进入 Idle：取消订阅，停止防抖和重同步定时器。
    pub async fn del_watch(&self, service: &str, watcher: &Arc<dyn Watcher>) {
        let mut inner = self.inner.lock().await;
        let remaining = match inner.services.get(service) {
            Some(entry) => entry.registry.remove(watcher).await,
            None => return,
        };
        if remaining > 0 {
            return;
        }
        if let Some(entry) = inner.services.remove(service) {
            let last_state = entry.registry.current().await;
            if let Some(history) = inner.history.get_mut(service) {
                history.last_state = last_state;
            }
            entry.shutdown().await;
            info!(
                resolver = %self.name,
                service = %service,
                "Last watcher removed, subscription cancelled"
            );
        }
    }

    /// 停止解析器：取消所有订阅和定时器，之后的 `add_watch` 都会失败
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.stopped {
            return;
        }
        inner.stopped = true;
        self.cancel.cancel();
        for (_, entry) in inner.services.drain() {
            entry.shutdown().await;
        }
        info!(resolver = %self.name, "Resolver stopped");
    }

    /// 服务最近一次投递的快照，Idle 的服务返回进入 Idle 前的快照
    pub async fn current_state(&self, service: &str) -> Option<Arc<State>> {
        let registry = {
            let inner = self.inner.lock().await;
            match inner.services.get(service) {
                Some(entry) => entry.registry.clone(),
                None => {
                    return inner
                        .history
                        .get(service)
                        .and_then(|h| h.last_state.clone());
                }
            }
        };
        registry.current().await
    }

    /// 服务的 watch 状态
    pub async fn watch_state(&self, service: &str) -> WatchState {
        let inner = self.inner.lock().await;
        if inner.stopped {
            WatchState::Stopped
        } else if inner.services.contains_key(service) {
            WatchState::Watching
        } else if inner.history.contains_key(service) {
            WatchState::Idle
        } else {
            WatchState::Created
        }
    }

    /// 服务当前的 Watcher 数量
    pub async fn watcher_count(&self, service: &str) -> usize {
        let registry = {
            let inner = self.inner.lock().await;
            inner.services.get(service).map(|e| e.registry.clone())
        };
        match registry {
            Some(registry) => registry.len().await,
            None => 0,
        }
    }

    /// 正在 watch 的服务，按名称排序
    pub async fn watched_services(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        let mut services: Vec<String> = inner.services.keys().cloned().collect();
        services.sort();
        services
    }

    fn start_service(
        &self,
        service: &str,
        policy: FilterPolicy,
        revision: Arc<AtomicU64>,
        last_state: Option<Arc<State>>,
    ) -> ServiceEntry {
        let cancel = self.cancel.child_token();
        let registry = Arc::new(
            WatcherRegistry::new(
                service,
                self.config.watcher_buffer,
                self.metrics.clone(),
                cancel.clone(),
            )
            .with_current(last_state),
        );
        let builder = SnapshotBuilder::new(self.source.clone(), revision, self.config.timeout())
            .with_resolver_name(self.name.clone());

        let ctx = Arc::new(ServiceContext {
            resolver: self.name.clone(),
            service: service.to_string(),
            policy,
            source: self.source.clone(),
            builder,
            registry: registry.clone(),
            debouncer: Debouncer::new(self.config.debounce()),
            metrics: self.metrics.clone(),
            error_hook: self.error_hook.clone(),
            backoff: self.backoff,
            cancel: cancel.clone(),
        });

        // 第一个 Watcher 不等待防抖窗口
        ctx.debouncer.force(Trigger::Initial);

        tokio::spawn(run_evaluations(ctx.clone()));
        tokio::spawn(run_signal_ingestion(ctx.clone()));
        if let Some(period) = self.config.resync_interval() {
            tokio::spawn(run_resync(ctx, period));
        }

        ServiceEntry { registry, cancel }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 求值循环：等待触发 -> 构建 -> 扇出，串行执行
async fn run_evaluations(ctx: Arc<ServiceContext>) {
    loop {
        let trigger = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            trigger = ctx.debouncer.next_trigger() => trigger,
        };
        ctx.metrics.record_evaluation();

        let result = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            result = ctx.builder.build(&ctx.service, &ctx.policy) => result,
        };

        match result {
            Ok(state) => {
                ctx.metrics.record_build(true);
                let revision = state.revision();
                let endpoints = state.len();
                let report = ctx.registry.notify(state).await;
                debug!(
                    resolver = %ctx.resolver,
                    service = %ctx.service,
                    %trigger,
                    revision,
                    endpoints,
                    delivered = report.delivered,
                    dropped = report.dropped,
                    "State published"
                );
            }
            Err(err) => {
                ctx.metrics.record_build(false);
                ctx.report_error(&err);
            }
        }
        ctx.debouncer.complete();
    }
    debug!(service = %ctx.service, "Evaluation loop stopped");
}

/// 信号接收：订阅变更源，信号只记录到防抖器；订阅失败或中断时退避重订阅
async fn run_signal_ingestion(ctx: Arc<ServiceContext>) {
    let mut attempt = 0usize;
    let mut reconnecting = false;

    loop {
        let subscribed = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            result = ctx.source.subscribe(&ctx.service) => result,
        };

        let err = match subscribed {
            Ok(mut subscription) => {
                if reconnecting {
                    // 断开期间可能漏掉了事件
                    ctx.debouncer.signal();
                    info!(service = %ctx.service, "Change source subscription restored");
                }
                attempt = 0;

                loop {
                    let signal = tokio::select! {
                        biased;
                        _ = ctx.cancel.cancelled() => {
                            subscription.cancel();
                            return;
                        }
                        signal = subscription.recv() => signal,
                    };
                    match signal {
                        Some(ChangeSignal::Changed) => {
                            ctx.metrics.record_signal();
                            ctx.debouncer.signal();
                        }
                        Some(ChangeSignal::Resync) => {
                            ctx.metrics.record_resync();
                            ctx.debouncer.force(Trigger::Resync);
                        }
                        None => break,
                    }
                }
                ResolverError::Subscribe {
                    service: ctx.service.clone(),
                    reason: "signal stream closed".to_string(),
                }
            }
            Err(source) => ResolverError::Subscribe {
                service: ctx.service.clone(),
                reason: source.to_string(),
            },
        };

        ctx.metrics.record_subscribe_failure();
        ctx.report_error(&err);
        reconnecting = true;

        let delay = ctx.backoff.backoff_duration(attempt);
        attempt = attempt.saturating_add(1);
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// 周期重同步，不受防抖约束
async fn run_resync(ctx: Arc<ServiceContext>, period: Duration) {
    let Some(start) = Instant::now().checked_add(period) else {
        warn!(
            service = %ctx.service,
            period_ms = period.as_millis() as u64,
            "Resync interval out of range, periodic resync disabled"
        );
        return;
    };
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            _ = ticker.tick() => {
                ctx.metrics.record_resync();
                ctx.debouncer.force(Trigger::Resync);
            }
        }
    }
}
