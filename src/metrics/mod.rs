//! 指标收集模块
//!
//! 计数器在信号接收、求值和投递的热路径上更新，使用原子变量，不加锁。

use std::sync::atomic::{AtomicU64, Ordering};

/// 指标快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// 收到的变更信号数
    pub signals_received: u64,
    /// 重同步次数（周期或后端原生）
    pub resyncs: u64,
    /// 开始的求值次数
    pub evaluations: u64,
    /// 成功构建的快照数
    pub builds_succeeded: u64,
    /// 失败的构建数（List 失败或超时）
    pub builds_failed: u64,
    /// 订阅失败或信号流中断次数
    pub subscribe_failures: u64,
    /// 成功放入 Watcher 邮箱的投递数
    pub deliveries: u64,
    /// 因邮箱已满或已关闭而丢弃的投递数
    pub dropped_deliveries: u64,
}

/// 解析器指标收集器
#[derive(Debug, Default)]
pub struct ResolverMetrics {
    signals_received: AtomicU64,
    resyncs: AtomicU64,
    evaluations: AtomicU64,
    builds_succeeded: AtomicU64,
    builds_failed: AtomicU64,
    subscribe_failures: AtomicU64,
    deliveries: AtomicU64,
    dropped_deliveries: AtomicU64,
}

impl ResolverMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_signal(&self) {
        self.signals_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_resync(&self) {
        self.resyncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evaluation(&self) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build(&self, success: bool) {
        if success {
            self.builds_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.builds_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_subscribe_failure(&self) {
        self.subscribe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, delivered: bool) {
        if delivered {
            self.deliveries.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            signals_received: self.signals_received.load(Ordering::Relaxed),
            resyncs: self.resyncs.load(Ordering::Relaxed),
            evaluations: self.evaluations.load(Ordering::Relaxed),
            builds_succeeded: self.builds_succeeded.load(Ordering::Relaxed),
            builds_failed: self.builds_failed.load(Ordering::Relaxed),
            subscribe_failures: self.subscribe_failures.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            dropped_deliveries: self.dropped_deliveries.load(Ordering::Relaxed),
        }
    }
}
