//! 内存变更源
//!
//! 进程内的注册中心，用于嵌入式部署和测试。支持注入 List 失败和延迟。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use crate::discovery::backend::{ChangeSignal, ChangeSource, Subscription};
use crate::discovery::instance::RawRecord;
use crate::error::SourceError;

const SIGNAL_BUFFER: usize = 16;

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, Vec<RawRecord>>,
    subscribers: HashMap<String, Vec<(mpsc::Sender<ChangeSignal>, CancellationToken)>>,
    list_failure: Option<String>,
    subscribe_failure: Option<String>,
    list_delay: Duration,
    list_calls: HashMap<String, u64>,
}

impl MemoryInner {
    fn publish(&mut self, service: &str, signal: ChangeSignal) {
        if let Some(subscribers) = self.subscribers.get_mut(service) {
            subscribers.retain(|(tx, cancel)| !tx.is_closed() && !cancel.is_cancelled());
            for (tx, _) in subscribers.iter() {
                // 信号通道已满说明已有未处理的变化，丢弃即可
                let _ = tx.try_send(signal);
            }
        }
    }
}

/// 内存变更源
#[derive(Clone, Default)]
pub struct MemorySource {
    inner: Arc<RwLock<MemoryInner>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册实例（按 `service_name` 归类，相同 `instance_id` 会被替换）
    pub async fn register(&self, record: RawRecord) {
        let service = record.service_name.clone();
        self.register_under(&service, record).await;
    }

    /// 把记录放到指定服务的列表下，即使记录本身属于其它服务
    pub async fn register_under(&self, service: &str, record: RawRecord) {
        let mut inner = self.inner.write().await;
        let records = inner.records.entry(service.to_string()).or_default();
        match records
            .iter_mut()
            .find(|r| !record.instance_id.is_empty() && r.instance_id == record.instance_id)
        {
            Some(existing) => *existing = record,
            None => records.push(record),
        }
        inner.publish(service, ChangeSignal::Changed);
    }

    /// 注销实例，返回是否存在
    pub async fn deregister(&self, service: &str, instance_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let removed = match inner.records.get_mut(service) {
            Some(records) => {
                let before = records.len();
                records.retain(|r| r.instance_id != instance_id);
                records.len() != before
            }
            None => false,
        };
        if removed {
            inner.publish(service, ChangeSignal::Changed);
        }
        removed
    }

    /// 整体替换服务的记录
    pub async fn set_records(&self, service: &str, records: Vec<RawRecord>) {
        let mut inner = self.inner.write().await;
        inner.records.insert(service.to_string(), records);
        inner.publish(service, ChangeSignal::Changed);
    }

    /// 推送一个变更信号但不修改数据（模拟重复或无效通知）
    pub async fn signal(&self, service: &str) {
        self.inner.write().await.publish(service, ChangeSignal::Changed);
    }

    /// 推送后端原生的重同步信号
    pub async fn resync(&self, service: &str) {
        self.inner.write().await.publish(service, ChangeSignal::Resync);
    }

    /// 设置后续 List 调用失败（`None` 恢复正常）
    pub async fn fail_lists(&self, reason: Option<&str>) {
        self.inner.write().await.list_failure = reason.map(str::to_string);
    }

    /// 设置后续 Subscribe 调用失败（`None` 恢复正常）
    pub async fn fail_subscribes(&self, reason: Option<&str>) {
        self.inner.write().await.subscribe_failure = reason.map(str::to_string);
    }

    /// 关闭服务的所有订阅（模拟 watch 流中断）
    pub async fn close_subscriptions(&self, service: &str) {
        self.inner.write().await.subscribers.remove(service);
    }

    /// 设置 List 调用的延迟
    pub async fn set_list_delay(&self, delay: Duration) {
        self.inner.write().await.list_delay = delay;
    }

    /// 服务的 List 调用次数
    pub async fn list_calls(&self, service: &str) -> u64 {
        self.inner
            .read()
            .await
            .list_calls
            .get(service)
            .copied()
            .unwrap_or(0)
    }

    /// 服务当前有效的订阅数量
    pub async fn active_subscriptions(&self, service: &str) -> usize {
        self.inner
            .read()
            .await
            .subscribers
            .get(service)
            .map(|subs| {
                subs.iter()
                    .filter(|(tx, cancel)| !tx.is_closed() && !cancel.is_cancelled())
                    .count()
            })
            .unwrap_or(0)
    }
}

#[async_trait]
impl ChangeSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list(&self, service: &str) -> Result<Vec<RawRecord>, SourceError> {
        let (delay, failure) = {
            let mut inner = self.inner.write().await;
            *inner.list_calls.entry(service.to_string()).or_default() += 1;
            (inner.list_delay, inner.list_failure.clone())
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = failure {
            return Err(reason.into());
        }

        let inner = self.inner.read().await;
        Ok(inner.records.get(service).cloned().unwrap_or_default())
    }

    async fn subscribe(&self, service: &str) -> Result<Subscription, SourceError> {
        let mut inner = self.inner.write().await;
        if let Some(reason) = &inner.subscribe_failure {
            return Err(reason.clone().into());
        }
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let cancel = CancellationToken::new();
        inner
            .subscribers
            .entry(service.to_string())
            .or_default()
            .push((tx, cancel.clone()));
        Ok(Subscription::new(rx, cancel))
    }
}
