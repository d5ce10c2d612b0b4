//! 快照构建
//!
//! 一次构建 = 全量 List + 逐条过滤 + 生成新的不可变 `State`。
//! List 失败时不产生新快照，已经投递出去的快照继续有效。

use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::discovery::backend::ChangeSource;
use crate::discovery::endpoint::{Attributes, Endpoint, State};
use crate::discovery::filter::{FilterPolicy, filter};
use crate::error::{ResolverError, Result};

/// 快照构建器
///
/// 版本计数器由调用方传入并在服务进入 Idle 后继续保留，保证同一服务的版本号永不复用。
pub struct SnapshotBuilder {
    source: Arc<dyn ChangeSource>,
    revision: Arc<AtomicU64>,
    timeout: Option<Duration>,
    resolver: String,
}

impl SnapshotBuilder {
    pub fn new(
        source: Arc<dyn ChangeSource>,
        revision: Arc<AtomicU64>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            source,
            revision,
            timeout,
            resolver: String::new(),
        }
    }

    /// 设置写入快照属性的解析器名称
    pub fn with_resolver_name(mut self, name: impl Into<String>) -> Self {
        self.resolver = name.into();
        self
    }

    /// 最近一次成功构建的版本号，0 表示从未构建
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// 构建新的快照
    ///
    /// 只要 List 成功就会生成新版本，即使端点集合与上一次完全相同。
    pub async fn build(&self, service: &str, policy: &FilterPolicy) -> Result<Arc<State>> {
        let listed = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.source.list(service))
                .await
                .map_err(|_| ResolverError::Timeout {
                    service: service.to_string(),
                    timeout,
                })?,
            None => self.source.list(service).await,
        };
        let records = listed.map_err(|source| ResolverError::Source {
            service: service.to_string(),
            source,
        })?;

        let total = records.len();
        let mut endpoints: Vec<Endpoint> = records.iter().filter_map(|r| filter(r, policy)).collect();
        endpoints.sort_by(|a, b| {
            a.address()
                .cmp(b.address())
                .then_with(|| a.protocol().cmp(b.protocol()))
                .then_with(|| a.name().cmp(b.name()))
        });

        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;

        let mut attributes = Attributes::new();
        attributes.insert("service".to_string(), json!(service));
        attributes.insert("namespace".to_string(), json!(policy.namespace));
        attributes.insert("source".to_string(), json!(self.source.name()));
        attributes.insert("records_total".to_string(), json!(total));
        attributes.insert("records_rejected".to_string(), json!(total - endpoints.len()));
        attributes.insert("built_at".to_string(), json!(chrono::Utc::now().to_rfc3339()));
        if !self.resolver.is_empty() {
            attributes.insert("resolver".to_string(), json!(self.resolver));
        }

        debug!(
            service = %service,
            revision,
            endpoints = endpoints.len(),
            rejected = total - endpoints.len(),
            "Snapshot built"
        );

        Ok(Arc::new(State::new(endpoints, revision, attributes)))
    }
}
