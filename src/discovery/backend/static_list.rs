//! 静态列表变更源
//!
//! 记录来自配置，不推送任何信号；解析器的周期重同步替代推送通知。

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

use crate::discovery::backend::{ChangeSource, Subscription};
use crate::discovery::config::SourceConfig;
use crate::discovery::instance::{RawRecord, split_host_port};
use crate::error::{ResolverError, SourceError};

/// 配置中的一条静态记录
#[derive(Debug, Clone, Deserialize)]
struct StaticRecord {
    /// 为空时对任何被 watch 的服务都生效
    #[serde(default)]
    service: Option<String>,
    namespace: String,
    protocol: String,
    address: String,
    #[serde(default)]
    instance_id: String,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

/// 静态列表变更源
pub struct StaticSource {
    records: Vec<(Option<String>, RawRecord)>,
}

impl StaticSource {
    /// 从记录列表创建，记录的 `service_name` 为空时匹配所有服务
    pub fn new(records: Vec<RawRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| {
                    let service = (!r.service_name.is_empty()).then(|| r.service_name.clone());
                    (service, r)
                })
                .collect(),
        }
    }

    /// 从 `backend_config.records` 创建
    pub fn from_config(config: &SourceConfig) -> Result<Self, ResolverError> {
        let raw = config
            .backend_config
            .get("records")
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
        let entries: Vec<StaticRecord> = serde_json::from_value(raw)
            .map_err(|e| ResolverError::invalid_config(format!("invalid static records: {}", e)))?;

        let mut records = Vec::with_capacity(entries.len());
        for entry in entries {
            let (host, port) = split_host_port(&entry.address).ok_or_else(|| {
                ResolverError::invalid_config(format!("invalid static address `{}`", entry.address))
            })?;
            let record = RawRecord {
                service_name: entry.service.clone().unwrap_or_default(),
                namespace: entry.namespace,
                protocol: entry.protocol,
                host,
                port,
                instance_id: entry.instance_id,
                metadata: entry.metadata,
            };
            records.push((entry.service, record));
        }
        Ok(Self { records })
    }
}

#[async_trait]
impl ChangeSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn list(&self, service: &str) -> Result<Vec<RawRecord>, SourceError> {
        Ok(self
            .records
            .iter()
            .filter(|(owner, _)| owner.as_deref().is_none_or(|s| s == service))
            .map(|(owner, record)| {
                let mut record = record.clone();
                if owner.is_none() {
                    record.service_name = service.to_string();
                }
                record
            })
            .collect())
    }

    async fn subscribe(&self, _service: &str) -> Result<Subscription, SourceError> {
        Ok(Subscription::silent())
    }
}
