//! etcd 变更源
//!
//! 记录以 JSON 形式存放在 `{prefix}/services/{service}/{instance_id}` 下：
//! - `list`: 按前缀 `get`
//! - `subscribe`: 按前缀 `watch`，每个事件批次转换为一个 `ChangeSignal::Changed`

use async_trait::async_trait;
use etcd_client::{Client, GetOptions, WatchOptions};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::discovery::backend::{ChangeSignal, ChangeSource, Subscription};
use crate::discovery::config::SourceConfig;
use crate::discovery::instance::RawRecord;
use crate::error::{ResolverError, SourceError};

const SIGNAL_BUFFER: usize = 16;

/// etcd 变更源
pub struct EtcdSource {
    client: Arc<Mutex<Client>>,
    prefix: String,
}

impl EtcdSource {
    /// 创建 etcd 变更源
    ///
    /// `backend_config`:
    /// - `endpoints`: etcd 地址列表（必填）
    /// - `prefix`: 键前缀，默认 "flare"
    pub async fn new(config: &SourceConfig) -> Result<Self, ResolverError> {
        let endpoints = config
            .option_list("endpoints")
            .filter(|endpoints| !endpoints.is_empty())
            .ok_or_else(|| ResolverError::invalid_config("etcd endpoints not configured"))?;

        let client = Client::connect(&endpoints, None)
            .await
            .map_err(|e| ResolverError::Subscribe {
                service: String::new(),
                reason: format!("failed to connect etcd: {}", e),
            })?;

        let prefix = config.option_str("prefix").unwrap_or("flare").to_string();

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
            prefix,
        })
    }

    fn service_prefix(&self, service: &str) -> String {
        format!("{}/services/{}/", self.prefix, service)
    }

    fn record_key(&self, service: &str, instance_id: &str) -> String {
        format!("{}{}", self.service_prefix(service), instance_id)
    }

    /// 写入一条记录（`instance_id` 为空时使用地址作为键）
    pub async fn register(&self, record: &RawRecord) -> Result<(), SourceError> {
        let id = if record.instance_id.is_empty() {
            format!("{}:{}", record.host, record.port)
        } else {
            record.instance_id.clone()
        };
        let key = self.record_key(&record.service_name, &id);
        let value = serde_json::to_vec(record)?;

        let mut client = self.client.lock().await;
        client.put(key.clone(), value, None).await?;
        debug!(key = %key, "Record written to etcd");
        Ok(())
    }

    /// 删除一条记录
    pub async fn deregister(&self, service: &str, instance_id: &str) -> Result<(), SourceError> {
        let key = self.record_key(service, instance_id);
        let mut client = self.client.lock().await;
        client.delete(key, None).await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeSource for EtcdSource {
    fn name(&self) -> &str {
        "etcd"
    }

    async fn list(&self, service: &str) -> Result<Vec<RawRecord>, SourceError> {
        let key_prefix = self.service_prefix(service);
        let resp = {
            let mut client = self.client.lock().await;
            client
                .get(key_prefix, Some(GetOptions::new().with_prefix()))
                .await?
        };

        let mut records = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            match serde_json::from_slice::<RawRecord>(kv.value()) {
                Ok(record) => records.push(record),
                Err(e) => {
                    debug!(
                        key = %String::from_utf8_lossy(kv.key()),
                        error = %e,
                        "Skipping undecodable etcd record"
                    );
                }
            }
        }
        Ok(records)
    }

    async fn subscribe(&self, service: &str) -> Result<Subscription, SourceError> {
        let key_prefix = self.service_prefix(service);
        let (mut watcher, mut stream) = {
            let mut client = self.client.lock().await;
            client
                .watch(key_prefix.clone(), Some(WatchOptions::new().with_prefix()))
                .await?
        };

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    message = stream.message() => match message {
                        Ok(Some(resp)) => {
                            if resp.canceled() {
                                break;
                            }
                            if !resp.events().is_empty() {
                                // 通道已满说明已有未处理的变化
                                let _ = tx.try_send(ChangeSignal::Changed);
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(prefix = %key_prefix, error = %e, "etcd watch stream failed");
                            break;
                        }
                    },
                }
            }
            if let Err(e) = watcher.cancel().await {
                debug!(prefix = %key_prefix, error = %e, "Failed to cancel etcd watcher");
            }
        });

        Ok(Subscription::new(rx, cancel))
    }
}
