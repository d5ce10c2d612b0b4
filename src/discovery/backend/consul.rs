//! Consul 变更源
//!
//! - `list`: `GET /v1/health/service/{service}`
//! - `subscribe`: 对同一接口做阻塞查询（`index` + `wait`），`X-Consul-Index` 变化时推送信号
//!
//! 命名空间和协议优先取 `Service.Meta`，其次取 `key=value` 形式的标签，最后使用配置的默认值。

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::discovery::backend::{ChangeSignal, ChangeSource, Subscription};
use crate::discovery::config::SourceConfig;
use crate::discovery::instance::RawRecord;
use crate::error::{ResolverError, SourceError};
use crate::retry::ExponentialBackoff;

const SIGNAL_BUFFER: usize = 16;
const DEFAULT_URL: &str = "http://localhost:8500";
const DEFAULT_WAIT_SECS: u64 = 30;

/// Consul 变更源
pub struct ConsulSource {
    http_client: Arc<HttpClient>,
    consul_url: String,
    default_namespace: String,
    default_protocol: String,
    passing_only: bool,
    wait: Duration,
}

impl ConsulSource {
    /// 创建 Consul 变更源
    ///
    /// `backend_config`:
    /// - `url`: Consul 地址，默认 `http://localhost:8500`
    /// - `namespace` / `protocol`: 记录未声明时使用的默认值
    /// - `passing_only`: 只返回健康检查通过的实例，默认 true
    /// - `wait_secs`: 阻塞查询的最长等待时间，默认 30 秒
    pub fn new(config: &SourceConfig) -> Result<Self, ResolverError> {
        let consul_url = config
            .option_str("url")
            .unwrap_or(DEFAULT_URL)
            .trim_end_matches('/')
            .to_string();
        let wait = Duration::from_secs(
            config
                .backend_config
                .get("wait_secs")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_WAIT_SECS),
        );

        // 阻塞查询最多会挂起 wait + wait/16
        let http_client = HttpClient::builder()
            .timeout(wait + wait / 16 + Duration::from_secs(5))
            .build()
            .map_err(|e| ResolverError::invalid_config(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            http_client: Arc::new(http_client),
            consul_url,
            default_namespace: config.option_str("namespace").unwrap_or("default").to_string(),
            default_protocol: config.option_str("protocol").unwrap_or("grpc").to_string(),
            passing_only: config
                .backend_config
                .get("passing_only")
                .and_then(Value::as_bool)
                .unwrap_or(true),
            wait,
        })
    }

    fn health_url(&self, service: &str) -> String {
        format!("{}/v1/health/service/{}", self.consul_url, service)
    }

    fn base_query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::new();
        if self.passing_only {
            query.push(("passing", "true".to_string()));
        }
        query
    }
}

#[async_trait]
impl ChangeSource for ConsulSource {
    fn name(&self) -> &str {
        "consul"
    }

    async fn list(&self, service: &str) -> Result<Vec<RawRecord>, SourceError> {
        let resp = self
            .http_client
            .get(self.health_url(service))
            .query(&self.base_query())
            .send()
            .await?
            .error_for_status()?;
        let entries: Vec<Value> = resp.json().await?;
        Ok(parse_health_entries(
            service,
            &entries,
            &self.default_namespace,
            &self.default_protocol,
        ))
    }

    async fn subscribe(&self, service: &str) -> Result<Subscription, SourceError> {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let cancel = CancellationToken::new();

        let watch = BlockingWatch {
            http_client: self.http_client.clone(),
            url: self.health_url(service),
            query: self.base_query(),
            wait: self.wait,
            service: service.to_string(),
        };
        tokio::spawn(watch.run(tx, cancel.clone()));

        Ok(Subscription::new(rx, cancel))
    }
}

/// 阻塞查询循环
struct BlockingWatch {
    http_client: Arc<HttpClient>,
    url: String,
    query: Vec<(&'static str, String)>,
    wait: Duration,
    service: String,
}

impl BlockingWatch {
    async fn run(self, tx: mpsc::Sender<ChangeSignal>, cancel: CancellationToken) {
        let backoff = ExponentialBackoff::default();
        let mut index = 0u64;
        let mut failures = 0usize;

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                polled = self.poll(index) => polled,
            };

            match polled {
                Ok(next) => {
                    failures = 0;
                    // 索引回退说明 Consul 重置了状态，同样视为变化
                    if index != 0 && next != index {
                        let _ = tx.try_send(ChangeSignal::Changed);
                    }
                    index = if next < index { 0 } else { next };
                }
                Err(e) => {
                    warn!(service = %self.service, error = %e, "Consul blocking query failed");
                    let delay = backoff.backoff_duration(failures);
                    failures = failures.saturating_add(1);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        debug!(service = %self.service, "Consul watch stopped");
    }

    async fn poll(&self, index: u64) -> Result<u64, SourceError> {
        let mut query = self.query.clone();
        query.push(("index", index.to_string()));
        query.push(("wait", format!("{}s", self.wait.as_secs())));

        let resp = self
            .http_client
            .get(&self.url)
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        consul_index(resp.headers())
    }
}

/// 读取 `X-Consul-Index`
///
/// 缺失或无法解析时返回错误：以 index=0 重试会立即返回，形成忙轮询。
fn consul_index(headers: &HeaderMap) -> Result<u64, SourceError> {
    let value = headers
        .get("X-Consul-Index")
        .ok_or("missing X-Consul-Index header")?;
    let index = value
        .to_str()
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or("invalid X-Consul-Index header")?;
    // 索引必须大于 0
    Ok(index.max(1))
}

/// 解析 `/v1/health/service` 的响应
///
/// 缺少端口或地址的条目会被跳过，其余校验交给过滤器。
fn parse_health_entries(
    service: &str,
    entries: &[Value],
    default_namespace: &str,
    default_protocol: &str,
) -> Vec<RawRecord> {
    let mut records = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(svc) = entry.get("Service") else {
            continue;
        };

        let address = svc
            .get("Address")
            .and_then(Value::as_str)
            .filter(|a| !a.is_empty())
            .or_else(|| {
                entry
                    .get("Node")
                    .and_then(|n| n.get("Address"))
                    .and_then(Value::as_str)
            });
        let port = svc
            .get("Port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok());
        let (Some(address), Some(port)) = (address, port) else {
            debug!(service = %service, "Skipping Consul entry without address or port");
            continue;
        };

        let mut labels: HashMap<String, String> = HashMap::new();
        if let Some(tags) = svc.get("Tags").and_then(Value::as_array) {
            for tag in tags.iter().filter_map(Value::as_str) {
                match tag.split_once('=') {
                    Some((key, value)) => labels.insert(key.to_string(), value.to_string()),
                    None => labels.insert(tag.to_string(), "true".to_string()),
                };
            }
        }
        if let Some(meta) = svc.get("Meta").and_then(Value::as_object) {
            for (key, value) in meta {
                if let Some(value) = value.as_str() {
                    labels.insert(key.clone(), value.to_string());
                }
            }
        }

        let namespace = labels
            .remove("namespace")
            .unwrap_or_else(|| default_namespace.to_string());
        let protocol = labels
            .remove("protocol")
            .unwrap_or_else(|| default_protocol.to_string());
        let name = svc
            .get("Service")
            .and_then(Value::as_str)
            .unwrap_or(service);

        let mut record = RawRecord::new(name, namespace, protocol, address, port);
        if let Some(id) = svc.get("ID").and_then(Value::as_str) {
            record = record.with_instance_id(id);
        }
        if let Some(node) = entry
            .get("Node")
            .and_then(|n| n.get("Node"))
            .and_then(Value::as_str)
        {
            labels.insert("node".to_string(), node.to_string());
        }
        record.metadata = labels;
        records.push(record);
    }
    records
}
