//! 服务解析配置

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::discovery::filter::FilterPolicy;
use crate::error::{ResolverError, Result};

/// 解析器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// 命名空间（精确匹配，必填）
    #[serde(default)]
    pub namespace: String,

    /// 允许的协议列表
    #[serde(default)]
    pub protocols: Vec<String>,

    /// 防抖窗口（毫秒）
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// 强制重同步间隔（毫秒），0 表示禁用
    #[serde(default = "default_resync_interval_ms")]
    pub resync_interval_ms: u64,

    /// List 调用超时（毫秒），0 表示不限制
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// 每个 Watcher 的投递邮箱容量
    #[serde(default = "default_watcher_buffer")]
    pub watcher_buffer: usize,
}

fn default_debounce_ms() -> u64 {
    200
}

fn default_resync_interval_ms() -> u64 {
    30_000
}

/// 防抖窗口、重同步间隔和超时的上限
pub const MAX_INTERVAL_MS: u64 = 7 * 24 * 60 * 60 * 1000;

fn default_timeout_ms() -> u64 {
    3000
}

fn default_watcher_buffer() -> usize {
    4
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            protocols: Vec::new(),
            debounce_ms: default_debounce_ms(),
            resync_interval_ms: default_resync_interval_ms(),
            timeout_ms: default_timeout_ms(),
            watcher_buffer: default_watcher_buffer(),
        }
    }
}

impl ResolverConfig {
    /// 创建配置
    pub fn new<I, S>(namespace: impl Into<String>, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespace: namespace.into(),
            protocols: protocols.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// 设置防抖窗口
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = duration_ms(debounce);
        self
    }

    /// 设置重同步间隔，`Duration::ZERO` 禁用
    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval_ms = duration_ms(interval);
        self
    }

    /// 设置 List 超时，`Duration::ZERO` 不限制
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_ms(timeout);
        self
    }

    /// 设置每个 Watcher 的邮箱容量
    pub fn with_watcher_buffer(mut self, capacity: usize) -> Self {
        self.watcher_buffer = capacity;
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        (self.resync_interval_ms > 0).then(|| Duration::from_millis(self.resync_interval_ms))
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// 构造某个服务的过滤策略
    pub fn policy_for(&self, service: &str) -> FilterPolicy {
        FilterPolicy::new(
            self.namespace.clone(),
            service,
            self.protocols.iter().cloned(),
        )
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(ResolverError::invalid_config("namespace must not be empty"));
        }
        if self.protocols.iter().all(|p| p.trim().is_empty()) {
            return Err(ResolverError::invalid_config("protocols must not be empty"));
        }
        if self.watcher_buffer == 0 {
            return Err(ResolverError::invalid_config("watcher_buffer must be at least 1"));
        }
        for (name, value) in [
            ("debounce_ms", self.debounce_ms),
            ("resync_interval_ms", self.resync_interval_ms),
            ("timeout_ms", self.timeout_ms),
        ] {
            if value > MAX_INTERVAL_MS {
                return Err(ResolverError::invalid_config(format!(
                    "{} must not exceed {}",
                    name, MAX_INTERVAL_MS
                )));
            }
        }
        Ok(())
    }
}

/// 非零的亚毫秒时长向上取整为 1 毫秒，不会被截断成 0
fn duration_ms(duration: Duration) -> u64 {
    if duration.is_zero() {
        return 0;
    }
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// 变更源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// 后端类型：memory, static, etcd, consul
    pub backend: BackendType,

    /// 后端特定配置
    #[serde(default)]
    pub backend_config: HashMap<String, serde_json::Value>,
}

impl SourceConfig {
    pub fn new(backend: BackendType) -> Self {
        Self {
            backend,
            backend_config: HashMap::new(),
        }
    }

    /// 设置后端特定配置项
    pub fn with_option(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.backend_config.insert(key.into(), value);
        self
    }

    /// 读取字符串配置项
    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.backend_config.get(key).and_then(|v| v.as_str())
    }

    /// 读取字符串数组配置项
    pub fn option_list(&self, key: &str) -> Option<Vec<String>> {
        self.backend_config.get(key).and_then(|v| v.as_array()).and_then(|arr| {
            arr.iter()
                .map(|v| v.as_str().map(|s| s.to_string()))
                .collect::<Option<Vec<_>>>()
        })
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::new(BackendType::Memory)
    }
}

/// 后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    Memory,
    Static,
    Etcd,
    Consul,
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "inmemory" | "in-memory" => Ok(BackendType::Memory),
            "static" | "fixed" => Ok(BackendType::Static),
            "etcd" => Ok(BackendType::Etcd),
            "consul" => Ok(BackendType::Consul),
            _ => Err(format!("Unknown backend type: {}", s)),
        }
    }
}

impl std::fmt::Display for BackendType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendType::Memory => "memory",
            BackendType::Static => "static",
            BackendType::Etcd => "etcd",
            BackendType::Consul => "consul",
        };
        f.write_str(s)
    }
}
