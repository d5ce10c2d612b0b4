//! Flare Resolver 错误处理模块
//!
//! 三类错误：
//! 1. 变更源暂时性错误（List/Subscribe 失败、超时）：本地恢复，保留上一次的快照
//! 2. 配置错误：在 `add_watch` 时同步返回
//! 3. 投递容量不足：只计数并丢弃，不作为错误返回

pub mod code;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use code::{ErrorCode, ErrorKind};

/// 变更源后端返回的错误类型
pub type SourceError = Box<dyn std::error::Error + Send + Sync>;

/// 错误观察回调：`(service, error)`
///
/// 每次变更源出现暂时性错误时调用，在 `warn!` 日志之外提供给调用方的观测点
pub type ErrorHook = Arc<dyn Fn(&str, &ResolverError) + Send + Sync>;

/// 解析器统一结果类型
pub type Result<T> = std::result::Result<T, ResolverError>;

/// 解析器统一错误类型
#[derive(Error, Debug)]
pub enum ResolverError {
    /// 解析器已停止，不再接受新的 watch
    #[error("resolver `{0}` has been stopped")]
    Stopped(String),

    /// 配置错误
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// 配置文件加载失败
    #[error("failed to load configuration: {0}")]
    ConfigLoad(String),

    /// 后端类型未编译进当前构建
    #[error("backend `{0}` is not enabled in this build")]
    BackendNotSupported(String),

    /// 变更源 List 调用失败
    #[error("change source list for `{service}` failed: {source}")]
    Source {
        service: String,
        #[source]
        source: SourceError,
    },

    /// 变更源订阅失败或信号流中断
    #[error("change source subscription for `{service}` failed: {reason}")]
    Subscribe { service: String, reason: String },

    /// List 调用超时
    #[error("change source list for `{service}` timed out after {timeout:?}")]
    Timeout { service: String, timeout: Duration },
}

impl ResolverError {
    /// 创建配置错误
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        ResolverError::InvalidConfig(reason.into())
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            ResolverError::Stopped(_) => ErrorCode::ResolverStopped,
            ResolverError::InvalidConfig(_) => ErrorCode::InvalidConfig,
            ResolverError::ConfigLoad(_) => ErrorCode::ConfigLoadFailed,
            ResolverError::BackendNotSupported(_) => ErrorCode::BackendNotSupported,
            ResolverError::Source { .. } => ErrorCode::SourceUnavailable,
            ResolverError::Subscribe { .. } => ErrorCode::SubscribeFailed,
            ResolverError::Timeout { .. } => ErrorCode::SourceTimeout,
        }
    }

    /// 获取错误类别
    pub fn kind(&self) -> ErrorKind {
        self.code().kind()
    }

    /// 是否为暂时性错误（下一次触发会自动重试）
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl From<toml::de::Error> for ResolverError {
    fn from(err: toml::de::Error) -> Self {
        ResolverError::ConfigLoad(err.to_string())
    }
}

impl From<std::io::Error> for ResolverError {
    fn from(err: std::io::Error) -> Self {
        ResolverError::ConfigLoad(err.to_string())
    }
}
