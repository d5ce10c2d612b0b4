//! 错误代码和错误类别定义
//!
//! 错误代码按类别分组，每个类别占用1000个代码范围：
//! - 1000-1999: 配置相关错误
//! - 2000-2999: 变更源（注册中心）相关错误
//! - 3000-3999: 解析器生命周期相关错误

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 配置相关错误 (1000-1999)
    // ============================================================
    InvalidConfig = 1000,
    ConfigLoadFailed = 1001,
    BackendNotSupported = 1002,

    // ============================================================
    // 变更源相关错误 (2000-2999)
    // ============================================================
    SourceUnavailable = 2000,
    SourceTimeout = 2001,
    SubscribeFailed = 2002,

    // ============================================================
    // 生命周期相关错误 (3000-3999)
    // ============================================================
    ResolverStopped = 3000,
}

impl ErrorCode {
    /// 获取错误代码的数字值
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 获取错误代码的英文标识符
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::ConfigLoadFailed => "CONFIG_LOAD_FAILED",
            ErrorCode::BackendNotSupported => "BACKEND_NOT_SUPPORTED",
            ErrorCode::SourceUnavailable => "SOURCE_UNAVAILABLE",
            ErrorCode::SourceTimeout => "SOURCE_TIMEOUT",
            ErrorCode::SubscribeFailed => "SUBSCRIBE_FAILED",
            ErrorCode::ResolverStopped => "RESOLVER_STOPPED",
        }
    }

    /// 获取错误类别
    pub fn kind(&self) -> ErrorKind {
        match self.as_u32() {
            1000..=1999 => ErrorKind::Configuration,
            2000..=2999 => ErrorKind::Transient,
            _ => ErrorKind::Terminal,
        }
    }

    /// 判断是否会在下一次触发（信号或重同步）时自动重试
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 错误类别
///
/// - `Transient`: 变更源暂时不可用，保留上一次的快照，下一次触发自动重试
/// - `Configuration`: 配置错误，在 `add_watch` 时同步返回，不重试
/// - `Terminal`: 解析器已停止
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Transient,
    Configuration,
    Terminal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "TRANSIENT"),
            ErrorKind::Configuration => write!(f, "CONFIGURATION"),
            ErrorKind::Terminal => write!(f, "TERMINAL"),
        }
    }
}
