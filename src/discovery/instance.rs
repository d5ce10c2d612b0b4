//! 注册中心原始记录定义

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 注册中心中的一条原始实例记录
///
/// 由变更源（`ChangeSource::list`）产出，每次求值只消费一次，不会被保留。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawRecord {
    /// 所属服务名
    pub service_name: String,

    /// 命名空间
    pub namespace: String,

    /// 协议（如 "grpc", "http"）
    pub protocol: String,

    /// 主机（IP 或域名，IPv6 可带或不带方括号）
    pub host: String,

    /// 端口
    pub port: u16,

    /// 实例 ID，为空时端点名称由地址派生
    #[serde(default)]
    pub instance_id: String,

    /// 元数据（如节点名、可用区、Pod 名）
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RawRecord {
    /// 创建新的原始记录
    pub fn new(
        service_name: impl Into<String>,
        namespace: impl Into<String>,
        protocol: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            namespace: namespace.into(),
            protocol: protocol.into(),
            host: host.into(),
            port,
            instance_id: String::new(),
            metadata: HashMap::new(),
        }
    }

    /// 从 `host:port` 形式的地址创建记录，支持 `[::1]:8080`
    pub fn from_address(
        service_name: impl Into<String>,
        namespace: impl Into<String>,
        protocol: impl Into<String>,
        address: &str,
    ) -> Option<Self> {
        let (host, port) = split_host_port(address)?;
        Some(Self::new(service_name, namespace, protocol, host, port))
    }

    /// 设置实例 ID
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// 拆分 `host:port`，IPv6 地址必须带方括号
pub fn split_host_port(address: &str) -> Option<(String, u16)> {
    let address = address.trim();
    let (host, port) = if let Some(rest) = address.strip_prefix('[') {
        let (host, rest) = rest.split_once(']')?;
        (host, rest.strip_prefix(':')?)
    } else {
        address.rsplit_once(':')?
    };
    if host.is_empty() || (host.contains(':') && !address.starts_with('[')) {
        return None;
    }
    let port = port.parse::<u16>().ok()?;
    Some((host.to_string(), port))
}
