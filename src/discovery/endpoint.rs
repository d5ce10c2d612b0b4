//! 端点与快照定义
//!
//! `Endpoint` 和 `State` 一经构建便不可变。同一次求值产出的 `State` 通过 `Arc`
//! 共享给所有 Watcher，不会出现各自分叉的副本。

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};

/// 端点属性（顺序无关）
pub type Attributes = BTreeMap<String, Value>;

/// 可达端点
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    name: String,
    protocol: String,
    address: String,
    attributes: Attributes,
}

impl Endpoint {
    /// 创建端点，地址会被规范化（IPv6 带方括号、域名小写）
    ///
    /// `name` 为空时由地址派生。主机为空时返回 `None`。
    pub fn new(
        name: impl Into<String>,
        protocol: impl Into<String>,
        host: &str,
        port: u16,
        attributes: Attributes,
    ) -> Option<Self> {
        let address = normalize_address(host, port)?;
        let name = name.into();
        Some(Self {
            name: if name.is_empty() { address.clone() } else { name },
            protocol: protocol.into(),
            address,
            attributes,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// 获取字符串属性
    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    /// 端点在集合中的唯一键：`protocol://address`
    pub fn key(&self) -> String {
        format!("{}://{}", self.protocol, self.address)
    }
}

/// 结构相等：协议 + 地址 + 属性，名称不参与比较
impl PartialEq for Endpoint {
    fn eq(&self, other: &Self) -> bool {
        self.protocol == other.protocol
            && self.address == other.address
            && self.attributes == other.attributes
    }
}

impl Eq for Endpoint {}

/// 规范化 `host:port`
///
/// - IP 地址按标准格式输出，IPv6 带方括号（`[fe80::1]:443`）
/// - 域名去除首尾空白、末尾的点并转为小写
pub fn normalize_address(host: &str, port: u16) -> Option<String> {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return None;
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port).to_string());
    }
    let host = host.trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() || host.contains(':') {
        return None;
    }
    Some(format!("{}:{}", host, port))
}

/// 服务端点快照
///
/// `revision` 按服务单调递增，每次成功构建加一，即使端点集合没有变化。
#[derive(Debug, Serialize)]
pub struct State {
    endpoints: Vec<Endpoint>,
    revision: u64,
    attributes: Attributes,
}

impl State {
    pub(crate) fn new(endpoints: Vec<Endpoint>, revision: u64, attributes: Attributes) -> Self {
        Self {
            endpoints,
            revision,
            attributes,
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// 全局属性（来源、服务名、构建时间等）
    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// 所有端点的键，已排序
    pub fn endpoint_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.endpoints.iter().map(Endpoint::key).collect();
        keys.sort();
        keys
    }

    /// 无序的结构比较
    ///
    /// 仅供消费方或测试判断内容是否变化，解析器的投递从不以此为条件。
    pub fn same_endpoints(&self, other: &State) -> bool {
        if self.endpoints.len() != other.endpoints.len() {
            return false;
        }
        let mut unmatched: Vec<&Endpoint> = other.endpoints.iter().collect();
        for endpoint in &self.endpoints {
            match unmatched.iter().position(|candidate| *candidate == endpoint) {
                Some(idx) => {
                    unmatched.swap_remove(idx);
                }
                None => return false,
            }
        }
        true
    }

    /// 按键查找端点集合中的新增项
    pub fn added_since(&self, previous: &State) -> Vec<&Endpoint> {
        let before: HashSet<String> = previous.endpoints.iter().map(Endpoint::key).collect();
        self.endpoints
            .iter()
            .filter(|e| !before.contains(&e.key()))
            .collect()
    }
}
