//! 记录过滤
//!
//! 纯函数：同样的输入总是得到同样的输出，没有隐藏状态。
//! 不匹配的记录在共享命名空间里是正常现象，因此拒绝是静默的。

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use crate::discovery::endpoint::{Attributes, Endpoint};
use crate::discovery::instance::RawRecord;
use crate::error::{ResolverError, Result};

/// 过滤策略
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterPolicy {
    /// 命名空间（精确匹配，必填）
    pub namespace: String,

    /// 服务名（精确匹配）
    pub service_name: String,

    /// 允许的协议集合，为空时拒绝所有记录
    pub protocols: BTreeSet<String>,
}

impl FilterPolicy {
    /// 创建过滤策略
    pub fn new<I, S>(
        namespace: impl Into<String>,
        service_name: impl Into<String>,
        protocols: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespace: namespace.into(),
            service_name: service_name.into(),
            protocols: protocols.into_iter().map(Into::into).collect(),
        }
    }

    /// 校验必填项
    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(ResolverError::invalid_config("namespace must not be empty"));
        }
        if self.service_name.trim().is_empty() {
            return Err(ResolverError::invalid_config("service name must not be empty"));
        }
        if self.protocols.is_empty() {
            return Err(ResolverError::invalid_config(format!(
                "no protocols configured for service `{}`",
                self.service_name
            )));
        }
        Ok(())
    }
}

/// 将原始记录映射为端点，任何一项不匹配都会整体拒绝
///
/// 拒绝条件：命名空间不同、协议不在允许集合中、服务名不同，或地址无法规范化。
pub fn filter(record: &RawRecord, policy: &FilterPolicy) -> Option<Endpoint> {
    if record.namespace != policy.namespace {
        return None;
    }
    if !policy.protocols.contains(&record.protocol) {
        return None;
    }
    if record.service_name != policy.service_name {
        return None;
    }

    let attributes: Attributes = record
        .metadata
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();

    Endpoint::new(
        record.instance_id.clone(),
        record.protocol.clone(),
        &record.host,
        record.port,
        attributes,
    )
}
