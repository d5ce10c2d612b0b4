//! 变更源与解析器工厂
//!
//! 提供从配置构建的方法，以及使用默认配置的快速构建方法

use serde_json::json;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::discovery::backend::{ChangeSource, MemorySource, StaticSource};
use crate::discovery::config::{BackendType, ResolverConfig, SourceConfig};
use crate::discovery::resolver::Resolver;
use crate::error::{ResolverError, Result};

/// 变更源工厂
pub struct SourceFactory;

impl SourceFactory {
    /// 从配置创建变更源
    ///
    /// etcd 和 consul 需要启用对应的 feature，否则返回 `BackendNotSupported`。
    pub async fn create_source(config: &SourceConfig) -> Result<Arc<dyn ChangeSource>> {
        match config.backend {
            BackendType::Memory => Ok(Arc::new(MemorySource::new())),
            BackendType::Static => Ok(Arc::new(StaticSource::from_config(config)?)),
            #[cfg(feature = "etcd")]
            BackendType::Etcd => {
                let source = crate::discovery::backend::EtcdSource::new(config).await?;
                Ok(Arc::new(source))
            }
            #[cfg(feature = "consul")]
            BackendType::Consul => {
                let source = crate::discovery::backend::ConsulSource::new(config)?;
                Ok(Arc::new(source))
            }
            #[allow(unreachable_patterns)]
            other => Err(ResolverError::BackendNotSupported(format!(
                "{} (enable the `{}` feature)",
                other, other
            ))),
        }
    }
}

/// 解析器工厂
pub struct ResolverFactory;

impl ResolverFactory {
    /// 从完整配置创建解析器
    pub async fn create_resolver(name: impl Into<String>, config: &Config) -> Result<Resolver> {
        config.resolver.validate()?;
        let source = SourceFactory::create_source(&config.source).await?;
        let name = name.into();
        info!(
            resolver = %name,
            backend = %config.source.backend,
            namespace = %config.resolver.namespace,
            "Resolver created"
        );
        Ok(Resolver::new(name, source, config.resolver.clone()))
    }

    /// 使用默认配置创建解析器
    ///
    /// # 参数
    /// * `backend_type` - 后端类型
    /// * `backend_endpoints` - 后端地址列表（etcd 为 endpoints，consul 取第一个作为 url）
    /// * `namespace` - 命名空间
    /// * `protocols` - 允许的协议
    ///
    /// # 默认配置
    /// - 防抖窗口：200 毫秒
    /// - 重同步间隔：30 秒
    /// - List 超时：3 秒
    pub async fn create_with_defaults(
        backend_type: BackendType,
        backend_endpoints: Vec<String>,
        namespace: impl Into<String>,
        protocols: Vec<String>,
    ) -> Result<Resolver> {
        let mut source = SourceConfig::new(backend_type);
        match backend_type {
            BackendType::Etcd => {
                source = source.with_option("endpoints", json!(backend_endpoints));
            }
            BackendType::Consul => {
                if let Some(url) = backend_endpoints.first() {
                    source = source.with_option("url", json!(url));
                }
            }
            BackendType::Memory | BackendType::Static => {}
        }

        let config = Config {
            resolver: ResolverConfig::new(namespace, protocols),
            source,
        };
        let name = backend_type.to_string();
        Self::create_resolver(name, &config).await
    }
}
