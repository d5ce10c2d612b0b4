use serde::{Deserialize, Serialize};

use crate::discovery::config::{ResolverConfig, SourceConfig};
use crate::error::Result;

/// 配置文件的顶层结构
///
/// ```toml
/// [resolver]
/// namespace = "default"
/// protocols = ["grpc"]
/// debounce_ms = 200
///
/// [source]
/// backend = "etcd"
/// backend_config = { endpoints = ["http://127.0.0.1:2379"], prefix = "flare" }
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub source: SourceConfig,
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.resolver.validate()?;
        Ok(config)
    }
}
