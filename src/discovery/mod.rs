//! 服务解析模块
//!
//! 把注册中心的原始记录转换为客户端可用的端点快照：
//! 变更信号经过防抖后触发全量 List，过滤出命名空间和协议匹配的端点，
//! 生成带单调版本号的不可变 `State`，再以非阻塞方式扇出给所有 Watcher。

pub mod backend;
pub mod config;
pub mod debounce;
pub mod discover;
pub mod endpoint;
pub mod factory;
pub mod filter;
pub mod instance;
pub mod resolver;
pub mod snapshot;
pub mod watcher;

pub use backend::{ChangeSignal, ChangeSource, MemorySource, StaticSource, Subscription};
#[cfg(feature = "consul")]
pub use backend::ConsulSource;
#[cfg(feature = "etcd")]
pub use backend::EtcdSource;
pub use config::{BackendType, ResolverConfig, SourceConfig};
pub use debounce::{Debouncer, Trigger};
pub use discover::{ChannelWatcher, EndpointDiscover, state_channel};
pub use endpoint::{Attributes, Endpoint, State};
pub use factory::{ResolverFactory, SourceFactory};
pub use filter::{FilterPolicy, filter};
pub use instance::RawRecord;
pub use resolver::{Resolver, WatchState};
pub use snapshot::SnapshotBuilder;
pub use watcher::{FanoutReport, Watcher, WatcherRegistry};
