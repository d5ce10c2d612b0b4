//! 变更源抽象和实现
//!
//! 变更源只提供两件事：全量列出某个服务的原始记录，以及"可能有变化"的信号。
//! 信号不携带数据，解析器收到信号后总是重新全量 `list`，从不增量应用事件。

pub mod memory;
pub mod static_list;

#[cfg(feature = "etcd")]
pub mod etcd;

#[cfg(feature = "consul")]
pub mod consul;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::discovery::instance::RawRecord;
use crate::error::SourceError;

pub use memory::MemorySource;
pub use static_list::StaticSource;

#[cfg(feature = "etcd")]
pub use etcd::EtcdSource;

#[cfg(feature = "consul")]
pub use consul::ConsulSource;

/// 变更信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeSignal {
    /// 注册中心中的记录可能发生了变化，经过防抖后重新求值
    Changed,
    /// 后端原生的重同步，不经防抖直接求值
    Resync,
}

/// 变更源 trait
///
/// 每种注册中心（etcd、consul、静态配置、内存）都需要实现这个 trait。
/// 注意：由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// 后端名称，用于日志和快照属性
    fn name(&self) -> &str;

    /// 列出服务的全部原始记录
    ///
    /// 返回的记录可以包含其它命名空间或协议的实例，过滤由解析器完成。
    async fn list(&self, service: &str) -> Result<Vec<RawRecord>, SourceError>;

    /// 订阅服务的变更信号
    async fn subscribe(&self, service: &str) -> Result<Subscription, SourceError>;
}

/// 一次订阅：信号接收端 + 取消句柄
///
/// `Drop` 时自动取消，后端应当在取消令牌触发后停止推送并释放资源。
#[derive(Debug)]
pub struct Subscription {
    signals: mpsc::Receiver<ChangeSignal>,
    cancel: CancellationToken,
    // 不推送信号的后端持有发送端，避免信号流被视为已关闭
    _keepalive: Option<mpsc::Sender<ChangeSignal>>,
}

impl Subscription {
    /// 创建订阅
    pub fn new(signals: mpsc::Receiver<ChangeSignal>, cancel: CancellationToken) -> Self {
        Self {
            signals,
            cancel,
            _keepalive: None,
        }
    }

    /// 创建一个永远不会推送信号的订阅（依赖解析器的周期重同步）
    pub fn silent() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            signals: rx,
            cancel: CancellationToken::new(),
            _keepalive: Some(tx),
        }
    }

    /// 接收下一个信号，`None` 表示信号流已结束
    pub async fn recv(&mut self) -> Option<ChangeSignal> {
        self.signals.recv().await
    }

    /// 取消订阅
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.signals.close();
    }
}
