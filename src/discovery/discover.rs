//! 消费端适配
//!
//! - `ChannelWatcher`: 把快照写入 `tokio::sync::watch`，只保留最新值，从不阻塞
//! - `EndpointDiscover`: 实现 `tower::discover::Discover`，把相邻两次快照的差异转换为
//!   `Change::Insert` / `Change::Remove`，可直接交给 tower 的负载均衡器

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tower::discover::Change;

use crate::discovery::endpoint::{Endpoint, State};
use crate::discovery::watcher::Watcher;

/// 写入 watch channel 的 Watcher
pub struct ChannelWatcher {
    tx: watch::Sender<Option<Arc<State>>>,
}

impl ChannelWatcher {
    /// 获取一个新的接收端
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<State>>> {
        self.tx.subscribe()
    }
}

impl Watcher for ChannelWatcher {
    fn update_state(&self, state: Arc<State>) {
        self.tx.send_replace(Some(state));
    }
}

/// 创建一对 `ChannelWatcher` 和接收端
pub fn state_channel() -> (Arc<ChannelWatcher>, watch::Receiver<Option<Arc<State>>>) {
    let (tx, rx) = watch::channel(None);
    (Arc::new(ChannelWatcher { tx }), rx)
}

/// 基于快照差异的 tower Discover 实现
///
/// 总是与最近一次看到的快照做比较，中间被丢弃或合并的快照不会造成状态不一致。
/// tower 0.5 的 Discover trait 通过 TryStream 自动实现。
pub struct EndpointDiscover {
    states: WatchStream<Option<Arc<State>>>,
    known: HashMap<String, Endpoint>,
    pending: VecDeque<Change<String, Endpoint>>,
    revision: u64,
}

impl EndpointDiscover {
    pub fn new(rx: watch::Receiver<Option<Arc<State>>>) -> Self {
        Self {
            states: WatchStream::new(rx),
            known: HashMap::new(),
            pending: VecDeque::new(),
            revision: 0,
        }
    }

    /// 最近一次处理的快照版本
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// 当前已知的端点数量
    pub fn len(&self) -> usize {
        self.known.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty()
    }

    fn apply(&mut self, state: &State) {
        self.revision = state.revision();
        let next: HashMap<String, Endpoint> = state
            .endpoints()
            .iter()
            .map(|e| (e.key(), e.clone()))
            .collect();

        let mut removed: Vec<&String> = self.known.keys().filter(|k| !next.contains_key(*k)).collect();
        removed.sort();
        for key in removed {
            self.pending.push_back(Change::Remove(key.clone()));
        }

        let mut inserted: Vec<(&String, &Endpoint)> = next
            .iter()
            .filter(|(k, e)| self.known.get(*k) != Some(*e))
            .collect();
        inserted.sort_by(|a, b| a.0.cmp(b.0));
        for (key, endpoint) in inserted {
            self.pending
                .push_back(Change::Insert(key.clone(), endpoint.clone()));
        }

        self.known = next;
    }
}

impl Stream for EndpointDiscover {
    type Item = Result<Change<String, Endpoint>, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(change) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(change)));
            }
            match this.states.poll_next_unpin(cx) {
                Poll::Ready(Some(Some(state))) => this.apply(&state),
                Poll::Ready(Some(None)) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
