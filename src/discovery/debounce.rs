//! 防抖求值器
//!
//! 把一段时间内的大量变更信号合并成一次求值：
//! - 每个信号把截止时间重置为 `now + window`，截止时间到达且期间没有新信号时触发一次求值
//! - 求值进行中收到的信号只标记"需要补一次"，当前求值结束后立即补一次，不排队
//! - 强制触发（首次构建、重同步）不受防抖约束
//!
//! 状态只有几个标志位加一个截止时间，不维护事件队列。

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep_until};

/// 一次求值的触发原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// 首次 watch（或从 Idle 恢复）时的立即构建
    Initial,
    /// 防抖窗口内没有新信号
    Debounced,
    /// 上一次求值期间收到了信号
    CatchUp,
    /// 周期性或后端原生的重同步
    Resync,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Trigger::Initial => "initial",
            Trigger::Debounced => "debounced",
            Trigger::CatchUp => "catch-up",
            Trigger::Resync => "resync",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
struct DebounceState {
    deadline: Option<Instant>,
    forced: Option<Trigger>,
    catch_up: bool,
    in_flight: bool,
}

impl DebounceState {
    fn fire(&mut self, trigger: Trigger) -> Trigger {
        self.deadline = None;
        self.forced = None;
        self.catch_up = false;
        self.in_flight = true;
        trigger
    }
}

/// 单个服务的防抖求值器
///
/// 信号接收方（`signal`/`force`）从不等待求值；求值方通过 `next_trigger` 获取下一次触发，
/// 完成后调用 `complete`。同一时刻最多只有一次求值在进行。
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    state: Mutex<DebounceState>,
    notify: Notify,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            state: Mutex::new(DebounceState::default()),
            notify: Notify::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock(&self) -> MutexGuard<'_, DebounceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 记录一次变更信号
    pub fn signal(&self) {
        {
            let mut state = self.lock();
            if state.in_flight {
                state.catch_up = true;
            } else {
                state.deadline = Some(Instant::now() + self.window);
            }
        }
        self.notify.notify_one();
    }

    /// 请求一次不经防抖的求值
    pub fn force(&self, trigger: Trigger) {
        self.lock().forced.get_or_insert(trigger);
        self.notify.notify_one();
    }

    /// 是否有尚未开始的求值
    pub fn is_pending(&self) -> bool {
        let state = self.lock();
        state.deadline.is_some() || state.forced.is_some() || state.catch_up
    }

    /// 等待下一次触发，返回时标记为求值进行中
    pub async fn next_trigger(&self) -> Trigger {
        loop {
            let wait_until = {
                let mut state = self.lock();
                if let Some(trigger) = state.forced {
                    return state.fire(trigger);
                }
                if state.catch_up {
                    return state.fire(Trigger::CatchUp);
                }
                match state.deadline {
                    Some(deadline) if deadline <= Instant::now() => {
                        return state.fire(Trigger::Debounced);
                    }
                    other => other,
                }
            };

            match wait_until {
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }

    /// 当前求值结束
    pub fn complete(&self) {
        let catch_up = {
            let mut state = self.lock();
            state.in_flight = false;
            state.catch_up
        };
        if catch_up {
            self.notify.notify_one();
        }
    }
}
