//! 工作队列
//!
//! 按端点标识去重的协调队列：
//! - 同一个键在就绪队列中最多出现一次；
//! - 正在处理的键再次入队时只标记为脏，处理结束后重新入队，同一键永远不会被并发处理；
//! - 每个键最多挂一个延迟定时器，后设置的替换先设置的；
//! - 处于退避等待的键忽略普通入队请求，直到退避定时器触发。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tlsacme_common::EndpointKey;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// 键的调度状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    /// 没有待处理的工作（可能挂着计划检查）
    Idle,
    /// 已在就绪队列中
    Queued,
    /// 正在被某个工作者处理
    Processing,
    /// 失败后等待退避
    BackoffWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    /// 计划中的下一次检查
    Scheduled,
    /// 失败后的退避
    Backoff,
}

struct Timer {
    id: u64,
    kind: TimerKind,
    deadline: Instant,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<EndpointKey>,
    queued: HashSet<EndpointKey>,
    processing: HashSet<EndpointKey>,
    dirty: HashSet<EndpointKey>,
    timers: HashMap<EndpointKey, Timer>,
    next_timer: u64,
    shutdown: bool,
}

impl QueueState {
    fn in_backoff(&self, key: &EndpointKey) -> bool {
        self.timers
            .get(key)
            .map_or(false, |t| t.kind == TimerKind::Backoff)
    }

    /// 返回是否需要唤醒工作者
    fn enqueue(&mut self, key: EndpointKey) -> bool {
        if self.shutdown {
            return false;
        }
        if self.processing.contains(&key) {
            self.dirty.insert(key);
            return false;
        }
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
            return true;
        }
        false
    }
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // 临界区内不会 panic，中毒后继续使用内部状态
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 工作队列
#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue {
    /// 创建新的工作队列
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// 立即入队
    ///
    /// 键处于退避等待时忽略，由退避定时器负责重新入队。
    pub fn add(&self, key: EndpointKey) {
        let wake = {
            let mut state = self.shared.lock();
            if state.in_backoff(&key) {
                debug!("端点 {} 处于退避等待，忽略入队", key);
                return;
            }
            state.enqueue(key)
        };
        if wake {
            self.shared.notify.notify_one();
        }
    }

    /// 延迟入队，替换该键已有的定时器
    pub fn add_after(&self, key: EndpointKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        self.schedule(key, delay, TimerKind::Scheduled);
    }

    /// 失败后延迟入队，等待期间忽略普通入队请求
    pub fn add_rate_limited(&self, key: EndpointKey, delay: Duration) {
        self.schedule(key, delay, TimerKind::Backoff);
    }

    fn schedule(&self, key: EndpointKey, delay: Duration, kind: TimerKind) {
        let mut state = self.shared.lock();
        if state.shutdown {
            return;
        }
        state.next_timer += 1;
        let id = state.next_timer;
        let deadline = Instant::now() + delay;
        let shared = self.shared.clone();
        let timer_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let wake = {
                let mut state = shared.lock();
                // 已被替换的定时器不再生效
                if state.timers.get(&timer_key).map(|t| t.id) != Some(id) {
                    return;
                }
                state.timers.remove(&timer_key);
                state.enqueue(timer_key)
            };
            if wake {
                shared.notify.notify_one();
            }
        });
        if let Some(previous) = state.timers.insert(
            key,
            Timer {
                id,
                kind,
                deadline,
                handle,
            },
        ) {
            previous.handle.abort();
        }
    }

    /// 取出下一个键，队列关闭后返回 None
    ///
    /// 取出的键在调用 [`WorkQueue::done`] 之前不会再被交给其他工作者。
    pub async fn get(&self) -> Option<EndpointKey> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.ready.is_empty();
                    drop(state);
                    if more {
                        self.shared.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// 标记处理结束，处理期间被标脏的键重新入队
    pub fn done(&self, key: &EndpointKey) {
        let wake = {
            let mut state = self.shared.lock();
            state.processing.remove(key);
            if state.dirty.remove(key) && !state.in_backoff(key) {
                state.enqueue(key.clone())
            } else {
                false
            }
        };
        if wake {
            self.shared.notify.notify_one();
        }
    }

    /// 丢弃该键的所有待处理工作
    pub fn forget(&self, key: &EndpointKey) {
        let mut state = self.shared.lock();
        if let Some(timer) = state.timers.remove(key) {
            timer.handle.abort();
        }
        if state.queued.remove(key) {
            state.ready.retain(|k| k != key);
        }
        state.dirty.remove(key);
    }

    /// 关闭队列，唤醒所有等待的工作者
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            for (_, timer) in state.timers.drain() {
                timer.handle.abort();
            }
            state.ready.clear();
            state.queued.clear();
            state.dirty.clear();
        }
        self.shared.notify.notify_waiters();
    }

    /// 查询键的调度状态
    pub fn state(&self, key: &EndpointKey) -> KeyState {
        let state = self.shared.lock();
        if state.processing.contains(key) {
            KeyState::Processing
        } else if state.queued.contains(key) {
            KeyState::Queued
        } else if state.in_backoff(key) {
            KeyState::BackoffWait
        } else {
            KeyState::Idle
        }
    }

    /// 该键挂起的定时器距离触发的剩余时间
    pub fn scheduled_in(&self, key: &EndpointKey) -> Option<Duration> {
        self.shared
            .lock()
            .timers
            .get(key)
            .map(|t| t.deadline.saturating_duration_since(Instant::now()))
    }

    /// 就绪队列长度
    pub fn len(&self) -> usize {
        self.shared.lock().ready.len()
    }

    /// 就绪队列是否为空
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 挂起的定时器数量
    pub fn pending_timers(&self) -> usize {
        self.shared.lock().timers.len()
    }
}
