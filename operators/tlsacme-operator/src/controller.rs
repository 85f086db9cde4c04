//! 控制器模块
//!
//! 固定数量的工作者从工作队列中取键并执行协调，再根据结果决定何时重新入队：
//! - 成功：清零失败计数，在下一次检查时间重新入队；
//! - 版本冲突：立即重新入队，失败计数不变；
//! - 瞬时错误：按指数退避重新入队；
//! - 验证失败、致命错误：只在重新同步间隔后重试；
//! - 端点已删除：丢弃该键的全部状态。
//!
//! 另有一个后台任务按重新同步间隔列出全部端点并重新入队。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tlsacme_common::{is_tls_acme_enabled, EndpointKey, Error, ErrorKind, Result};
use tlsacme_controller::utils::{format_duration, Backoff};
use tlsacme_controller::{EndpointStore, PassContext};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;
use crate::queue::{KeyState, WorkQueue};
use crate::reconcile::Reconciler;

/// 协调超时后额外等待的时间，超过后直接丢弃协调
const BACKSTOP_GRACE: Duration = Duration::from_secs(30);

/// 控制器参数
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// 并发工作者数量
    pub workers: usize,
    /// 单次协调超时
    pub pass_timeout: Duration,
    /// 重新同步间隔
    pub resync_interval: Duration,
    /// 瞬时错误的重试退避
    pub backoff: Backoff,
}

/// 控制器结构体
pub struct Controller {
    /// 端点存储，用于重新同步
    store: Arc<dyn EndpointStore>,
    /// 协调器
    reconciler: Arc<Reconciler>,
    /// 工作队列
    queue: WorkQueue,
    /// 控制器参数
    settings: ControllerSettings,
    /// 指标
    metrics: Arc<Metrics>,
    /// 正在进行的协调及其取消令牌
    inflight: Mutex<HashMap<EndpointKey, CancellationToken>>,
    /// 连续的瞬时失败次数
    failures: Mutex<HashMap<EndpointKey, u32>>,
    /// 关闭信号
    shutdown: CancellationToken,
    /// 后台任务
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Controller {
    /// 创建新的控制器
    pub fn new(
        store: Arc<dyn EndpointStore>,
        reconciler: Arc<Reconciler>,
        settings: ControllerSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            reconciler,
            queue: WorkQueue::new(),
            settings,
            metrics,
            inflight: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// 启动工作者与重新同步任务
    pub fn start(self: &Arc<Self>) {
        let mut tasks = guard(&self.tasks);
        for id in 0..self.settings.workers.max(1) {
            let this = self.clone();
            tasks.push(tokio::spawn(async move { this.run_worker(id).await }));
        }
        let this = self.clone();
        tasks.push(tokio::spawn(async move { this.run_resync().await }));
        info!(
            "控制器已启动，{} 个工作者，重新同步间隔 {}",
            self.settings.workers.max(1),
            format_duration(self.settings.resync_interval)
        );
    }

    /// 停止控制器，取消进行中的协调并等待工作者退出
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.queue.shutdown();
        let tasks = std::mem::take(&mut *guard(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("控制器任务异常退出: {}", e);
                }
            }
        }
        info!("控制器已停止");
    }

    /// 请求协调端点
    pub fn enqueue(&self, key: EndpointKey) {
        self.queue.add(key);
        self.metrics.set_queue_depth(self.queue.len());
    }

    /// 端点已删除：取消进行中的协调并丢弃全部状态
    pub fn forget(&self, key: &EndpointKey) {
        if let Some(token) = guard(&self.inflight).get(key) {
            info!("端点 {} 已删除，取消进行中的协调", key);
            token.cancel();
        }
        self.queue.forget(key);
        guard(&self.failures).remove(key);
        self.metrics.set_queue_depth(self.queue.len());
    }

    /// 键的调度状态
    pub fn key_state(&self, key: &EndpointKey) -> KeyState {
        self.queue.state(key)
    }

    /// 键的下一次计划检查或退避重试的剩余时间
    pub fn scheduled_in(&self, key: &EndpointKey) -> Option<Duration> {
        self.queue.scheduled_in(key)
    }

    /// 键的连续瞬时失败次数
    pub fn failure_count(&self, key: &EndpointKey) -> u32 {
        guard(&self.failures).get(key).copied().unwrap_or(0)
    }

    /// 列出全部端点并把启用了自动 TLS 的端点重新入队，返回入队数量
    pub async fn resync(&self) -> usize {
        let endpoints = match self.store.list().await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                warn!("重新同步时列出端点失败: {}", e);
                return 0;
            }
        };
        let mut count = 0;
        for endpoint in endpoints {
            if is_tls_acme_enabled(&endpoint.annotations) {
                self.enqueue(endpoint.key);
                count += 1;
            }
        }
        debug!("重新同步：{} 个端点已入队", count);
        count
    }

    async fn run_worker(&self, id: usize) {
        debug!("工作者 {} 已启动", id);
        while let Some(key) = self.queue.get().await {
            self.metrics.set_queue_depth(self.queue.len());
            self.process(&key).await;
            self.queue.done(&key);
            self.metrics.set_queue_depth(self.queue.len());
        }
        debug!("工作者 {} 已退出", id);
    }

    async fn run_resync(&self) {
        let mut interval = tokio::time::interval(self.settings.resync_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 第一次触发是立即的，启动时的全量事件已覆盖
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.resync().await;
                }
            }
        }
    }

    async fn process(&self, key: &EndpointKey) {
        let token = self.shutdown.child_token();
        guard(&self.inflight).insert(key.clone(), token.clone());
        self.metrics.pass_started();

        let ctx = PassContext::new(token.clone(), Instant::now() + self.settings.pass_timeout);
        let backstop = self.settings.pass_timeout + BACKSTOP_GRACE;
        let result = match tokio::time::timeout(backstop, self.reconciler.reconcile(key, &ctx)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transient(format!(
                "端点 {} 的协调超过 {} 仍未结束",
                key,
                format_duration(backstop)
            ))),
        };

        self.metrics.pass_finished();
        guard(&self.inflight).remove(key);
        self.route(key, result, token.is_cancelled());
    }

    /// 按结果决定重新入队方式；必须在 `done` 之前调用
    fn route(&self, key: &EndpointKey, result: Result<Option<Duration>>, cancelled: bool) {
        let err = match result {
            Ok(next) => {
                self.metrics.record_pass(None);
                guard(&self.failures).remove(key);
                if let Some(delay) = next {
                    // 成功后的下一次检查至少间隔一个初始退避
                    let delay = delay.max(self.settings.backoff.initial);
                    debug!("端点 {} 将在 {} 后再次检查", key, format_duration(delay));
                    self.queue.add_after(key.clone(), delay);
                }
                return;
            }
            Err(e) => e,
        };

        let kind = err.kind();
        self.metrics.record_pass(Some(kind));
        if cancelled {
            debug!("端点 {} 的协调已取消: {}", key, err);
            return;
        }

        match kind {
            ErrorKind::Gone => {
                info!("端点 {} 已不存在，停止跟踪", key);
                self.queue.forget(key);
                guard(&self.failures).remove(key);
            }
            ErrorKind::Conflict => {
                debug!("端点 {} 版本冲突，立即重新协调: {}", key, err);
                self.queue.add(key.clone());
            }
            ErrorKind::Transient => {
                let attempt = {
                    let mut failures = guard(&self.failures);
                    let count = failures.entry(key.clone()).or_insert(0);
                    let attempt = *count;
                    *count = count.saturating_add(1);
                    attempt
                };
                let delay = self.settings.backoff.delay(attempt);
                warn!(
                    "端点 {} 协调失败（第 {} 次），{} 后重试: {}",
                    key,
                    attempt + 1,
                    format_duration(delay),
                    err
                );
                self.queue.add_rate_limited(key.clone(), delay);
            }
            ErrorKind::Invalid | ErrorKind::Fatal => {
                error!(
                    "端点 {} 协调失败，{} 后重新同步时再试: {}",
                    key,
                    format_duration(self.settings.resync_interval),
                    err
                );
                self.queue
                    .add_rate_limited(key.clone(), self.settings.resync_interval);
            }
        }
    }
}
