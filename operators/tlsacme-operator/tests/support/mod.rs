//! 场景测试的公共装配

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tlsacme_common::{Endpoint, EndpointKey, TLS_ACME_ANNOTATION};
use tlsacme_controller::testing::{FakeAcmeClient, InMemoryAccountStore, InMemoryEndpointStore};
use tlsacme_controller::TokenRegistry;
use tlsacme_operator::config::{create_default_config, OperatorConfig};
use tlsacme_operator::controller::Controller;
use tlsacme_operator::metrics::Metrics;
use tlsacme_operator::{build_controller, Wiring};

pub const OWNER: &str = "replica-a";
const WAIT_LIMIT: Duration = Duration::from_secs(15);

/// 测试用配置：轮询间隔缩短到毫秒级，重新同步间隔长于证书的续期时刻
pub fn test_config() -> OperatorConfig {
    let mut config = create_default_config();
    config.controller.workers = 2;
    config.controller.resync_interval_seconds = 100 * 86400;
    config.controller.pass_timeout_seconds = 10;
    config.controller.owner_id = Some(OWNER.to_string());
    config.backoff.initial_seconds = 1;
    config.backoff.max_seconds = 2;
    config.challenge.poll_initial_millis = 5;
    config.challenge.poll_max_millis = 20;
    config.challenge.ceiling_seconds = 10;
    config
}

pub struct Harness {
    pub store: Arc<InMemoryEndpointStore>,
    pub accounts: Arc<InMemoryAccountStore>,
    pub acme: Arc<FakeAcmeClient>,
    pub registry: TokenRegistry,
    pub metrics: Arc<Metrics>,
    pub controller: Arc<Controller>,
}

impl Harness {
    /// 组装并启动控制器
    pub fn start() -> Self {
        let registry = TokenRegistry::new();
        let store = Arc::new(InMemoryEndpointStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        let acme = Arc::new(FakeAcmeClient::new().with_registry(registry.clone()));
        let metrics = Arc::new(Metrics::new().expect("创建指标失败"));

        let wiring = Wiring {
            endpoints: store.clone(),
            accounts: accounts.clone(),
            acme: acme.clone(),
            publisher: Arc::new(registry.clone()),
        };
        let controller = build_controller(wiring, &test_config(), OWNER, metrics.clone());
        controller.start();

        Self {
            store,
            accounts,
            acme,
            registry,
            metrics,
            controller,
        }
    }

    /// 启用了自动 TLS 的端点
    pub fn route(name: &str, host: &str) -> Endpoint {
        let mut endpoint = Endpoint::new(EndpointKey::new("default", name), host);
        endpoint
            .annotations
            .insert(TLS_ACME_ANNOTATION.to_string(), "true".to_string());
        endpoint
    }

    /// 写入端点并通知控制器，模拟监听事件
    pub fn apply(&self, endpoint: Endpoint) -> EndpointKey {
        let key = endpoint.key.clone();
        self.store.insert(endpoint);
        self.controller.enqueue(key.clone());
        key
    }

    /// 删除端点并通知控制器
    pub fn delete(&self, key: &EndpointKey) {
        self.store.remove(key);
        self.controller.forget(key);
    }

    /// 等待端点满足条件
    pub async fn wait_for<F>(&self, key: &EndpointKey, what: &str, predicate: F) -> Endpoint
    where
        F: Fn(&Endpoint) -> bool,
    {
        let store = self.store.clone();
        let key = key.clone();
        wait_until(what, || {
            let store = store.clone();
            let key = key.clone();
            let ok = store.snapshot(&key).map_or(false, |e| predicate(&e));
            async move { ok }
        })
        .await;
        self.store.snapshot(&key).expect("端点不存在")
    }

    /// 等待控制器为端点安排下一次检查，返回剩余时间
    pub async fn wait_scheduled(&self, key: &EndpointKey) -> Duration {
        let controller = self.controller.clone();
        let watched = key.clone();
        wait_until("已安排下一次检查", || {
            let scheduled = controller.scheduled_in(&watched).is_some();
            async move { scheduled }
        })
        .await;
        self.controller.scheduled_in(key).expect("定时器不存在")
    }

    /// 等待所有协调结束
    pub async fn wait_idle(&self) {
        let metrics = self.metrics.clone();
        wait_until("没有进行中的协调", || {
            let idle = metrics.inflight() == 0;
            async move { idle }
        })
        .await;
    }

    pub async fn stop(self) {
        self.controller.stop().await;
    }
}

/// 断言两个时长相差不超过几秒
pub fn assert_close(actual: Duration, expected: Duration) {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff < Duration::from_secs(5),
        "实际 {:?}，期望 {:?}",
        actual,
        expected
    );
}

/// 轮询直到条件成立，超时则失败
pub async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        if condition().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("等待超时: {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
