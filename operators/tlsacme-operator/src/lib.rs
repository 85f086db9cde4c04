//! TlsAcme Operator - 为 Route 自动签发与续期 ACME 证书
//!
//! 该模块把控制器核心组件与 Kubernetes 连接起来：Route 作为端点存储，Secret 作为
//! 账户存储，监听器把 Route 的变化送入工作队列，固定数量的工作者执行协调。
//! 多个副本可以同时运行，互斥完全依赖 Route 上的授权租约注解与资源版本。
//!
//! 挑战令牌只保存在发布它的进程内。多副本部署时，转发
//! `/.well-known/acme-challenge/` 的 Service 必须把请求送到持有授权租约的副本
//! （例如每个副本各自一个 Service 并按租约持有者切换），否则应只运行一个副本。
//! 请求落到其他副本时应答服务返回 404，ACME 服务端会判定授权失败。

pub mod config;
pub mod controller;
pub mod crd;
pub mod event_handler;
pub mod metrics;
pub mod queue;
pub mod reconcile;
pub mod store;

use anyhow::{Context, Result};
use kube::Client;
use std::sync::Arc;
use tlsacme_controller::challenge::ChallengeCoordinator;
use tlsacme_controller::{
    AccountManager, AccountScope, AccountStore, AcmeClient, ChallengeExposer, ChallengePublisher,
    EndpointStore, InstantAcmeClient, Issuer, TokenRegistry,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::OperatorConfig;
use crate::controller::{Controller, ControllerSettings};
use crate::event_handler::EventHandler;
use crate::metrics::Metrics;
use crate::reconcile::{AccountDefaults, ReconcileSettings, Reconciler};
use crate::store::{KubeEndpointStore, SecretAccountStore};

/// 控制器依赖的外部组件
pub struct Wiring {
    /// 端点存储
    pub endpoints: Arc<dyn EndpointStore>,
    /// 账户存储
    pub accounts: Arc<dyn AccountStore>,
    /// ACME 客户端
    pub acme: Arc<dyn AcmeClient>,
    /// 挑战应答发布者
    pub publisher: Arc<dyn ChallengePublisher>,
}

/// 按配置组装控制器
pub fn build_controller(
    wiring: Wiring,
    config: &OperatorConfig,
    owner_id: &str,
    metrics: Arc<Metrics>,
) -> Arc<Controller> {
    let accounts = Arc::new(AccountManager::new(
        wiring.accounts,
        wiring.acme.clone(),
        config.acme.contacts.clone(),
    ));
    let coordinator = Arc::new(ChallengeCoordinator::new(
        wiring.acme.clone(),
        wiring.publisher,
        config.challenge_timings(),
    ));
    let issuer = Arc::new(Issuer::new(
        wiring.endpoints.clone(),
        wiring.acme,
        coordinator,
        owner_id,
    ));
    let settings = ReconcileSettings {
        policy: config.decision_policy(),
        scheduler: config.scheduler(),
        accounts: AccountDefaults {
            secret_name: config.acme.account_secret_name.clone(),
            namespace: config.acme.account_namespace.clone(),
        },
    };
    let reconciler = Arc::new(Reconciler::new(
        wiring.endpoints.clone(),
        accounts,
        issuer,
        settings,
        metrics.clone(),
    ));
    Arc::new(Controller::new(
        wiring.endpoints,
        reconciler,
        ControllerSettings {
            workers: config.controller.workers,
            pass_timeout: config.pass_timeout(),
            resync_interval: config.resync_interval(),
            backoff: config.backoff(),
        },
        metrics,
    ))
}

/// Operator 主结构体
pub struct TlsAcmeOperator {
    /// 配置
    config: OperatorConfig,
    /// 控制器
    controller: Arc<Controller>,
    /// 事件处理器
    event_handler: EventHandler,
    /// 令牌表，由应答服务读取；仅包含本进程发布的令牌
    registry: TokenRegistry,
    /// 指标
    metrics: Arc<Metrics>,
    /// 应答服务与指标服务的关闭信号
    shutdown: CancellationToken,
    /// 后台任务
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TlsAcmeOperator {
    /// 创建新的 Operator 实例
    pub async fn new(config: OperatorConfig) -> Result<Self> {
        let client = Client::try_default()
            .await
            .context("创建 Kubernetes 客户端失败")?;
        let registry = TokenRegistry::new();
        let metrics = Arc::new(Metrics::new()?);
        let owner_id = config.owner_id();
        info!("租约持有者标识: {}", owner_id);

        let wiring = Wiring {
            endpoints: Arc::new(KubeEndpointStore::new(
                client.clone(),
                config.controller.namespaces.clone(),
            )),
            accounts: Arc::new(SecretAccountStore::new(client.clone())),
            acme: Arc::new(InstantAcmeClient::new(config.acme.directory_url.clone())),
            publisher: Arc::new(registry.clone()),
        };
        let controller = build_controller(wiring, &config, &owner_id, metrics.clone());
        let event_handler = EventHandler::new(
            client,
            config.controller.namespaces.clone(),
            controller.clone(),
        );

        Ok(Self {
            config,
            controller,
            event_handler,
            registry,
            metrics,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// 启动 Operator
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;

        let exposer = ChallengeExposer::new(self.registry.clone(), self.config.challenge_addr()?);
        let (_, handle) = exposer
            .spawn(self.shutdown.clone())
            .context("启动挑战应答服务失败")?;
        tasks.push(handle);

        let (_, handle) = metrics::spawn_server(
            self.metrics.clone(),
            self.config.metrics_addr()?,
            self.shutdown.clone(),
        )?;
        tasks.push(handle);

        self.controller.start();
        tasks.extend(self.event_handler.start());

        info!("TlsAcme Operator 已启动");
        Ok(())
    }

    /// 停止 Operator
    pub async fn stop(&self) -> Result<()> {
        self.event_handler.stop();
        self.controller.stop().await;
        self.shutdown.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                error!("后台任务异常退出: {}", e);
            }
        }
        info!("TlsAcme Operator 已停止");
        Ok(())
    }
}

/// 注销账户并删除其 Secret
///
/// 返回 ACME 服务端是否确认了注销。instant-acme 不支持账户注销请求，
/// 因此使用该客户端时只会删除 Secret，服务端上的账户保持有效。
pub async fn deactivate_account(config: &OperatorConfig, scope: &AccountScope) -> Result<bool> {
    let client = Client::try_default()
        .await
        .context("创建 Kubernetes 客户端失败")?;
    let manager = AccountManager::new(
        Arc::new(SecretAccountStore::new(client)),
        Arc::new(InstantAcmeClient::new(config.acme.directory_url.clone())),
        config.acme.contacts.clone(),
    );
    manager
        .deactivate(scope)
        .await
        .with_context(|| format!("注销账户 {} 失败", scope))
}
