//! 资源协调模块
//!
//! 一次协调：读取端点最新快照 → 决策 → 按决策签发、恢复或等待 → 给出下一次检查的时间。
//! 协调函数本身只返回结果，重试与重新入队由控制器根据错误类别决定。

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tlsacme_common::{decode_account_ref, CertificateInfo, Endpoint, EndpointKey, Error, Result};
use tlsacme_controller::utils::{format_duration, to_std};
use tlsacme_controller::{
    decide, AccountManager, AccountScope, Decision, DecisionPolicy, EndpointStore, Issuer,
    PassContext, RenewalScheduler,
};
use tracing::{debug, info};

use crate::metrics::Metrics;

/// 等待其他实例的租约过期后额外等待的时间
const LEASE_GRACE: Duration = Duration::from_secs(1);

/// 账户作用域默认值
#[derive(Debug, Clone)]
pub struct AccountDefaults {
    /// 账户 Secret 名称
    pub secret_name: String,
    /// 全局账户所在命名空间；为空时使用端点自身的命名空间
    pub namespace: Option<String>,
}

impl AccountDefaults {
    /// 端点使用的账户作用域
    ///
    /// 优先使用端点上的账户注解，其次是全局命名空间，最后是端点自身的命名空间。
    pub fn scope_for(&self, endpoint: &Endpoint) -> AccountScope {
        if let Some(account) = decode_account_ref(&endpoint.annotations) {
            return account.into();
        }
        let namespace = self
            .namespace
            .clone()
            .unwrap_or_else(|| endpoint.key.namespace.clone());
        AccountScope::new(namespace, self.secret_name.clone())
    }
}

/// 协调参数
#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// 决策参数
    pub policy: DecisionPolicy,
    /// 续期调度器
    pub scheduler: RenewalScheduler,
    /// 账户作用域默认值
    pub accounts: AccountDefaults,
}

/// 协调器结构体
pub struct Reconciler {
    store: Arc<dyn EndpointStore>,
    accounts: Arc<AccountManager>,
    issuer: Arc<Issuer>,
    settings: ReconcileSettings,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    /// 创建新的协调器
    pub fn new(
        store: Arc<dyn EndpointStore>,
        accounts: Arc<AccountManager>,
        issuer: Arc<Issuer>,
        settings: ReconcileSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            accounts,
            issuer,
            settings,
            metrics,
        }
    }

    /// 重新同步间隔
    pub fn resync_interval(&self) -> Duration {
        self.settings.scheduler.resync_interval()
    }

    /// 协调一个端点
    ///
    /// 返回下一次检查前的等待时间；端点未启用自动 TLS 时返回 None。
    pub async fn reconcile(&self, key: &EndpointKey, ctx: &PassContext) -> Result<Option<Duration>> {
        let endpoint = self
            .store
            .get(key)
            .await?
            .ok_or_else(|| Error::Gone(key.to_string()))?;

        let now = Utc::now();
        let decision = decide(&endpoint, self.issuer.owner_id(), now, &self.settings.policy);
        debug!("端点 {} 的决策: {:?}", key, decision);

        match decision {
            Decision::NoActionNeeded => Ok(self.next_check(&endpoint)),
            Decision::Paused => {
                debug!("端点 {} 已暂停", key);
                Ok(Some(self.resync_interval()))
            }
            Decision::WaitingOnChallenge(lock) => {
                let expires = lock.expires_at(self.settings.policy.lock_ttl);
                let wait = (to_std(expires - now) + LEASE_GRACE).min(self.resync_interval());
                info!(
                    "端点 {} 正由 {} 完成挑战，{} 后再检查",
                    key,
                    lock.owner,
                    format_duration(wait)
                );
                Ok(Some(wait))
            }
            Decision::ResumeChallenge(lock) => {
                endpoint.validate_for_issuance()?;
                let account = self
                    .accounts
                    .get_or_create(&self.settings.accounts.scope_for(&endpoint))
                    .await?;
                info!("端点 {} 恢复本实例未完成的挑战", key);
                let installed = self.issuer.resume(&endpoint, &lock, &account, ctx).await?;
                self.metrics.record_issued("resumed");
                Ok(self.next_check(&installed))
            }
            Decision::NeedsIssuance => {
                self.issue(&endpoint, "issuance", ctx).await
            }
            Decision::NeedsRenewal(reason) => {
                self.issue(&endpoint, reason.as_str(), ctx).await
            }
        }
    }

    async fn issue(&self, endpoint: &Endpoint, reason: &str, ctx: &PassContext) -> Result<Option<Duration>> {
        // 先拒绝无法承载证书的端点，避免为其注册账户
        endpoint.validate_for_issuance()?;
        let account = self
            .accounts
            .get_or_create(&self.settings.accounts.scope_for(endpoint))
            .await?;
        info!("端点 {} 开始签发证书（{}）", endpoint.key, reason);
        let installed = self.issuer.issue(endpoint, &account, ctx).await?;
        self.metrics.record_issued(reason);
        Ok(self.next_check(&installed))
    }

    fn next_check(&self, endpoint: &Endpoint) -> Option<Duration> {
        if !tlsacme_common::is_tls_acme_enabled(&endpoint.annotations) {
            return None;
        }
        let info = endpoint
            .certificate_pem()
            .and_then(|pem| CertificateInfo::from_pem(pem).ok());
        Some(
            self.settings
                .scheduler
                .next_check(info.as_ref(), Utc::now()),
        )
    }
}
