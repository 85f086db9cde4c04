//! 签发流程
//!
//! 一次签发：获取租约 → 创建（或恢复）订单 → 把订单写入租约 → 挑战协调 →
//! 重新读取并校验 → 在同一次条件写入中安装证书并清除租约。
//! 失败时释放租约；端点被删除导致的取消不做任何写入。

use chrono::Utc;
use std::sync::Arc;
use tlsacme_common::{
    clear_lock, decode_lock, encode_lock, AuthorizationLock, CertificateBundle, CertificateInfo,
    Endpoint, EndpointKey, Error, Result,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acme::{AcmeAccount, AcmeClient, OrderHandle, OrderStatus};
use crate::challenge::ChallengeCoordinator;
use crate::store::EndpointStore;

/// 冲突重读上限
const MAX_WRITE_ATTEMPTS: u32 = 5;

/// 单次协调的上下文
#[derive(Debug, Clone)]
pub struct PassContext {
    /// 端点删除或控制器关闭时触发
    pub cancel: CancellationToken,
    /// 本次协调的截止时间
    pub deadline: Instant,
}

impl PassContext {
    /// 创建新的上下文
    pub fn new(cancel: CancellationToken, deadline: Instant) -> Self {
        Self { cancel, deadline }
    }
}

/// 签发器
pub struct Issuer {
    store: Arc<dyn EndpointStore>,
    client: Arc<dyn AcmeClient>,
    coordinator: Arc<ChallengeCoordinator>,
    owner_id: String,
}

impl Issuer {
    /// 创建新的签发器
    pub fn new(
        store: Arc<dyn EndpointStore>,
        client: Arc<dyn AcmeClient>,
        coordinator: Arc<ChallengeCoordinator>,
        owner_id: impl Into<String>,
    ) -> Self {
        Self {
            store,
            client,
            coordinator,
            owner_id: owner_id.into(),
        }
    }

    /// 本实例的租约持有者标识
    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// 以快照的资源版本为前提写入租约
    ///
    /// 快照已过期时返回 `Conflict`，调用方应放弃本次协调。
    pub async fn acquire_lock(&self, endpoint: &Endpoint, lock: &AuthorizationLock) -> Result<Endpoint> {
        let mut locked = endpoint.clone();
        encode_lock(lock, &mut locked.annotations);
        let updated = self.store.update(&locked).await?;
        debug!("已获取端点 {} 的授权租约", endpoint.key);
        Ok(updated)
    }

    /// 为端点签发新证书
    pub async fn issue(
        &self,
        endpoint: &Endpoint,
        account: &AcmeAccount,
        ctx: &PassContext,
    ) -> Result<Endpoint> {
        endpoint.validate_for_issuance()?;
        let lock = AuthorizationLock::new(self.owner_id.clone(), Utc::now());
        let locked = self.acquire_lock(endpoint, &lock).await?;

        let outcome = self.run(locked, lock, account, None, ctx).await;
        self.finish(&endpoint.key, outcome, ctx).await
    }

    /// 继续本实例此前中断的签发
    pub async fn resume(
        &self,
        endpoint: &Endpoint,
        previous: &AuthorizationLock,
        account: &AcmeAccount,
        ctx: &PassContext,
    ) -> Result<Endpoint> {
        endpoint.validate_for_issuance()?;

        // 续租，同时确认快照仍是最新
        let lock = AuthorizationLock {
            acquired_at: Utc::now(),
            ..previous.clone()
        };
        let locked = self.acquire_lock(endpoint, &lock).await?;

        let existing = match &previous.order_url {
            Some(url) => self.reusable_order(account, url).await,
            None => Ok(None),
        };
        let outcome = match existing {
            Ok(existing) => self.run(locked, lock, account, existing, ctx).await,
            Err(e) => Err(e),
        };
        self.finish(&endpoint.key, outcome, ctx).await
    }

    async fn reusable_order(&self, account: &AcmeAccount, url: &str) -> Result<Option<OrderHandle>> {
        match self.client.poll_order(account, url).await {
            Ok(order) if matches!(order.status, OrderStatus::Pending | OrderStatus::Ready) => {
                info!("恢复订单 {}", url);
                Ok(Some(order))
            }
            Ok(order) => {
                debug!("订单 {} 状态为 {:?}，改为创建新订单", url, order.status);
                Ok(None)
            }
            Err(e) if e.kind() == tlsacme_common::ErrorKind::Invalid => {
                debug!("订单 {} 已不可用: {}", url, e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn run(
        &self,
        locked: Endpoint,
        lock: AuthorizationLock,
        account: &AcmeAccount,
        existing: Option<OrderHandle>,
        ctx: &PassContext,
    ) -> Result<Endpoint> {
        let domains = locked.domains()?;

        let order = match existing {
            Some(order) => order,
            None => self.client.create_order(account, &domains).await?,
        };

        let lock = lock.with_order(order.url.clone(), order.authorizations.first().cloned());
        let locked = self.acquire_lock(&locked, &lock).await?;
        info!("端点 {} 开始完成订单 {}", locked.key, order.url);

        let bundle = self
            .coordinator
            .complete(account, &order, &domains, &ctx.cancel, ctx.deadline)
            .await?;

        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled(format!("端点 {} 的协调已取消", locked.key)));
        }
        self.install(&locked.key, &domains, &bundle).await
    }

    /// 校验证书并在同一次写入中安装证书、清除租约
    async fn install(
        &self,
        key: &EndpointKey,
        domains: &[String],
        bundle: &CertificateBundle,
    ) -> Result<Endpoint> {
        let info = CertificateInfo::from_pem(&bundle.certificate_pem)?;
        let now = Utc::now();
        if !info.is_valid_at(now) {
            return Err(Error::Invalid(format!(
                "签发的证书不在有效期内: {} ~ {}",
                info.not_before, info.not_after
            )));
        }
        if !info.covers(domains) {
            return Err(Error::Invalid(format!(
                "签发的证书未覆盖 {:?}: {:?}",
                domains, info.domains
            )));
        }

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let mut current = self
                .store
                .get(key)
                .await?
                .ok_or_else(|| Error::Gone(key.to_string()))?;

            match decode_lock(&current.annotations) {
                Some(lock) if lock.is_owned_by(&self.owner_id) => {}
                _ => {
                    return Err(Error::Conflict(format!("端点 {} 的授权租约已丢失", key)));
                }
            }
            if current.domains()? != domains {
                return Err(Error::Conflict(format!("端点 {} 的主机名在签发期间被修改", key)));
            }

            current.install_certificate(&bundle.certificate_pem, &bundle.private_key_pem);
            clear_lock(&mut current.annotations);
            match self.store.update(&current).await {
                Ok(updated) => {
                    info!(
                        "端点 {} 已安装新证书，有效期至 {}",
                        key, info.not_after
                    );
                    return Ok(updated);
                }
                Err(e) if e.is_conflict() => {
                    debug!("安装证书时发生版本冲突（第 {} 次），重新读取端点 {}", attempt, key);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!("端点 {} 安装证书时冲突次数过多", key)))
    }

    async fn finish(
        &self,
        key: &EndpointKey,
        outcome: Result<Endpoint>,
        ctx: &PassContext,
    ) -> Result<Endpoint> {
        let err = match outcome {
            Ok(endpoint) => return Ok(endpoint),
            Err(e) => e,
        };
        if ctx.cancel.is_cancelled() || err.is_gone() {
            debug!("端点 {} 的协调已放弃，不再写入", key);
            return Err(err);
        }
        if let Err(release) = self.release_lock(key).await {
            warn!("释放端点 {} 的授权租约失败: {}", key, release);
        }
        Err(err)
    }

    /// 释放本实例持有的租约
    pub async fn release_lock(&self, key: &EndpointKey) -> Result<()> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let mut current = match self.store.get(key).await? {
                Some(current) => current,
                None => return Ok(()),
            };
            match decode_lock(&current.annotations) {
                Some(lock) if lock.is_owned_by(&self.owner_id) => {}
                _ => return Ok(()),
            }
            clear_lock(&mut current.annotations);
            match self.store.update(&current).await {
                Ok(_) => {
                    debug!("已释放端点 {} 的授权租约", key);
                    return Ok(());
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) if e.is_gone() => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        Err(Error::Conflict(format!("释放端点 {} 的授权租约时冲突次数过多", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::{AccountScope, AccountStatus};
    use crate::challenge::{ChallengeTimings, TokenRegistry};
    use crate::testing::{AuthorizationOutcome, FakeAcmeClient, InMemoryEndpointStore};
    use crate::utils::Backoff;
    use std::time::Duration;
    use tlsacme_common::{ErrorKind, TLS_ACME_ANNOTATION};

    struct Fixture {
        store: Arc<InMemoryEndpointStore>,
        client: Arc<FakeAcmeClient>,
        registry: TokenRegistry,
        issuer: Issuer,
    }

    fn fixture(owner: &str) -> Fixture {
        let store = Arc::new(InMemoryEndpointStore::new());
        let registry = TokenRegistry::new();
        let client = Arc::new(FakeAcmeClient::new().with_registry(registry.clone()));
        let coordinator = Arc::new(ChallengeCoordinator::new(
            client.clone(),
            Arc::new(registry.clone()),
            ChallengeTimings {
                poll: Backoff::exact(Duration::from_millis(5), Duration::from_millis(20), 2.0),
                ceiling: Duration::from_secs(5),
            },
        ));
        let issuer = Issuer::new(store.clone(), client.clone(), coordinator, owner);
        Fixture {
            store,
            client,
            registry,
            issuer,
        }
    }

    fn account() -> AcmeAccount {
        AcmeAccount {
            scope: AccountScope::new("default", "acme-account"),
            url: "https://acme.test/acct/1".into(),
            contact: vec![],
            credentials: "{}".into(),
            status: AccountStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn ctx() -> PassContext {
        PassContext::new(CancellationToken::new(), Instant::now() + Duration::from_secs(5))
    }

    fn route(host: &str) -> Endpoint {
        let mut endpoint = Endpoint::new(EndpointKey::new("default", "web"), host);
        endpoint
            .annotations
            .insert(TLS_ACME_ANNOTATION.into(), "true".into());
        endpoint
    }

    #[tokio::test]
    async fn test_issue_installs_certificate_and_clears_lock() {
        let f = fixture("replica-a");
        let snapshot = f.store.insert(route("app.example.com"));

        let installed = f.issuer.issue(&snapshot, &account(), &ctx()).await.unwrap();

        assert!(decode_lock(&installed.annotations).is_none());
        let info = CertificateInfo::from_pem(installed.certificate_pem().unwrap()).unwrap();
        assert!(info.covers(&["app.example.com".to_string()]));
        assert_eq!(installed.tls.as_ref().unwrap().termination, "edge");
        assert!(f.registry.is_empty());
        assert_eq!(f.store.get(&snapshot.key).await.unwrap(), Some(installed));
    }

    #[tokio::test]
    async fn test_lock_exclusivity() {
        let a = fixture("replica-a");
        let snapshot = a.store.insert(route("app.example.com"));
        let b = Issuer::new(
            a.store.clone(),
            a.client.clone(),
            Arc::new(ChallengeCoordinator::new(
                a.client.clone(),
                Arc::new(a.registry.clone()),
                ChallengeTimings::default(),
            )),
            "replica-b",
        );

        let now = Utc::now();
        let first = a
            .issuer
            .acquire_lock(&snapshot, &AuthorizationLock::new("replica-a", now))
            .await;
        let second = b
            .acquire_lock(&snapshot, &AuthorizationLock::new("replica-b", now))
            .await;

        assert!(first.is_ok());
        assert_eq!(second.unwrap_err().kind(), ErrorKind::Conflict);

        let reread = a.store.get(&snapshot.key).await.unwrap().unwrap();
        let decision = crate::certificate::decide(
            &reread,
            "replica-b",
            now,
            &crate::certificate::DecisionPolicy::default(),
        );
        assert!(matches!(
            decision,
            crate::certificate::Decision::WaitingOnChallenge(ref lock) if lock.owner == "replica-a"
        ));
    }

    #[tokio::test]
    async fn test_invalid_authorization_releases_lock() {
        let f = fixture("replica-a");
        f.client.set_outcome(AuthorizationOutcome::Invalid);
        let snapshot = f.store.insert(route("app.example.com"));

        let err = f.issuer.issue(&snapshot, &account(), &ctx()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Invalid);
        let current = f.store.get(&snapshot.key).await.unwrap().unwrap();
        assert!(decode_lock(&current.annotations).is_none());
        assert!(current.certificate_pem().is_none());
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_lease_records_order() {
        let f = fixture("replica-a");
        f.client.set_outcome(AuthorizationOutcome::Pending);
        let snapshot = f.store.insert(route("app.example.com"));

        let ctx = PassContext::new(CancellationToken::new(), Instant::now() + Duration::from_millis(100));
        let store = f.store.clone();
        let key = snapshot.key.clone();

        // 在挑战进行中观察租约
        let observer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.get(&key).await.unwrap().unwrap()
        });
        let err = f.issuer.issue(&snapshot, &account(), &ctx).await.unwrap_err();
        let during = observer.await.unwrap();

        let lock = decode_lock(&during.annotations).unwrap();
        assert_eq!(lock.owner, "replica-a");
        assert_eq!(lock.order_url.as_deref(), Some("https://acme.test/order/1"));
        assert_eq!(lock.authorization_url.as_deref(), Some("https://acme.test/authz/1-0"));

        // 截止时间到达后租约被释放
        assert_eq!(err.kind(), ErrorKind::Transient);
        let after = f.store.get(&snapshot.key).await.unwrap().unwrap();
        assert!(decode_lock(&after.annotations).is_none());
    }

    #[tokio::test]
    async fn test_cancelled_pass_writes_nothing() {
        let f = fixture("replica-a");
        f.client.set_outcome(AuthorizationOutcome::Pending);
        let snapshot = f.store.insert(route("app.example.com"));

        let ctx = ctx();
        let cancel = ctx.cancel.clone();
        let store = f.store.clone();
        let key = snapshot.key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            store.remove(&key);
            cancel.cancel();
        });

        let writes_before = f.store.update_count();
        let err = f.issuer.issue(&snapshot, &account(), &ctx).await.unwrap_err();

        assert!(matches!(err, Error::Cancelled(_)));
        // 只有获取租约与记录订单两次写入
        assert_eq!(f.store.update_count() - writes_before, 2);
        assert!(f.registry.is_empty());
    }

    #[tokio::test]
    async fn test_resume_reuses_recorded_order() {
        let f = fixture("replica-a");
        let snapshot = f.store.insert(route("app.example.com"));

        let order = f
            .client
            .create_order(&account(), &["app.example.com".to_string()])
            .await
            .unwrap();
        let previous = AuthorizationLock::new("replica-a", Utc::now())
            .with_order(order.url.clone(), order.authorizations.first().cloned());
        let locked = f.issuer.acquire_lock(&snapshot, &previous).await.unwrap();

        let installed = f
            .issuer
            .resume(&locked, &previous, &account(), &ctx())
            .await
            .unwrap();

        assert!(installed.certificate_pem().is_some());
        assert_eq!(f.client.orders_created(), 1);
    }

    #[tokio::test]
    async fn test_passthrough_is_fatal_without_writes() {
        let f = fixture("replica-a");
        let mut endpoint = route("app.example.com");
        endpoint.tls = Some(tlsacme_common::TlsConfig {
            termination: "passthrough".into(),
            ..Default::default()
        });
        let snapshot = f.store.insert(endpoint);

        let err = f.issuer.issue(&snapshot, &account(), &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(f.store.update_count(), 0);
    }
}
