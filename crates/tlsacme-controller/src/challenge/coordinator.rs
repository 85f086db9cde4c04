//! 挑战协调器
//!
//! 把一个已创建的订单推进到拿到证书链：发布令牌、通知服务端、轮询授权与订单、
//! 生成密钥与 CSR、提交并下载证书。无论成功、失败、超时还是被取消，
//! 发布过的令牌都会被撤回。

use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tlsacme_common::{CertificateBundle, Error, Result};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::publisher::ChallengePublisher;
use crate::acme::{AcmeAccount, AcmeClient, AuthorizationStatus, OrderHandle, OrderStatus};
use crate::utils::{to_std, Backoff};

/// 挑战轮询参数
#[derive(Debug, Clone)]
pub struct ChallengeTimings {
    /// 授权与订单的轮询退避
    pub poll: Backoff,
    /// 单个授权、订单阶段最长等待时间
    pub ceiling: Duration,
}

impl Default for ChallengeTimings {
    fn default() -> Self {
        Self {
            poll: Backoff::exact(Duration::from_secs(2), Duration::from_secs(30), 2.0),
            ceiling: Duration::from_secs(300),
        }
    }
}

/// 本次协调发布过的令牌
struct PublishedTokens {
    publisher: Arc<dyn ChallengePublisher>,
    tokens: Mutex<Vec<String>>,
}

impl PublishedTokens {
    fn new(publisher: Arc<dyn ChallengePublisher>) -> Self {
        Self {
            publisher,
            tokens: Mutex::new(Vec::new()),
        }
    }

    async fn publish(&self, token: &str, key_authorization: &str) -> Result<()> {
        // 先记录再发布，发布中途失败时也会被撤回
        if let Ok(mut tokens) = self.tokens.lock() {
            tokens.push(token.to_string());
        }
        self.publisher.publish(token, key_authorization).await
    }

    fn take(&self) -> Vec<String> {
        self.tokens
            .lock()
            .map(|mut tokens| std::mem::take(&mut *tokens))
            .unwrap_or_default()
    }

    async fn withdraw_all(&self) {
        for token in self.take() {
            if let Err(e) = self.publisher.withdraw(&token).await {
                warn!("撤回挑战令牌 {} 失败: {}", token, e);
            }
        }
    }
}

impl Drop for PublishedTokens {
    fn drop(&mut self) {
        let tokens = self.take();
        if tokens.is_empty() {
            return;
        }
        let publisher = self.publisher.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    for token in tokens {
                        if let Err(e) = publisher.withdraw(&token).await {
                            warn!("撤回挑战令牌 {} 失败: {}", token, e);
                        }
                    }
                });
            }
            Err(_) => warn!("运行时已关闭，{} 个挑战令牌未能撤回", tokens.len()),
        }
    }
}

/// 挑战协调器
pub struct ChallengeCoordinator {
    client: Arc<dyn AcmeClient>,
    publisher: Arc<dyn ChallengePublisher>,
    timings: ChallengeTimings,
}

impl ChallengeCoordinator {
    /// 创建新的挑战协调器
    pub fn new(
        client: Arc<dyn AcmeClient>,
        publisher: Arc<dyn ChallengePublisher>,
        timings: ChallengeTimings,
    ) -> Self {
        Self {
            client,
            publisher,
            timings,
        }
    }

    /// 完成订单并返回证书
    ///
    /// `deadline` 为整个协调过程的截止时间；`cancel` 触发时立即放弃。
    pub async fn complete(
        &self,
        account: &AcmeAccount,
        order: &OrderHandle,
        domains: &[String],
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> Result<CertificateBundle> {
        let published = PublishedTokens::new(self.publisher.clone());

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled(format!("订单 {} 的协调被取消", order.url))),
            _ = tokio::time::sleep_until(deadline) => Err(Error::Transient(format!("订单 {} 超过本次协调的截止时间", order.url))),
            r = self.drive(account, order, domains, deadline, &published) => r,
        };

        published.withdraw_all().await;
        result
    }

    async fn drive(
        &self,
        account: &AcmeAccount,
        order: &OrderHandle,
        domains: &[String],
        deadline: Instant,
        published: &PublishedTokens,
    ) -> Result<CertificateBundle> {
        let mut pending = Vec::new();

        for authz_url in &order.authorizations {
            let state = self
                .client
                .get_authorization(account, &order.url, authz_url)
                .await?;
            if state.status == AuthorizationStatus::Valid {
                debug!("授权 {} ({}) 已有效", authz_url, state.domain);
                continue;
            }
            if state.status.is_failed() {
                return Err(Error::Invalid(format!(
                    "域名 {} 的授权状态为 {:?}",
                    state.domain, state.status
                )));
            }

            let challenge = state.http01().ok_or_else(|| {
                Error::Invalid(format!("域名 {} 没有可用的 HTTP-01 挑战", state.domain))
            })?;
            published
                .publish(&challenge.token, &challenge.key_authorization)
                .await?;
            self.client
                .respond_to_challenge(account, &order.url, &challenge.url)
                .await?;
            info!("已为 {} 发布 HTTP-01 挑战，等待验证", state.domain);

            let limit = self.authorization_limit(deadline, state.expires);
            pending.push((authz_url.clone(), limit));
        }

        for (authz_url, limit) in pending {
            self.await_authorization(account, &order.url, &authz_url, limit)
                .await?;
        }

        self.await_order_ready(account, &order.url, deadline).await?;

        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Transient(format!("生成证书密钥失败: {}", e)))?;
        let mut params = CertificateParams::new(domains.to_vec())
            .map_err(|e| Error::Fatal(format!("无法为 {:?} 构造 CSR: {}", domains, e)))?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| Error::Fatal(format!("生成 CSR 失败: {}", e)))?;

        self.client
            .finalize_order(account, &order.url, csr.der())
            .await?;
        debug!("订单 {} 已提交 CSR", order.url);

        let chain = self.await_certificate(account, &order.url, deadline).await?;
        Ok(CertificateBundle {
            certificate_pem: chain,
            private_key_pem: key_pair.serialize_pem(),
        })
    }

    fn authorization_limit(
        &self,
        deadline: Instant,
        expires: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Instant {
        let mut limit = deadline.min(Instant::now() + self.timings.ceiling);
        if let Some(expires) = expires {
            limit = limit.min(Instant::now() + to_std(expires - chrono::Utc::now()));
        }
        limit
    }

    /// 睡眠到下一次轮询，超过 `limit` 时返回错误
    async fn wait(&self, attempt: u32, limit: Instant, what: &str) -> Result<()> {
        let now = Instant::now();
        if now >= limit {
            return Err(Error::Transient(format!("等待{}超时", what)));
        }
        let delay = self.timings.poll.delay(attempt).min(limit - now);
        tokio::time::sleep(delay).await;
        Ok(())
    }

    async fn await_authorization(
        &self,
        account: &AcmeAccount,
        order_url: &str,
        authz_url: &str,
        limit: Instant,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            let state = self
                .client
                .get_authorization(account, order_url, authz_url)
                .await?;
            match state.status {
                AuthorizationStatus::Valid => {
                    info!("域名 {} 的授权已通过", state.domain);
                    return Ok(());
                }
                AuthorizationStatus::Pending => {
                    debug!("授权 {} 仍在等待验证", authz_url);
                }
                status => {
                    return Err(Error::Invalid(format!(
                        "域名 {} 的授权验证失败: {:?}",
                        state.domain, status
                    )));
                }
            }
            self.wait(attempt, limit, "授权").await?;
            attempt += 1;
        }
    }

    async fn await_order_ready(
        &self,
        account: &AcmeAccount,
        order_url: &str,
        deadline: Instant,
    ) -> Result<()> {
        let limit = deadline.min(Instant::now() + self.timings.ceiling);
        let mut attempt = 0;
        loop {
            let order = self.client.poll_order(account, order_url).await?;
            match order.status {
                OrderStatus::Ready => return Ok(()),
                OrderStatus::Pending => debug!("订单 {} 尚未就绪", order_url),
                OrderStatus::Invalid => {
                    return Err(Error::Invalid(format!("订单 {} 已失效", order_url)));
                }
                OrderStatus::Processing | OrderStatus::Valid => {
                    // 已由其他实例提交过 CSR，本地没有对应私钥
                    return Err(Error::Transient(format!(
                        "订单 {} 已被提交，无法使用新的密钥",
                        order_url
                    )));
                }
            }
            self.wait(attempt, limit, "订单就绪").await?;
            attempt += 1;
        }
    }

    async fn await_certificate(
        &self,
        account: &AcmeAccount,
        order_url: &str,
        deadline: Instant,
    ) -> Result<String> {
        let limit = deadline.min(Instant::now() + self.timings.ceiling);
        let mut attempt = 0;
        loop {
            if let Some(chain) = self.client.download_certificate(account, order_url).await? {
                return Ok(chain);
            }
            debug!("订单 {} 的证书尚未签发", order_url);
            self.wait(attempt, limit, "证书签发").await?;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::AccountStatus;
    use crate::challenge::{MockChallengePublisher, TokenRegistry};
    use crate::testing::{AuthorizationOutcome, FakeAcmeClient};
    use chrono::Utc;
    use mockall::predicate::function;
    use tlsacme_common::{CertificateInfo, ErrorKind};

    fn account() -> AcmeAccount {
        AcmeAccount {
            scope: crate::acme::AccountScope::new("default", "acme-account"),
            url: "https://acme.test/acct/1".into(),
            contact: vec![],
            credentials: "{}".into(),
            status: AccountStatus::Active,
            created_at: Utc::now(),
        }
    }

    fn timings() -> ChallengeTimings {
        ChallengeTimings {
            poll: Backoff::exact(Duration::from_millis(10), Duration::from_millis(50), 2.0),
            ceiling: Duration::from_secs(5),
        }
    }

    fn domains() -> Vec<String> {
        vec!["app.example.com".to_string()]
    }

    #[test_log::test(tokio::test)]
    async fn test_issues_certificate_and_withdraws_token() {
        let registry = TokenRegistry::new();
        let client = Arc::new(FakeAcmeClient::new().with_registry(registry.clone()));
        let coordinator =
            ChallengeCoordinator::new(client.clone(), Arc::new(registry.clone()), timings());

        let account = account();
        let order = client.create_order(&account, &domains()).await.unwrap();
        let bundle = coordinator
            .complete(
                &account,
                &order,
                &domains(),
                &CancellationToken::new(),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap();

        let info = CertificateInfo::from_pem(&bundle.certificate_pem).unwrap();
        assert!(info.covers(&domains()));
        assert!(bundle.private_key_pem.contains("PRIVATE KEY"));
        assert!(registry.is_empty());
        assert_eq!(client.responded(), 1);
    }

    #[tokio::test]
    async fn test_invalid_authorization_withdraws_token() {
        let client = Arc::new(FakeAcmeClient::new());
        client.set_outcome(AuthorizationOutcome::Invalid);

        let mut publisher = MockChallengePublisher::new();
        publisher.expect_publish().times(1).returning(|_, _| Ok(()));
        publisher
            .expect_withdraw()
            .with(function(|token: &str| token == "token-1-0"))
            .times(1)
            .returning(|_| Ok(()));

        let coordinator = ChallengeCoordinator::new(client.clone(), Arc::new(publisher), timings());
        let account = account();
        let order = client.create_order(&account, &domains()).await.unwrap();
        let err = coordinator
            .complete(
                &account,
                &order,
                &domains(),
                &CancellationToken::new(),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Invalid);
    }

    #[tokio::test]
    async fn test_cancellation_withdraws_token() {
        let registry = TokenRegistry::new();
        let client = Arc::new(FakeAcmeClient::new().with_registry(registry.clone()));
        client.set_outcome(AuthorizationOutcome::Pending);
        let coordinator =
            ChallengeCoordinator::new(client.clone(), Arc::new(registry.clone()), timings());

        let account = account();
        let order = client.create_order(&account, &domains()).await.unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = coordinator
            .complete(
                &account,
                &order,
                &domains(),
                &cancel,
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Cancelled(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_is_transient() {
        let registry = TokenRegistry::new();
        let client = Arc::new(FakeAcmeClient::new().with_registry(registry.clone()));
        client.set_outcome(AuthorizationOutcome::Pending);
        let coordinator =
            ChallengeCoordinator::new(client.clone(), Arc::new(registry.clone()), timings());

        let account = account();
        let order = client.create_order(&account, &domains()).await.unwrap();
        let err = coordinator
            .complete(
                &account,
                &order,
                &domains(),
                &CancellationToken::new(),
                Instant::now() + Duration::from_millis(150),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_missing_http01_is_invalid() {
        let client = Arc::new(FakeAcmeClient::new());
        client.set_offer_http01(false);
        let registry = TokenRegistry::new();
        let coordinator =
            ChallengeCoordinator::new(client.clone(), Arc::new(registry.clone()), timings());

        let account = account();
        let order = client.create_order(&account, &domains()).await.unwrap();
        let err = coordinator
            .complete(
                &account,
                &order,
                &domains(),
                &CancellationToken::new(),
                Instant::now() + Duration::from_secs(5),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert_eq!(client.responded(), 0);
    }
}
