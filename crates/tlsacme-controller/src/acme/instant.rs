//! 基于 instant-acme 的 ACME 客户端

use async_trait::async_trait;
use instant_acme::{Account, AccountCredentials, Identifier, NewAccount, NewOrder, Order};
use std::collections::HashMap;
use tlsacme_common::{Error, Result};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::account::AcmeAccount;
use super::client::{
    AcmeClient, AuthorizationState, AuthorizationStatus, ChallengeInfo, ChallengeKind,
    OrderHandle, OrderStatus, RegisteredAccount,
};

/// instant-acme 客户端
///
/// 按账户 URL 缓存从凭据恢复的 [`Account`]，避免每次调用都重新拉取目录。
pub struct InstantAcmeClient {
    directory_url: String,
    accounts: RwLock<HashMap<String, Account>>,
}

impl InstantAcmeClient {
    /// 创建新的客户端
    pub fn new(directory_url: impl Into<String>) -> Self {
        Self {
            directory_url: directory_url.into(),
            accounts: RwLock::new(HashMap::new()),
        }
    }

    /// 目录 URL
    pub fn directory_url(&self) -> &str {
        &self.directory_url
    }

    async fn account(&self, account: &AcmeAccount) -> Result<Account> {
        if let Some(cached) = self.accounts.read().await.get(&account.url) {
            return Ok(cached.clone());
        }

        let credentials: AccountCredentials = serde_json::from_str(&account.credentials)
            .map_err(|e| Error::Fatal(format!("账户 {} 的凭据无法解析: {}", account.scope, e)))?;
        let restored = Account::from_credentials(credentials)
            .await
            .map_err(classify)?;

        self.accounts
            .write()
            .await
            .insert(account.url.clone(), restored.clone());
        Ok(restored)
    }

    async fn order(&self, account: &AcmeAccount, order_url: &str) -> Result<Order> {
        self.account(account)
            .await?
            .order(order_url.to_string())
            .await
            .map_err(classify)
    }
}

/// 将 instant-acme 错误归类
fn classify(err: instant_acme::Error) -> Error {
    match &err {
        instant_acme::Error::Api(problem) => {
            let rate_limited = problem
                .r#type
                .as_deref()
                .map_or(false, |t| t.contains("rateLimited"));
            match problem.status {
                _ if rate_limited => Error::Transient(format!("ACME 限流: {}", err)),
                Some(429) => Error::Transient(format!("ACME 限流: {}", err)),
                Some(status) if status >= 500 => Error::Transient(format!("ACME 服务端错误: {}", err)),
                Some(status) if status >= 400 => Error::Invalid(format!("ACME 拒绝请求: {}", err)),
                _ => Error::Transient(format!("ACME 错误: {}", err)),
            }
        }
        _ => Error::Transient(format!("ACME 请求失败: {}", err)),
    }
}

fn order_handle(order: &mut Order) -> OrderHandle {
    let url = order.url().to_string();
    let state = order.state();
    OrderHandle {
        url,
        status: match state.status {
            instant_acme::OrderStatus::Pending => OrderStatus::Pending,
            instant_acme::OrderStatus::Ready => OrderStatus::Ready,
            instant_acme::OrderStatus::Processing => OrderStatus::Processing,
            instant_acme::OrderStatus::Valid => OrderStatus::Valid,
            instant_acme::OrderStatus::Invalid => OrderStatus::Invalid,
        },
        authorizations: state.authorizations.clone(),
    }
}

#[allow(unreachable_patterns)]
fn authorization_status(status: &instant_acme::AuthorizationStatus) -> AuthorizationStatus {
    match status {
        instant_acme::AuthorizationStatus::Pending => AuthorizationStatus::Pending,
        instant_acme::AuthorizationStatus::Valid => AuthorizationStatus::Valid,
        instant_acme::AuthorizationStatus::Invalid => AuthorizationStatus::Invalid,
        instant_acme::AuthorizationStatus::Revoked => AuthorizationStatus::Revoked,
        instant_acme::AuthorizationStatus::Expired => AuthorizationStatus::Expired,
        _ => AuthorizationStatus::Deactivated,
    }
}

#[allow(unreachable_patterns)]
fn challenge_kind(kind: &instant_acme::ChallengeType) -> ChallengeKind {
    match kind {
        instant_acme::ChallengeType::Http01 => ChallengeKind::Http01,
        instant_acme::ChallengeType::Dns01 => ChallengeKind::Dns01,
        instant_acme::ChallengeType::TlsAlpn01 => ChallengeKind::TlsAlpn01,
        other => ChallengeKind::Other(format!("{:?}", other)),
    }
}

#[allow(unreachable_patterns)]
fn identifier_domain(identifier: &Identifier) -> String {
    match identifier {
        Identifier::Dns(domain) => domain.clone(),
        other => format!("{:?}", other),
    }
}

#[async_trait]
impl AcmeClient for InstantAcmeClient {
    async fn register_account(&self, contact: &[String]) -> Result<RegisteredAccount> {
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await
        .map_err(classify)?;

        let url = account.id().to_string();
        let credentials = serde_json::to_string(&credentials)?;
        info!("已在 {} 注册 ACME 账户 {}", self.directory_url, url);

        self.accounts.write().await.insert(url.clone(), account);
        Ok(RegisteredAccount { url, credentials })
    }

    async fn deactivate_account(&self, account: &AcmeAccount) -> Result<()> {
        // instant-acme 0.7 未提供账户注销请求，只能丢弃本地状态
        self.accounts.write().await.remove(&account.url);
        Err(Error::Transient(format!(
            "ACME 客户端不支持注销账户 {}",
            account.url
        )))
    }

    async fn create_order(&self, account: &AcmeAccount, domains: &[String]) -> Result<OrderHandle> {
        let identifiers: Vec<Identifier> = domains.iter().cloned().map(Identifier::Dns).collect();
        let mut order = self
            .account(account)
            .await?
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(classify)?;
        debug!("已创建订单 {} ({:?})", order.url(), domains);
        Ok(order_handle(&mut order))
    }

    async fn get_authorization(
        &self,
        account: &AcmeAccount,
        order_url: &str,
        authorization_url: &str,
    ) -> Result<AuthorizationState> {
        let mut order = self.order(account, order_url).await?;
        let urls = order.state().authorizations.clone();
        let authorizations = order.authorizations().await.map_err(classify)?;

        let (url, authz) = urls
            .into_iter()
            .zip(authorizations)
            .find(|(url, _)| url == authorization_url)
            .ok_or_else(|| {
                Error::Invalid(format!(
                    "订单 {} 中不存在授权 {}",
                    order_url, authorization_url
                ))
            })?;

        let challenges = authz
            .challenges
            .iter()
            .map(|c| ChallengeInfo {
                kind: challenge_kind(&c.r#type),
                url: c.url.clone(),
                token: c.token.clone(),
                key_authorization: order.key_authorization(c).as_str().to_string(),
            })
            .collect();

        Ok(AuthorizationState {
            url,
            domain: identifier_domain(&authz.identifier),
            status: authorization_status(&authz.status),
            challenges,
            // instant-acme 0.7 不暴露授权过期时间
            expires: None,
        })
    }

    async fn respond_to_challenge(
        &self,
        account: &AcmeAccount,
        order_url: &str,
        challenge_url: &str,
    ) -> Result<()> {
        let mut order = self.order(account, order_url).await?;
        order
            .set_challenge_ready(challenge_url)
            .await
            .map_err(classify)
    }

    async fn poll_order(&self, account: &AcmeAccount, order_url: &str) -> Result<OrderHandle> {
        let mut order = self.order(account, order_url).await?;
        order.refresh().await.map_err(classify)?;
        Ok(order_handle(&mut order))
    }

    async fn finalize_order(
        &self,
        account: &AcmeAccount,
        order_url: &str,
        csr_der: &[u8],
    ) -> Result<OrderHandle> {
        let mut order = self.order(account, order_url).await?;
        order.finalize(csr_der).await.map_err(classify)?;
        Ok(order_handle(&mut order))
    }

    async fn download_certificate(
        &self,
        account: &AcmeAccount,
        order_url: &str,
    ) -> Result<Option<String>> {
        let mut order = self.order(account, order_url).await?;
        order.certificate().await.map_err(classify)
    }
}
