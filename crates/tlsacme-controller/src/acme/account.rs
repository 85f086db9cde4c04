//! ACME 账户管理
//!
//! 每个作用域（Secret 的命名空间/名称）对应唯一一个 ACME 账户。Secret 是唯一的
//! 事实来源，进程内不缓存账户：并发的创建者通过“仅在不存在时创建”决出胜者，
//! 失败者丢弃本地注册并重新读取。

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tlsacme_common::{AccountRef, Error, Result};
use tracing::{debug, info, warn};

use super::client::AcmeClient;
use crate::store::AccountStore;

/// 账户作用域
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountScope {
    /// Secret 所在命名空间
    pub namespace: String,
    /// Secret 名称
    pub name: String,
}

impl AccountScope {
    /// 创建新的账户作用域
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for AccountScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl From<AccountRef> for AccountScope {
    fn from(r: AccountRef) -> Self {
        Self::new(r.namespace, r.name)
    }
}

/// 账户状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountStatus {
    Active,
    Deactivated,
}

impl AccountStatus {
    /// 存储中使用的字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Deactivated => "deactivated",
        }
    }
}

impl std::str::FromStr for AccountStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(AccountStatus::Active),
            "deactivated" => Ok(AccountStatus::Deactivated),
            other => Err(Error::Fatal(format!("未知的账户状态: {}", other))),
        }
    }
}

/// ACME 账户
#[derive(Clone)]
pub struct AcmeAccount {
    /// 作用域
    pub scope: AccountScope,
    /// 注册 URL
    pub url: String,
    /// 联系方式
    pub contact: Vec<String>,
    /// 序列化后的凭据，对核心逻辑不透明
    pub credentials: String,
    /// 状态
    pub status: AccountStatus,
    /// 创建时间
    pub created_at: DateTime<Utc>,
}

impl fmt::Debug for AcmeAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcmeAccount")
            .field("scope", &self.scope)
            .field("url", &self.url)
            .field("contact", &self.contact)
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// 账户管理器
pub struct AccountManager {
    store: Arc<dyn AccountStore>,
    client: Arc<dyn AcmeClient>,
    contact: Vec<String>,
}

impl AccountManager {
    /// 创建新的账户管理器
    pub fn new(store: Arc<dyn AccountStore>, client: Arc<dyn AcmeClient>, contact: Vec<String>) -> Self {
        Self {
            store,
            client,
            contact,
        }
    }

    /// 读取账户，不存在时注册并持久化
    pub async fn get_or_create(&self, scope: &AccountScope) -> Result<AcmeAccount> {
        if let Some(account) = self.store.get(scope).await? {
            return Self::usable(account);
        }

        info!("作用域 {} 尚无 ACME 账户，开始注册", scope);
        let registered = self.client.register_account(&self.contact).await?;
        let account = AcmeAccount {
            scope: scope.clone(),
            url: registered.url,
            contact: self.contact.clone(),
            credentials: registered.credentials,
            status: AccountStatus::Active,
            created_at: Utc::now(),
        };

        match self.store.create(&account).await {
            Ok(()) => {
                info!("ACME 账户已注册: {} ({})", scope, account.url);
                Ok(account)
            }
            Err(e) if e.is_conflict() => {
                debug!("作用域 {} 的账户已被其他实例创建，丢弃本地注册", scope);
                if let Err(e) = self.client.deactivate_account(&account).await {
                    warn!("注销多余的 ACME 账户 {} 失败: {}", account.url, e);
                }
                match self.store.get(scope).await? {
                    Some(existing) => Self::usable(existing),
                    None => Err(Error::Transient(format!(
                        "账户 {} 创建冲突后无法读取",
                        scope
                    ))),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// 注销账户并删除 Secret
    ///
    /// 返回 ACME 服务端是否确认了注销；服务端注销失败时 Secret 仍会被删除，
    /// 服务端上的账户保持有效。
    pub async fn deactivate(&self, scope: &AccountScope) -> Result<bool> {
        let deactivated = match self.store.get(scope).await? {
            Some(account) => match self.client.deactivate_account(&account).await {
                Ok(()) => {
                    info!("ACME 账户已注销: {}", account.url);
                    true
                }
                Err(e) => {
                    warn!("ACME 账户 {} 未能在服务端注销，仍保持有效: {}", account.url, e);
                    false
                }
            },
            None => {
                debug!("作用域 {} 没有 ACME 账户", scope);
                false
            }
        };
        self.store.delete(scope).await?;
        info!("账户 Secret 已删除: {}", scope);
        Ok(deactivated)
    }

    fn usable(account: AcmeAccount) -> Result<AcmeAccount> {
        match account.status {
            AccountStatus::Active => Ok(account),
            AccountStatus::Deactivated => Err(Error::Fatal(format!(
                "ACME 账户 {} 已注销",
                account.scope
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAcmeClient, InMemoryAccountStore};
    use tlsacme_common::ErrorKind;

    fn manager(store: Arc<InMemoryAccountStore>, client: Arc<FakeAcmeClient>) -> AccountManager {
        AccountManager::new(store, client, vec!["mailto:ops@example.com".into()])
    }

    #[tokio::test]
    async fn test_registers_once_and_reuses() {
        let store = Arc::new(InMemoryAccountStore::new());
        let client = Arc::new(FakeAcmeClient::new());
        let manager = manager(store.clone(), client.clone());
        let scope = AccountScope::new("default", "acme-account");

        let first = manager.get_or_create(&scope).await.unwrap();
        let second = manager.get_or_create(&scope).await.unwrap();

        assert_eq!(first.url, second.url);
        assert_eq!(client.registrations(), 1);
        assert_eq!(first.contact, vec!["mailto:ops@example.com".to_string()]);
    }

    #[tokio::test]
    async fn test_losing_creator_rereads_winner() {
        let store = Arc::new(InMemoryAccountStore::new());
        let client = Arc::new(FakeAcmeClient::new());
        let scope = AccountScope::new("default", "acme-account");

        store.fail_next_create_with_conflict(AcmeAccount {
            scope: scope.clone(),
            url: "https://acme.test/acct/winner".into(),
            contact: vec![],
            credentials: "{}".into(),
            status: AccountStatus::Active,
            created_at: Utc::now(),
        });

        let account = manager(store.clone(), client.clone())
            .get_or_create(&scope)
            .await
            .unwrap();

        assert_eq!(account.url, "https://acme.test/acct/winner");
        // 本地注册的账户被注销
        assert_eq!(client.deactivated().len(), 1);
        assert_ne!(client.deactivated()[0], "https://acme.test/acct/winner");
    }

    #[tokio::test]
    async fn test_deactivated_account_is_fatal() {
        let store = Arc::new(InMemoryAccountStore::new());
        let client = Arc::new(FakeAcmeClient::new());
        let scope = AccountScope::new("default", "acme-account");
        store
            .create(&AcmeAccount {
                scope: scope.clone(),
                url: "https://acme.test/acct/old".into(),
                contact: vec![],
                credentials: "{}".into(),
                status: AccountStatus::Deactivated,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let err = manager(store, client.clone())
            .get_or_create(&scope)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert_eq!(client.registrations(), 0);
    }

    #[tokio::test]
    async fn test_deactivate_removes_secret_even_if_acme_fails() {
        let store = Arc::new(InMemoryAccountStore::new());
        let client = Arc::new(FakeAcmeClient::new());
        let manager = manager(store.clone(), client.clone());
        let scope = AccountScope::new("default", "acme-account");

        manager.get_or_create(&scope).await.unwrap();
        client.fail_deactivation(true);
        assert!(!manager.deactivate(&scope).await.unwrap());

        assert!(store.get(&scope).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deactivate_reports_server_confirmation() {
        let store = Arc::new(InMemoryAccountStore::new());
        let client = Arc::new(FakeAcmeClient::new());
        let manager = manager(store.clone(), client.clone());
        let scope = AccountScope::new("default", "acme-account");

        let account = manager.get_or_create(&scope).await.unwrap();
        assert!(manager.deactivate(&scope).await.unwrap());

        assert_eq!(client.deactivated(), vec![account.url]);
        assert!(store.get(&scope).await.unwrap().is_none());
    }

    #[test]
    fn test_account_status_parse() {
        assert_eq!("active".parse::<AccountStatus>().unwrap(), AccountStatus::Active);
        assert_eq!(
            AccountStatus::Deactivated.as_str().parse::<AccountStatus>().unwrap(),
            AccountStatus::Deactivated
        );
        assert!("unknown".parse::<AccountStatus>().is_err());
    }
}
