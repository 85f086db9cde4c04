//! 对象存储抽象
//!
//! 控制器只通过这两个 trait 访问外部状态。所有写入都以资源版本为前提，
//! 多副本之间的互斥完全依赖这一点。

use async_trait::async_trait;
use tlsacme_common::{Endpoint, EndpointKey, Result};

use crate::acme::{AccountScope, AcmeAccount};

/// 端点存储
#[async_trait]
pub trait EndpointStore: Send + Sync {
    /// 列出所有端点
    async fn list(&self) -> Result<Vec<Endpoint>>;

    /// 读取端点，不存在时返回 None
    async fn get(&self, key: &EndpointKey) -> Result<Option<Endpoint>>;

    /// 以 `endpoint.resource_version` 为前提写回端点
    ///
    /// 版本不一致返回 `Conflict`，端点已删除返回 `Gone`。
    /// 成功时返回带有新资源版本的端点。
    async fn update(&self, endpoint: &Endpoint) -> Result<Endpoint>;
}

/// 账户存储（Secret）
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// 读取账户，不存在时返回 None
    async fn get(&self, scope: &AccountScope) -> Result<Option<AcmeAccount>>;

    /// 仅在不存在时创建，已存在返回 `Conflict`
    async fn create(&self, account: &AcmeAccount) -> Result<()>;

    /// 删除账户，不存在时视为成功
    async fn delete(&self, scope: &AccountScope) -> Result<()>;
}
