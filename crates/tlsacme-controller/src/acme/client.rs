//! ACME 客户端抽象
//!
//! 状态机只依赖这里定义的协议级操作，具体的 HTTP 传输由实现负责。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tlsacme_common::Result;

use super::account::AcmeAccount;

/// 新注册的账户
#[derive(Clone)]
pub struct RegisteredAccount {
    /// 账户 URL
    pub url: String,
    /// 序列化后的账户凭据（包含私钥）
    pub credentials: String,
}

impl std::fmt::Debug for RegisteredAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAccount")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

/// 授权状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Revoked,
    Expired,
    Deactivated,
}

impl AuthorizationStatus {
    /// 是否已终结且不可能再变为有效
    pub fn is_failed(self) -> bool {
        !matches!(self, AuthorizationStatus::Pending | AuthorizationStatus::Valid)
    }
}

/// 挑战类型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
    Dns01,
    TlsAlpn01,
    Other(String),
}

/// 订单句柄
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHandle {
    /// 订单 URL
    pub url: String,
    /// 订单状态
    pub status: OrderStatus,
    /// 授权 URL 列表
    pub authorizations: Vec<String>,
}

/// 挑战信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeInfo {
    /// 挑战类型
    pub kind: ChallengeKind,
    /// 挑战 URL
    pub url: String,
    /// 挑战令牌
    pub token: String,
    /// 应答内容（令牌 + 账户公钥指纹）
    pub key_authorization: String,
}

/// 授权快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationState {
    /// 授权 URL
    pub url: String,
    /// 授权对应的域名
    pub domain: String,
    /// 授权状态
    pub status: AuthorizationStatus,
    /// 可用的挑战
    pub challenges: Vec<ChallengeInfo>,
    /// 授权过期时间
    pub expires: Option<DateTime<Utc>>,
}

impl AuthorizationState {
    /// 选出 HTTP-01 挑战
    pub fn http01(&self) -> Option<&ChallengeInfo> {
        self.challenges
            .iter()
            .find(|c| c.kind == ChallengeKind::Http01)
    }
}

/// ACME 协议客户端
///
/// 错误按照 [`tlsacme_common::ErrorKind`] 分类：5xx、429 与限流为 `Transient`，
/// 其余 4xx 拒绝为 `Invalid`。
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// 注册新账户，客户端负责生成账户密钥
    async fn register_account(&self, contact: &[String]) -> Result<RegisteredAccount>;

    /// 注销账户
    async fn deactivate_account(&self, account: &AcmeAccount) -> Result<()>;

    /// 为域名集合创建订单
    async fn create_order(&self, account: &AcmeAccount, domains: &[String]) -> Result<OrderHandle>;

    /// 读取订单下的某个授权
    async fn get_authorization(
        &self,
        account: &AcmeAccount,
        order_url: &str,
        authorization_url: &str,
    ) -> Result<AuthorizationState>;

    /// 通知服务端挑战已就绪
    async fn respond_to_challenge(
        &self,
        account: &AcmeAccount,
        order_url: &str,
        challenge_url: &str,
    ) -> Result<()>;

    /// 刷新订单状态
    async fn poll_order(&self, account: &AcmeAccount, order_url: &str) -> Result<OrderHandle>;

    /// 提交 CSR（DER 格式）
    async fn finalize_order(
        &self,
        account: &AcmeAccount,
        order_url: &str,
        csr_der: &[u8],
    ) -> Result<OrderHandle>;

    /// 下载证书链，尚未签发时返回 None
    async fn download_certificate(
        &self,
        account: &AcmeAccount,
        order_url: &str,
    ) -> Result<Option<String>>;
}
