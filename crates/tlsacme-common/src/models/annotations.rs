//! 注解协议
//!
//! 控制器与用户、以及控制器各副本之间唯一的通信方式就是端点上的注解。
//! 注解键是线上协议的一部分，跨版本必须保持不变，否则滚动升级期间
//! 新旧副本会互相看不到对方的租约。
//!
//! 所有解码都是宽松的：缺失或格式错误的注解一律视为“未设置”，
//! 损坏的注解绝不能让端点永久卡住。

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// 自动 TLS 开关
pub const TLS_ACME_ANNOTATION: &str = "kubernetes.io/tls-acme";
/// 暂停开关
pub const TLS_ACME_PAUSED_ANNOTATION: &str = "kubernetes.io/tls-acme-paused";
/// 账户关联（命名空间/名称）
pub const TLS_ACME_ACCOUNT_ANNOTATION: &str = "kubernetes.io/tls-acme-account";
/// 正在等待的授权 URL
pub const AWAITING_AUTHZ_URL_ANNOTATION: &str =
    "kubernetes.io/tls-acme-awaiting-authorization-at-url";
/// 授权租约持有者
pub const AWAITING_AUTHZ_OWNER_ANNOTATION: &str =
    "kubernetes.io/tls-acme-awaiting-authorization-owner";

/// 注解集合
pub type Annotations = BTreeMap<String, String>;

fn parse_bool(annotations: &Annotations, key: &str) -> bool {
    annotations
        .get(key)
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// 端点是否请求了自动 TLS
pub fn is_tls_acme_enabled(annotations: &Annotations) -> bool {
    parse_bool(annotations, TLS_ACME_ANNOTATION)
}

/// 端点是否被暂停
pub fn is_paused(annotations: &Annotations) -> bool {
    parse_bool(annotations, TLS_ACME_PAUSED_ANNOTATION)
}

/// 设置布尔注解
pub fn set_flag(annotations: &mut Annotations, key: &str, value: bool) {
    annotations.insert(key.to_string(), value.to_string());
}

/// 账户关联
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountRef {
    /// 账户 Secret 所在命名空间
    pub namespace: String,
    /// 账户 Secret 名称
    pub name: String,
}

impl fmt::Display for AccountRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// 解码账户关联，格式错误时返回 None
pub fn decode_account_ref(annotations: &Annotations) -> Option<AccountRef> {
    let raw = annotations.get(TLS_ACME_ACCOUNT_ANNOTATION)?;
    match raw.trim().split_once('/') {
        Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() && !name.contains('/') => {
            Some(AccountRef {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
        }
        _ => {
            debug!("忽略格式错误的账户注解: {}", raw);
            None
        }
    }
}

/// 编码账户关联
pub fn encode_account_ref(account: &AccountRef, annotations: &mut Annotations) {
    annotations.insert(TLS_ACME_ACCOUNT_ANNOTATION.to_string(), account.to_string());
}

/// 授权租约
///
/// 记录哪个控制器实例正在驱动该端点的 ACME 订单。租约在创建订单之前获取，
/// 此时还没有授权 URL；订单创建后再以一次条件写入补上订单与授权 URL。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationLock {
    /// 正在等待的授权 URL
    pub authorization_url: Option<String>,
    /// 订单 URL，用于恢复中断的订单
    pub order_url: Option<String>,
    /// 持有者标识
    pub owner: String,
    /// 获取时间
    pub acquired_at: DateTime<Utc>,
}

/// 持有者注解的值
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaseRecord {
    owner: String,
    acquired_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    order_url: Option<String>,
}

impl AuthorizationLock {
    /// 创建尚未关联订单的新租约
    pub fn new(owner: impl Into<String>, acquired_at: DateTime<Utc>) -> Self {
        Self {
            authorization_url: None,
            order_url: None,
            owner: owner.into(),
            acquired_at,
        }
    }

    /// 关联订单与授权
    pub fn with_order(mut self, order_url: impl Into<String>, authorization_url: Option<String>) -> Self {
        self.order_url = Some(order_url.into());
        self.authorization_url = authorization_url;
        self
    }

    /// 租约是否已过期，可被回收
    pub fn is_stale(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.acquired_at > ttl
    }

    /// 租约何时过期
    pub fn expires_at(&self, ttl: Duration) -> DateTime<Utc> {
        self.acquired_at + ttl
    }

    /// 是否由指定实例持有
    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.owner == owner
    }
}

/// 解码授权租约
///
/// 持有者注解缺失、不是合法 JSON 或持有者为空时均视为没有租约。
pub fn decode_lock(annotations: &Annotations) -> Option<AuthorizationLock> {
    let raw = annotations.get(AWAITING_AUTHZ_OWNER_ANNOTATION)?;
    let record: LeaseRecord = match serde_json::from_str(raw) {
        Ok(record) => record,
        Err(e) => {
            debug!("忽略无法解析的租约注解: {}", e);
            return None;
        }
    };
    if record.owner.trim().is_empty() {
        return None;
    }

    let authorization_url = annotations
        .get(AWAITING_AUTHZ_URL_ANNOTATION)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    Some(AuthorizationLock {
        authorization_url,
        order_url: record.order_url.filter(|v| !v.is_empty()),
        owner: record.owner,
        acquired_at: record.acquired_at,
    })
}

/// 编码授权租约
pub fn encode_lock(lock: &AuthorizationLock, annotations: &mut Annotations) {
    let record = LeaseRecord {
        owner: lock.owner.clone(),
        acquired_at: lock.acquired_at,
        order_url: lock.order_url.clone(),
    };
    // LeaseRecord 只包含字符串与时间戳，序列化不会失败
    let value = serde_json::to_string(&record).unwrap_or_default();
    annotations.insert(AWAITING_AUTHZ_OWNER_ANNOTATION.to_string(), value);

    match &lock.authorization_url {
        Some(url) => {
            annotations.insert(AWAITING_AUTHZ_URL_ANNOTATION.to_string(), url.clone());
        }
        None => {
            annotations.remove(AWAITING_AUTHZ_URL_ANNOTATION);
        }
    }
}

/// 清除授权租约
pub fn clear_lock(annotations: &mut Annotations) {
    annotations.remove(AWAITING_AUTHZ_OWNER_ANNOTATION);
    annotations.remove(AWAITING_AUTHZ_URL_ANNOTATION);
}

/// 控制器自己管理的注解键，写回时不存在的键需要显式删除
pub fn managed_lock_keys() -> [&'static str; 2] {
    [AWAITING_AUTHZ_URL_ANNOTATION, AWAITING_AUTHZ_OWNER_ANNOTATION]
}
