//! 单端点决策
//!
//! 纯函数：只读取端点快照与当前时间，不做任何 I/O。规则按顺序匹配，
//! 第一个命中的规则决定结果。

use chrono::{DateTime, Duration, Utc};
use tlsacme_common::{
    decode_lock, is_paused, is_tls_acme_enabled, AuthorizationLock, CertificateInfo, Endpoint,
};

use super::scheduler::RenewalPolicy;

/// 续期原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalReason {
    /// 进入续期窗口
    Expiring,
    /// 已过期
    Expired,
    /// 尚未生效
    NotYetValid,
    /// 未覆盖端点主机名
    DomainMismatch,
    /// 无法解析
    Unreadable,
}

impl RenewalReason {
    /// 指标与日志中使用的名称
    pub fn as_str(&self) -> &'static str {
        match self {
            RenewalReason::Expiring => "expiring",
            RenewalReason::Expired => "expired",
            RenewalReason::NotYetValid => "not_yet_valid",
            RenewalReason::DomainMismatch => "domain_mismatch",
            RenewalReason::Unreadable => "unreadable",
        }
    }
}

/// 决策结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NoActionNeeded,
    Paused,
    /// 其他实例持有未过期的租约
    WaitingOnChallenge(AuthorizationLock),
    /// 本实例持有未过期的租约
    ResumeChallenge(AuthorizationLock),
    NeedsIssuance,
    NeedsRenewal(RenewalReason),
}

/// 决策参数
#[derive(Debug, Clone)]
pub struct DecisionPolicy {
    /// 租约有效期
    pub lock_ttl: Duration,
    /// 续期策略
    pub renewal: RenewalPolicy,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::minutes(15),
            renewal: RenewalPolicy::default(),
        }
    }
}

/// 为端点做出决策
pub fn decide(
    endpoint: &Endpoint,
    owner_id: &str,
    now: DateTime<Utc>,
    policy: &DecisionPolicy,
) -> Decision {
    if !is_tls_acme_enabled(&endpoint.annotations) {
        return Decision::NoActionNeeded;
    }
    if is_paused(&endpoint.annotations) {
        return Decision::Paused;
    }

    if let Some(lock) = decode_lock(&endpoint.annotations) {
        if !lock.is_stale(now, policy.lock_ttl) {
            return if lock.is_owned_by(owner_id) {
                Decision::ResumeChallenge(lock)
            } else {
                Decision::WaitingOnChallenge(lock)
            };
        }
    }

    let pem = match endpoint.certificate_pem() {
        Some(pem) => pem,
        None => return Decision::NeedsIssuance,
    };
    // 主机名无效时交给签发流程报告致命错误
    let domains = match endpoint.domains() {
        Ok(domains) => domains,
        Err(_) => return Decision::NeedsIssuance,
    };
    let info = match CertificateInfo::from_pem(pem) {
        Ok(info) => info,
        Err(_) => return Decision::NeedsRenewal(RenewalReason::Unreadable),
    };

    if now > info.not_after {
        Decision::NeedsRenewal(RenewalReason::Expired)
    } else if now < info.not_before {
        Decision::NeedsRenewal(RenewalReason::NotYetValid)
    } else if !info.covers(&domains) {
        Decision::NeedsRenewal(RenewalReason::DomainMismatch)
    } else if policy.renewal.needs_renewal(&info, now) {
        Decision::NeedsRenewal(RenewalReason::Expiring)
    } else {
        Decision::NoActionNeeded
    }
}
