//! 续期调度
//!
//! 续期窗口 = max(总有效期 × 比例, 最小窗口)，且不超过总有效期的一半，
//! 刚签发的证书因此不会立即进入续期窗口。
//! 下一次检查时间取续期时刻与最长重新同步间隔中较早者。

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;
use tlsacme_common::CertificateInfo;

use crate::utils::to_std;

/// 续期策略
#[derive(Debug, Clone, PartialEq)]
pub struct RenewalPolicy {
    /// 续期窗口占总有效期的比例
    pub fraction: f64,
    /// 最小续期窗口
    pub minimum: ChronoDuration,
}

impl Default for RenewalPolicy {
    fn default() -> Self {
        Self {
            fraction: 1.0 / 3.0,
            minimum: ChronoDuration::days(1),
        }
    }
}

impl RenewalPolicy {
    /// 证书的续期窗口
    pub fn window(&self, info: &CertificateInfo) -> ChronoDuration {
        let total = info.total_validity();
        let scaled = ChronoDuration::milliseconds(
            (total.num_milliseconds() as f64 * self.fraction.clamp(0.0, 1.0)) as i64,
        );
        scaled.max(self.minimum).min(total / 2)
    }

    /// 开始续期的时刻
    pub fn renew_at(&self, info: &CertificateInfo) -> DateTime<Utc> {
        info.not_after - self.window(info)
    }

    /// 在给定时刻是否需要续期
    pub fn needs_renewal(&self, info: &CertificateInfo, now: DateTime<Utc>) -> bool {
        now >= self.renew_at(info)
    }
}

/// 续期调度器
#[derive(Debug, Clone)]
pub struct RenewalScheduler {
    policy: RenewalPolicy,
    resync_interval: Duration,
}

impl RenewalScheduler {
    /// 创建新的调度器
    pub fn new(policy: RenewalPolicy, resync_interval: Duration) -> Self {
        Self {
            policy,
            resync_interval,
        }
    }

    /// 续期策略
    pub fn policy(&self) -> &RenewalPolicy {
        &self.policy
    }

    /// 最长重新同步间隔
    pub fn resync_interval(&self) -> Duration {
        self.resync_interval
    }

    /// 距离下一次检查的时长
    pub fn next_check(&self, info: Option<&CertificateInfo>, now: DateTime<Utc>) -> Duration {
        match info {
            Some(info) => to_std(self.policy.renew_at(info) - now).min(self.resync_interval),
            None => self.resync_interval,
        }
    }
}
