//! 控制器工具函数
//!
//! 退避计算与持续时间格式化。

use rand::Rng;
use std::time::Duration;

/// 指数退避
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// 首次重试间隔
    pub initial: Duration,
    /// 最大间隔
    pub max: Duration,
    /// 倍率
    pub multiplier: f64,
    /// 是否加入 0.5x 到 1.5x 的随机抖动
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(5),
            max: Duration::from_secs(300),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl Backoff {
    /// 创建不带抖动的退避
    pub fn exact(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
            jitter: false,
        }
    }

    /// 第 `attempt` 次重试（从 0 开始）的基准间隔
    pub fn base(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let secs = (self.initial.as_secs_f64() * factor).min(self.max.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// 第 `attempt` 次重试的实际间隔
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base(attempt);
        if !self.jitter {
            return base;
        }
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(base.as_secs_f64() * jitter).min(self.max)
    }
}

/// 格式化持续时间为人类可读的字符串
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();

    if seconds < 60 {
        return format!("{} 秒", seconds);
    }

    let minutes = seconds / 60;
    if minutes < 60 {
        return format!("{} 分钟 {} 秒", minutes, seconds % 60);
    }

    let hours = minutes / 60;
    if hours < 24 {
        return format!("{} 小时 {} 分钟", hours, minutes % 60);
    }

    let days = hours / 24;
    format!("{} 天 {} 小时", days, hours % 24)
}

/// chrono 时长转换为标准库时长，负值截断为零
pub fn to_std(duration: chrono::Duration) -> Duration {
    duration.to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1)]
    #[case(1, 2)]
    #[case(2, 4)]
    #[case(3, 8)]
    #[case(4, 10)]
    #[case(50, 10)]
    fn test_exponential_base(#[case] attempt: u32, #[case] expected_secs: u64) {
        let backoff = Backoff::exact(Duration::from_secs(1), Duration::from_secs(10), 2.0);
        assert_eq!(backoff.delay(attempt), Duration::from_secs(expected_secs));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = Backoff {
            initial: Duration::from_secs(4),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        };
        for _ in 0..100 {
            let d = backoff.delay(0);
            assert!(d >= Duration::from_secs(2) && d <= Duration::from_secs(6));
            assert!(backoff.delay(10) <= Duration::from_secs(10));
        }
    }

    #[rstest]
    #[case(30, "30 秒")]
    #[case(90, "1 分钟 30 秒")]
    #[case(3_720, "1 小时 2 分钟")]
    #[case(90_000, "1 天 1 小时")]
    fn test_format_duration(#[case] secs: u64, #[case] expected: &str) {
        assert_eq!(format_duration(Duration::from_secs(secs)), expected);
    }

    #[test]
    fn test_negative_chrono_duration() {
        assert_eq!(to_std(chrono::Duration::seconds(-5)), Duration::ZERO);
        assert_eq!(to_std(chrono::Duration::seconds(5)), Duration::from_secs(5));
    }
}
