//! 配置管理模块
//!
//! 配置按以下顺序叠加，后者覆盖前者：内置默认值、可选的 YAML/JSON 配置文件、
//! 以 `TLSACME__` 为前缀的环境变量（如 `TLSACME__CONTROLLER__WORKERS=8`）。
//! 列表类字段只能通过配置文件设置。

use anyhow::{anyhow, bail, Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tlsacme_controller::challenge::ChallengeTimings;
use tlsacme_controller::utils::Backoff;
use tlsacme_controller::{DecisionPolicy, RenewalPolicy, RenewalScheduler};

/// 环境变量前缀
pub const ENV_PREFIX: &str = "TLSACME";

/// 最小续期窗口上限：Let's Encrypt 90 天证书有效期的一半
pub const MAX_MINIMUM_WINDOW_SECONDS: u64 = 45 * 86400;

/// Let's Encrypt 生产环境目录
pub const LETS_ENCRYPT_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Operator 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorConfig {
    /// ACME 服务配置
    pub acme: AcmeConfig,
    /// 控制器配置
    pub controller: ControllerConfig,
    /// 续期配置
    pub renewal: RenewalConfig,
    /// 失败重试配置
    pub backoff: BackoffConfig,
    /// 挑战配置
    pub challenge: ChallengeConfig,
    /// 指标服务器配置
    pub metrics: MetricsConfig,
    /// 日志级别
    pub log_level: String,
}

/// ACME 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcmeConfig {
    /// 目录 URL
    pub directory_url: String,
    /// 注册账户时使用的联系方式
    #[serde(default)]
    pub contacts: Vec<String>,
    /// 账户 Secret 名称
    pub account_secret_name: String,
    /// 账户 Secret 所在命名空间；为空时每个端点命名空间各自使用一个账户
    #[serde(default)]
    pub account_namespace: Option<String>,
}

/// 控制器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// 并发工作者数量
    pub workers: usize,
    /// 监听的命名空间，为空表示全部
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// 单次协调超时（秒）
    pub pass_timeout_seconds: u64,
    /// 重新同步间隔（秒）
    pub resync_interval_seconds: u64,
    /// 授权租约有效期（秒）
    pub lock_ttl_seconds: u64,
    /// 租约持有者标识；为空时由主机名生成
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// 续期配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewalConfig {
    /// 续期窗口占总有效期的比例
    pub window_fraction: f64,
    /// 最小续期窗口（秒）
    pub minimum_window_seconds: u64,
}

/// 失败重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// 首次重试间隔（秒）
    pub initial_seconds: u64,
    /// 最大间隔（秒）
    pub max_seconds: u64,
    /// 倍率
    pub multiplier: f64,
}

/// 挑战配置
///
/// 应答服务只返回本进程发布的令牌，多副本部署时挑战路径必须路由到持有租约的副本。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeConfig {
    /// 应答服务监听地址
    pub listen_address: String,
    /// 应答服务监听端口
    pub port: u16,
    /// 首次轮询间隔（毫秒）
    pub poll_initial_millis: u64,
    /// 最大轮询间隔（毫秒）
    pub poll_max_millis: u64,
    /// 单个授权最长等待时间（秒）
    pub ceiling_seconds: u64,
}

/// 指标服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// 监听地址
    pub listen_address: String,
    /// 监听端口
    pub port: u16,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        create_default_config()
    }
}

/// 创建默认配置
pub fn create_default_config() -> OperatorConfig {
    OperatorConfig {
        acme: AcmeConfig {
            directory_url: LETS_ENCRYPT_DIRECTORY.to_string(),
            contacts: Vec::new(),
            account_secret_name: "acme-account".to_string(),
            account_namespace: None,
        },
        controller: ControllerConfig {
            workers: 4,
            namespaces: Vec::new(),
            pass_timeout_seconds: 600,
            resync_interval_seconds: 3600,
            lock_ttl_seconds: 900,
            owner_id: None,
        },
        renewal: RenewalConfig {
            window_fraction: 1.0 / 3.0,
            minimum_window_seconds: 86400,
        },
        backoff: BackoffConfig {
            initial_seconds: 5,
            max_seconds: 300,
            multiplier: 2.0,
        },
        challenge: ChallengeConfig {
            listen_address: "0.0.0.0".to_string(),
            port: 8089,
            poll_initial_millis: 2000,
            poll_max_millis: 30000,
            ceiling_seconds: 300,
        },
        metrics: MetricsConfig {
            listen_address: "0.0.0.0".to_string(),
            port: 9090,
        },
        log_level: "info".to_string(),
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}

/// 加载配置
pub fn load_config(path: Option<&Path>) -> Result<OperatorConfig> {
    load_with_environment(path, environment())
}

fn load_with_environment(path: Option<&Path>, env: Environment) -> Result<OperatorConfig> {
    let defaults = Config::try_from(&create_default_config()).context("序列化默认配置失败")?;
    let mut builder = Config::builder().add_source(defaults);

    if let Some(path) = path {
        let config_file = path.to_str().ok_or_else(|| anyhow!("配置路径无效"))?;
        let format = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => FileFormat::Yaml,
            Some("json") => FileFormat::Json,
            _ => bail!("不支持的配置文件格式，仅支持 YAML 或 JSON"),
        };
        builder = builder.add_source(File::with_name(config_file).format(format));
    }

    let config = builder
        .add_source(env)
        .build()
        .context("构建配置失败")?
        .try_deserialize::<OperatorConfig>()
        .context("配置格式错误")?;
    config.validate()?;
    Ok(config)
}

impl OperatorConfig {
    /// 检查配置是否自洽
    pub fn validate(&self) -> Result<()> {
        let url = &self.acme.directory_url;
        if !(url.starts_with("https://") || url.starts_with("http://")) {
            bail!("ACME 目录 URL 无效: {}", url);
        }
        if self.acme.account_secret_name.trim().is_empty() {
            bail!("账户 Secret 名称不能为空");
        }
        if self.controller.workers == 0 {
            bail!("工作者数量必须大于 0");
        }
        if self.controller.resync_interval_seconds == 0 {
            bail!("重新同步间隔必须大于 0");
        }
        // 协调未结束前租约不能过期，否则其他实例会回收仍在使用的租约
        if self.controller.pass_timeout_seconds >= self.controller.lock_ttl_seconds {
            bail!(
                "单次协调超时（{} 秒）必须小于租约有效期（{} 秒）",
                self.controller.pass_timeout_seconds,
                self.controller.lock_ttl_seconds
            );
        }
        if !(self.renewal.window_fraction > 0.0 && self.renewal.window_fraction < 1.0) {
            bail!("续期窗口比例必须在 (0, 1) 之间");
        }
        if self.renewal.minimum_window_seconds > MAX_MINIMUM_WINDOW_SECONDS {
            bail!(
                "最小续期窗口（{} 秒）不能超过 {} 秒",
                self.renewal.minimum_window_seconds,
                MAX_MINIMUM_WINDOW_SECONDS
            );
        }
        if self.backoff.initial_seconds == 0 || self.backoff.max_seconds < self.backoff.initial_seconds {
            bail!("退避间隔配置无效");
        }
        if self.backoff.multiplier < 1.0 {
            bail!("退避倍率不能小于 1");
        }
        if self.challenge.poll_initial_millis == 0
            || self.challenge.poll_max_millis < self.challenge.poll_initial_millis
        {
            bail!("挑战轮询间隔配置无效");
        }
        self.challenge_addr()?;
        self.metrics_addr()?;
        Ok(())
    }

    /// 单次协调超时
    pub fn pass_timeout(&self) -> Duration {
        Duration::from_secs(self.controller.pass_timeout_seconds)
    }

    /// 重新同步间隔
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.controller.resync_interval_seconds)
    }

    /// 续期策略
    pub fn renewal_policy(&self) -> RenewalPolicy {
        RenewalPolicy {
            fraction: self.renewal.window_fraction,
            minimum: chrono::Duration::seconds(self.renewal.minimum_window_seconds as i64),
        }
    }

    /// 决策参数
    pub fn decision_policy(&self) -> DecisionPolicy {
        DecisionPolicy {
            lock_ttl: chrono::Duration::seconds(self.controller.lock_ttl_seconds as i64),
            renewal: self.renewal_policy(),
        }
    }

    /// 续期调度器
    pub fn scheduler(&self) -> RenewalScheduler {
        RenewalScheduler::new(self.renewal_policy(), self.resync_interval())
    }

    /// 失败重试退避
    pub fn backoff(&self) -> Backoff {
        Backoff {
            initial: Duration::from_secs(self.backoff.initial_seconds),
            max: Duration::from_secs(self.backoff.max_seconds),
            multiplier: self.backoff.multiplier,
            jitter: true,
        }
    }

    /// 挑战轮询参数
    pub fn challenge_timings(&self) -> ChallengeTimings {
        ChallengeTimings {
            poll: Backoff::exact(
                Duration::from_millis(self.challenge.poll_initial_millis),
                Duration::from_millis(self.challenge.poll_max_millis),
                2.0,
            ),
            ceiling: Duration::from_secs(self.challenge.ceiling_seconds),
        }
    }

    /// 挑战应答服务地址
    pub fn challenge_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.challenge.listen_address, self.challenge.port)
    }

    /// 指标服务地址
    pub fn metrics_addr(&self) -> Result<SocketAddr> {
        parse_addr(&self.metrics.listen_address, self.metrics.port)
    }

    /// 租约持有者标识
    pub fn owner_id(&self) -> String {
        match &self.controller.owner_id {
            Some(id) if !id.trim().is_empty() => id.clone(),
            _ => {
                let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "tlsacme".to_string());
                let suffix = uuid::Uuid::new_v4().simple().to_string();
                format!("{}-{}", host, &suffix[..8])
            }
        }
    }
}

fn parse_addr(address: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", address, port)
        .parse()
        .with_context(|| format!("监听地址无效: {}:{}", address, port))
}
