//! TlsAcme Operator 可执行程序

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tlsacme_controller::AccountScope;
use tlsacme_operator::config::load_config;
use tlsacme_operator::{deactivate_account, TlsAcmeOperator};

/// TlsAcme - 为 Route 自动签发与续期 ACME 证书
#[derive(Parser, Debug)]
#[command(name = "tlsacme-operator", version, about, long_about = None)]
struct Cli {
    /// 配置文件路径（YAML 或 JSON）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 日志级别，会被 RUST_LOG 覆盖
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 运行控制器（默认）
    Run,
    /// 删除 ACME 账户 Secret，并尝试在服务端注销账户
    ///
    /// 当前 ACME 客户端不支持注销请求：Secret 会被删除，服务端上的账户保持有效。
    DeactivateAccount {
        /// Secret 所在命名空间
        #[arg(long)]
        namespace: String,
        /// Secret 名称，默认使用配置中的账户 Secret 名称
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Some(Commands::Run) | None => {
            let operator = TlsAcmeOperator::new(config).await?;
            operator.start().await?;
            tokio::signal::ctrl_c()
                .await
                .context("等待退出信号失败")?;
            info!("收到退出信号，正在停止");
            operator.stop().await
        }
        Some(Commands::DeactivateAccount { namespace, name }) => {
            let name = name.unwrap_or_else(|| config.acme.account_secret_name.clone());
            let scope = AccountScope::new(namespace, name);
            if deactivate_account(&config, &scope).await? {
                info!("账户 {} 已注销，Secret 已删除", scope);
            } else {
                warn!("账户 {} 的 Secret 已删除，但 ACME 服务端上的账户未被注销", scope);
            }
            Ok(())
        }
    }
}
