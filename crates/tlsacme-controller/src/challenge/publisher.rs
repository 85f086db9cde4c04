//! 挑战令牌发布

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tlsacme_common::{Error, Result};
use tracing::{debug, trace};

/// 挑战令牌发布者
///
/// 令牌表是增量的：不同端点的令牌互不影响，按令牌键控。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChallengePublisher: Send + Sync {
    /// 发布令牌与应答
    async fn publish(&self, token: &str, key_authorization: &str) -> Result<()>;

    /// 撤回令牌，不存在时视为成功
    async fn withdraw(&self, token: &str) -> Result<()>;
}

/// 进程内令牌表
#[derive(Debug, Clone, Default)]
pub struct TokenRegistry {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl TokenRegistry {
    /// 创建空的令牌表
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询令牌对应的应答
    pub fn lookup(&self, token: &str) -> Option<String> {
        let found = self
            .tokens
            .read()
            .ok()
            .and_then(|tokens| tokens.get(token).cloned());
        trace!("查询挑战令牌 {}: {}", token, found.is_some());
        found
    }

    /// 当前发布的令牌数
    pub fn len(&self) -> usize {
        self.tokens.read().map(|t| t.len()).unwrap_or(0)
    }

    /// 是否没有发布任何令牌
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChallengePublisher for TokenRegistry {
    async fn publish(&self, token: &str, key_authorization: &str) -> Result<()> {
        let mut tokens = self
            .tokens
            .write()
            .map_err(|_| Error::Transient("令牌表锁已中毒".to_string()))?;
        tokens.insert(token.to_string(), key_authorization.to_string());
        debug!("已发布挑战令牌 {}", token);
        Ok(())
    }

    async fn withdraw(&self, token: &str) -> Result<()> {
        let mut tokens = self
            .tokens
            .write()
            .map_err(|_| Error::Transient("令牌表锁已中毒".to_string()))?;
        if tokens.remove(token).is_some() {
            debug!("已撤回挑战令牌 {}", token);
        }
        Ok(())
    }
}
