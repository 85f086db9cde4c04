//! 错误处理模块
//!
//! 该模块提供 TlsAcme 项目的统一错误类型。每个错误都归入一个 [`ErrorKind`]，
//! 协调控制器只依据类别决定重试策略：瞬时错误走退避重试，版本冲突立即重读，
//! 验证失败与致命错误只在常规重新同步周期内重试。

use std::io;
use thiserror::Error;

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 网络、对象存储、ACME 5xx/限流、超时
    Transient,
    /// 乐观并发版本不一致或资源已存在
    Conflict,
    /// ACME 永久拒绝了订单或挑战
    Invalid,
    /// 端点配置无法满足
    Fatal,
    /// 端点已被删除
    Gone,
}

/// TlsAcme 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 瞬时错误
    #[error("瞬时错误: {0}")]
    Transient(String),

    /// 版本冲突
    #[error("版本冲突: {0}")]
    Conflict(String),

    /// ACME 验证失败
    #[error("验证失败: {0}")]
    Invalid(String),

    /// 端点配置错误
    #[error("致命错误: {0}")]
    Fatal(String),

    /// 端点已删除
    #[error("端点已删除: {0}")]
    Gone(String),

    /// 本次协调已超时或被取消
    #[error("协调已中止: {0}")]
    Cancelled(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 证书解析错误
    #[error("证书错误: {0}")]
    Certificate(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] io::Error),

    /// JSON 错误
    #[error("JSON 错误: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// 错误所属类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient(_) | Error::Cancelled(_) | Error::Io(_) => ErrorKind::Transient,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Invalid(_) | Error::Certificate(_) => ErrorKind::Invalid,
            Error::Fatal(_) | Error::Config(_) | Error::Json(_) => ErrorKind::Fatal,
            Error::Gone(_) => ErrorKind::Gone,
        }
    }

    /// 是否为版本冲突
    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    /// 是否表示端点已删除
    pub fn is_gone(&self) -> bool {
        self.kind() == ErrorKind::Gone
    }
}

/// TlsAcme 结果类型别名
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::Transient("x".into()).kind(), ErrorKind::Transient);
        assert_eq!(Error::Cancelled("x".into()).kind(), ErrorKind::Transient);
        assert_eq!(Error::Conflict("x".into()).kind(), ErrorKind::Conflict);
        assert_eq!(Error::Invalid("x".into()).kind(), ErrorKind::Invalid);
        assert_eq!(Error::Certificate("x".into()).kind(), ErrorKind::Invalid);
        assert_eq!(Error::Fatal("x".into()).kind(), ErrorKind::Fatal);
        assert!(Error::Gone("x".into()).is_gone());
        assert!(Error::Conflict("x".into()).is_conflict());
    }

    #[test]
    fn test_io_error_is_transient() {
        let err: Error = io::Error::new(io::ErrorKind::TimedOut, "timeout").into();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }
}
