//! TlsAcme Common - 跨模块共享的数据结构与错误处理
//!
//! 该模块提供 TlsAcme 项目中所有组件共享的数据结构：端点（Route）模型、
//! 注解协议（自动 TLS 开关、暂停、账户关联、授权租约）、证书解析，
//! 以及统一的错误分类。

pub mod models;
pub mod error;

/// 重新导出常用类型，方便使用
pub use error::{Error, ErrorKind, Result};
pub use models::annotations::*;
pub use models::certificate::*;
pub use models::endpoint::*;
