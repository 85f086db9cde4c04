//! 数据模型模块
//!
//! 该模块定义了 TlsAcme 项目中使用的核心数据模型，包括端点、
//! 注解协议以及证书信息。

pub mod annotations;
pub mod certificate;
pub mod endpoint;
