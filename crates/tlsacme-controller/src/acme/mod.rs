//! ACME 模块
//!
//! 包含 ACME 协议客户端抽象、基于 instant-acme 的实现以及账户管理器。

mod account;
mod client;
mod instant;

pub use account::{AccountManager, AccountScope, AccountStatus, AcmeAccount};
pub use client::{
    AcmeClient, AuthorizationState, AuthorizationStatus, ChallengeInfo, ChallengeKind,
    OrderHandle, OrderStatus, RegisteredAccount,
};
pub use instant::InstantAcmeClient;
