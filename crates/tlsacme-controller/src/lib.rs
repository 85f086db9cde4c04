//! TlsAcme 控制器核心
//!
//! 该模块实现证书生命周期的核心逻辑：ACME 账户管理、HTTP-01 挑战协调、
//! 证书决策与签发、续期调度。对象存储与 ACME 服务都通过 trait 抽象，
//! Kubernetes 绑定位于 operator 中。

pub mod acme;
pub mod certificate;
pub mod challenge;
pub mod store;
pub mod utils;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use acme::{AccountManager, AccountScope, AcmeAccount, AcmeClient, InstantAcmeClient};
pub use certificate::{
    decide, Decision, DecisionPolicy, Issuer, PassContext, RenewalPolicy, RenewalReason,
    RenewalScheduler,
};
pub use challenge::{ChallengeCoordinator, ChallengeExposer, ChallengePublisher, TokenRegistry};
pub use store::{AccountStore, EndpointStore};
