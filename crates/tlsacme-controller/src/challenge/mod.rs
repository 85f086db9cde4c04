//! HTTP-01 挑战模块
//!
//! 包含令牌发布抽象、内存令牌表、对外应答服务以及挑战协调器。

mod coordinator;
mod exposer;
mod publisher;

pub use coordinator::{ChallengeCoordinator, ChallengeTimings};
pub use exposer::{ChallengeExposer, ACME_CHALLENGE_PREFIX};
pub use publisher::{ChallengePublisher, TokenRegistry};

#[cfg(test)]
pub use publisher::MockChallengePublisher;
