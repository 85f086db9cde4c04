//! 证书生命周期模块
//!
//! 包含单端点决策函数、签发流程以及续期调度。

mod decision;
mod issuer;
mod scheduler;

pub use decision::{decide, Decision, DecisionPolicy, RenewalReason};
pub use issuer::{Issuer, PassContext};
pub use scheduler::{RenewalPolicy, RenewalScheduler};
