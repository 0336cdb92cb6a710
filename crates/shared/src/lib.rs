//! 共享库
//!
//! 包含所有开通服务共用的配置、错误处理、事件模型、AMQP 网关、重试与可观测性等基础设施代码。

pub mod amqp;
pub mod config;
pub mod error;
pub mod events;
pub mod observability;
pub mod retry;
pub mod test_utils;
