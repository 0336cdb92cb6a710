//! 统一错误处理模块
//!
//! 定义开通系统中所有共享的错误类型，使用 thiserror 提供良好的错误信息。

use std::any::Any;

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum ProvisionError {
    // ==================== AMQP 错误 ====================
    #[error("AMQP 错误: {0}")]
    Amqp(String),

    #[error("消息发布被 broker 拒绝: routing_key={routing_key}")]
    PublishNacked { routing_key: String },

    // ==================== 配置错误 ====================
    #[error("配置错误: {0}")]
    Config(#[from] config::ConfigError),

    // ==================== 消息解码错误 ====================
    #[error("消息解码失败: {0}")]
    Decode(String),

    #[error("消息缺少必填字段: {field}")]
    MissingField { field: &'static str },

    #[error("序列化失败: {0}")]
    Serialization(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, ProvisionError>;

impl ProvisionError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Amqp(_) => "AMQP_ERROR",
            Self::PublishNacked { .. } => "PUBLISH_NACKED",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Decode(_) => "DECODE_ERROR",
            Self::MissingField { .. } => "MISSING_FIELD",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 只有 broker 连接层面的故障才有重试价值，坏消息重投多少次都一样。
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Amqp(_) | Self::PublishNacked { .. })
    }
}

/// 从 panic 负载中提取可读消息
///
/// `panic!` 的负载通常是 `&str` 或 `String`，其余类型无法还原。
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知 panic".to_string()
    }
}

impl From<lapin::Error> for ProvisionError {
    fn from(err: lapin::Error) -> Self {
        Self::Amqp(err.to_string())
    }
}
