//! 开通服务错误类型
//!
//! 在共享库 ProvisionError 基础上定义本服务特有的错误变体，
//! 使调度循环可以区分"产品不支持 / 开通步骤失败 / 结果发布失败"等不同原因。

use provision_shared::error::ProvisionError;
use thiserror::Error;

use crate::handlers::ProvisioningStep;
use crate::product::ProductType;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// 解析结果为 Unknown，或注册表中没有对应 handler
    #[error("不支持的产品类型: {product_type}")]
    UnsupportedProductType { product_type: ProductType },

    /// 开通步骤调用外部系统失败，由 handler 内部吸收为 false
    #[error("开通步骤失败: 步骤={step}, 原因={reason}")]
    StepFailed {
        step: ProvisioningStep,
        reason: String,
    },

    #[error("结果事件发布失败: {0}")]
    Publish(String),

    /// 消费循环在收到关闭信号之前退出
    #[error("消费循环已停止: {0}")]
    ConsumerStopped(String),

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] ProvisionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = WorkerError::UnsupportedProductType {
            product_type: ProductType::Unknown,
        };
        assert_eq!(err.to_string(), "不支持的产品类型: unknown");

        let err = WorkerError::StepFailed {
            step: ProvisioningStep::ActivateSim,
            reason: "运营商接口超时".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "开通步骤失败: 步骤=activate_sim, 原因=运营商接口超时"
        );

        let err = WorkerError::Shared(ProvisionError::Amqp("channel closed".to_string()));
        assert_eq!(err.to_string(), "AMQP 错误: channel closed");
    }
}
