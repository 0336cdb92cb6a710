//! 结果事件发布
//!
//! 管道只依赖 `ResultPublisher` trait，生产环境由 `AmqpPublisher` 实现，
//! 测试中替换为 mock 或记录型实现。

use async_trait::async_trait;
use provision_shared::amqp::{AmqpPublisher, PublishEnvelope};
use provision_shared::events::ResultEvent;
use provision_shared::observability::metrics;
use tracing::debug;

use crate::error::WorkerError;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    /// 发布结果事件，broker 确认后返回
    async fn publish(&self, event: &ResultEvent) -> Result<(), WorkerError>;
}

/// 由结果事件构造传输层信封
pub fn envelope_for(event: &ResultEvent) -> PublishEnvelope {
    PublishEnvelope {
        message_id: event.message_id.clone(),
        correlation_id: event.correlation_id.clone(),
        event_type: event.event_type.as_str().to_string(),
        timestamp: event.occurred_at.timestamp().max(0) as u64,
    }
}

#[async_trait]
impl ResultPublisher for AmqpPublisher {
    async fn publish(&self, event: &ResultEvent) -> Result<(), WorkerError> {
        let envelope = envelope_for(event);

        self.publish_json(event.routing_key(), &envelope, event)
            .await
            .map_err(|e| WorkerError::Publish(e.to_string()))?;

        metrics::record_result_published(event.event_type.as_str());
        debug!(
            message_id = %event.message_id,
            correlation_id = %event.correlation_id,
            routing_key = event.routing_key(),
            "结果事件已确认"
        );
        Ok(())
    }
}
