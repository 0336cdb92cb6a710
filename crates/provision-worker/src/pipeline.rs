//! 投递处理管道
//!
//! 单条投递的完整流程：解码 → 解析产品类型 → 分发到 handler → 构造结果事件 → 发布 → 决定 ack/拒绝。
//! 拆分为独立函数而非方法，便于在测试中直接调用而无需连接 broker。

use std::time::Instant;

use provision_shared::amqp::{Disposition, IncomingDelivery, routing};
use provision_shared::events::{OrderEvent, OrderView, ResultEvent, ResultType};
use provision_shared::observability::metrics;
use tracing::{error, info, warn};

use crate::product::ProductType;
use crate::publisher::ResultPublisher;
use crate::registry::HandlerRegistry;

/// 日志中截取的报文最大长度
const PAYLOAD_PREVIEW_LEN: usize = 256;

/// 分发结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub product_type: ProductType,
    pub success: bool,
}

impl DispatchOutcome {
    pub fn result_type(&self) -> ResultType {
        ResultType::from_success(self.success)
    }
}

/// 将订单分发到对应 handler
///
/// 产品类型无法识别时不查询注册表，直接判定失败；不支持的类型同样是业务失败而非错误。
pub async fn dispatch(registry: &HandlerRegistry, order: &OrderView) -> DispatchOutcome {
    let product_type = ProductType::resolve(Some(order.product_type.as_str()));

    if !product_type.is_known() {
        warn!(
            order_id = %order.id,
            raw_product_type = %order.product_type,
            "无法识别的产品类型，订单判定为失败"
        );
        return DispatchOutcome {
            product_type,
            success: false,
        };
    }

    let handler = match registry.resolve(product_type) {
        Ok(handler) => handler,
        Err(e) => {
            warn!(
                order_id = %order.id,
                product_type = %product_type,
                error = %e,
                "没有可用的开通 handler，订单判定为失败"
            );
            return DispatchOutcome {
                product_type,
                success: false,
            };
        }
    };

    let success = handler.process_order(order).await;
    DispatchOutcome {
        product_type,
        success,
    }
}

/// 处理单条入站投递并给出处置结果
///
/// - 解码失败：拒绝且不重新入队，不发布结果事件
/// - 其余情况必定构造并发布结果事件；发布成功即 ack，无论开通成功与否
/// - 发布失败：拒绝且不重新入队
pub async fn handle_delivery(
    registry: &HandlerRegistry,
    publisher: &dyn ResultPublisher,
    delivery: &IncomingDelivery,
) -> Disposition {
    let event = match OrderEvent::decode(&delivery.payload) {
        Ok(event) => event,
        Err(e) => {
            warn!(
                delivery_tag = delivery.delivery_tag,
                routing_key = %delivery.routing_key,
                envelope_message_id = ?delivery.message_id,
                source = ?delivery.headers.get(routing::HEADER_SOURCE),
                error = %e,
                code = e.code(),
                payload = %payload_preview(&delivery.payload),
                "订单事件解码失败，拒绝投递"
            );
            return Disposition::Reject;
        }
    };

    info!(
        delivery_tag = delivery.delivery_tag,
        message_id = %event.message_id,
        envelope_message_id = ?delivery.message_id,
        envelope_correlation_id = ?delivery.correlation_id,
        source = ?delivery.headers.get(routing::HEADER_SOURCE),
        order_id = %event.order.id,
        product_type = %event.order.product_type,
        redelivered = delivery.redelivered,
        "收到订单事件"
    );

    let started = Instant::now();
    let outcome = dispatch(registry, &event.order).await;
    metrics::record_order(
        outcome.product_type.as_str(),
        outcome.result_type().as_str(),
        started.elapsed().as_secs_f64(),
    );

    let result = ResultEvent::for_order(&event, outcome.success);

    match publisher.publish(&result).await {
        Ok(()) => {
            info!(
                message_id = %event.message_id,
                order_id = %event.order.id,
                result_type = %result.event_type,
                result_message_id = %result.message_id,
                "结果事件已发布"
            );
            Disposition::Ack
        }
        Err(e) => {
            // 开通结果丢失，拒绝后 broker 不会重新投递
            error!(
                message_id = %event.message_id,
                order_id = %event.order.id,
                result_type = %result.event_type,
                error = %e,
                "结果事件发布失败，拒绝投递"
            );
            Disposition::Reject
        }
    }
}

fn payload_preview(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() <= PAYLOAD_PREVIEW_LEN {
        return text.into_owned();
    }
    let mut preview: String = text.chars().take(PAYLOAD_PREVIEW_LEN).collect();
    preview.push('…');
    preview
}
