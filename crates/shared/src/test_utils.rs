//! 测试工具模块
//!
//! 提供单元测试与集成测试共用的报文样例与投递构造器，
//! 覆盖生产方已知的两种订单事件结构。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{Value, json};
use uuid::Uuid;

use crate::amqp::{IncomingDelivery, routing};

/// 生成唯一的测试消息 ID
pub fn test_message_id() -> String {
    format!("test-msg-{}", Uuid::new_v4())
}

/// 生成单调递增的 delivery tag，模拟同一 channel 上的投递序号
pub fn next_delivery_tag() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::SeqCst)
}

/// 订单事件报文生成器
pub struct OrderPayloads;

impl OrderPayloads {
    /// 扁平结构：`order_id` + 顶层 `product_type`
    pub fn flat(message_id: &str, order_id: &str, product_type: &str) -> Value {
        json!({
            "message_id": message_id,
            "order_id": order_id,
            "product_type": product_type,
        })
    }

    /// 嵌套结构：`order` 对象携带金额与客户信息
    pub fn nested(message_id: &str, order_id: &str, product_type: &str) -> Value {
        json!({
            "message_id": message_id,
            "occurred_at": "2024-05-01T10:00:00Z",
            "order": {
                "id": order_id,
                "product_type": product_type,
                "amount": 49.5,
                "customer_id": "cust-001",
            }
        })
    }

    /// 任务结构：`task_id` / `step_key`，订单 ID 为整数
    pub fn task(message_id: &str, order_id: i64, product_type: &str) -> Value {
        json!({
            "message_id": message_id,
            "task_id": format!("task-{order_id}"),
            "order_id": order_id,
            "step_key": "provision",
            "product_type": product_type,
        })
    }
}

/// 以原始字节构造一条入站投递
pub fn delivery_from_bytes(payload: &[u8]) -> IncomingDelivery {
    IncomingDelivery {
        delivery_tag: next_delivery_tag(),
        routing_key: routing::ORDER_CREATED.to_string(),
        redelivered: false,
        payload: payload.to_vec(),
        message_id: None,
        correlation_id: None,
        headers: HashMap::new(),
    }
}

/// 以 JSON 值构造一条入站投递
pub fn delivery_from_json(value: &Value) -> IncomingDelivery {
    delivery_from_bytes(value.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OrderEvent;

    #[test]
    fn test_all_shapes_decode_to_same_view() {
        let flat = OrderEvent::decode(OrderPayloads::flat("m", "42", "router").to_string().as_bytes())
            .unwrap();
        let nested =
            OrderEvent::decode(OrderPayloads::nested("m", "42", "router").to_string().as_bytes())
                .unwrap();
        let task = OrderEvent::decode(OrderPayloads::task("m", 42, "router").to_string().as_bytes())
            .unwrap();

        assert_eq!(flat.order, nested.order);
        assert_eq!(flat.order, task.order);
    }

    #[test]
    fn test_delivery_tags_are_unique() {
        let a = delivery_from_bytes(b"{}");
        let b = delivery_from_bytes(b"{}");
        assert_ne!(a.delivery_tag, b.delivery_tag);
        assert_eq!(a.routing_key, routing::ORDER_CREATED);
    }
}
