//! 订单事件模型
//!
//! 定义入站的"订单已创建"事件与出站的开通结果事件。
//! 入站事件在生产方存在两种互不兼容的报文结构（嵌套 `order` 对象 / 扁平 `order_id`），
//! 解码时统一归一化为 `OrderView`，下游只依赖这一最小公共视图。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProvisionError;

// ---------------------------------------------------------------------------
// OrderView: 归一化后的订单视图
// ---------------------------------------------------------------------------

/// 归一化后的订单视图
///
/// 无论入站报文是哪种结构，解码成功后都至少包含订单 ID 与产品类型。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderView {
    pub id: String,
    /// 产品类型原始字符串，大小写与生产方一致，解析由 worker 负责
    pub product_type: String,
}

// ---------------------------------------------------------------------------
// OrderEvent: 入站订单事件
// ---------------------------------------------------------------------------

/// 入站订单事件
///
/// `message_id` 是出站结果事件的关联键；其余可选字段只用于日志，不参与业务判断。
#[derive(Debug, Clone, PartialEq)]
pub struct OrderEvent {
    pub message_id: String,
    pub order: OrderView,
    pub occurred_at: Option<String>,
    pub task_id: Option<String>,
    pub step_key: Option<String>,
    pub amount: Option<serde_json::Value>,
    pub customer_id: Option<String>,
}

/// 订单 ID 在不同生产方中可能是字符串也可能是整数
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(serde_json::Number),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

/// 嵌套结构中的 `order` 对象
#[derive(Debug, Deserialize)]
struct WireOrder {
    id: Option<WireId>,
    product_type: Option<String>,
    amount: Option<serde_json::Value>,
    customer_id: Option<WireId>,
}

/// 入站报文的宽松反序列化形态
///
/// 两种结构的字段全部声明为可选，反序列化后再校验必填项，
/// 这样缺字段时能给出明确的字段名，而不是 serde 的通用报错。
#[derive(Debug, Deserialize)]
struct WireOrderEvent {
    message_id: Option<String>,
    occurred_at: Option<serde_json::Value>,
    order: Option<WireOrder>,
    order_id: Option<WireId>,
    id: Option<WireId>,
    product_type: Option<String>,
    task_id: Option<WireId>,
    step_key: Option<String>,
}

impl OrderEvent {
    /// 从原始消息体解码订单事件
    ///
    /// 未知字段忽略；`message_id`、订单 ID、产品类型任一缺失返回 `MissingField`，
    /// JSON 本身非法返回 `Decode`。嵌套 `order` 对象中的字段优先于顶层扁平字段。
    pub fn decode(payload: &[u8]) -> Result<Self, ProvisionError> {
        let wire: WireOrderEvent =
            serde_json::from_slice(payload).map_err(|e| ProvisionError::Decode(e.to_string()))?;

        let message_id = wire
            .message_id
            .filter(|s| !s.trim().is_empty())
            .ok_or(ProvisionError::MissingField {
                field: "message_id",
            })?;

        let (nested_id, nested_type, amount, customer_id) = match wire.order {
            Some(order) => (
                order.id,
                order.product_type,
                order.amount,
                order.customer_id.map(WireId::into_string),
            ),
            None => (None, None, None, None),
        };

        let order_id = nested_id
            .or(wire.order_id)
            .or(wire.id)
            .map(WireId::into_string)
            .filter(|s| !s.trim().is_empty())
            .ok_or(ProvisionError::MissingField { field: "order.id" })?;

        // 空字符串的产品类型仍然合法，交给解析器归为 Unknown
        let product_type =
            nested_type
                .or(wire.product_type)
                .ok_or(ProvisionError::MissingField {
                    field: "product_type",
                })?;

        let occurred_at = wire.occurred_at.and_then(|v| match v {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Null => None,
            other => Some(other.to_string()),
        });

        Ok(Self {
            message_id,
            order: OrderView {
                id: order_id,
                product_type,
            },
            occurred_at,
            task_id: wire.task_id.map(WireId::into_string),
            step_key: wire.step_key,
            amount,
            customer_id,
        })
    }
}

// ---------------------------------------------------------------------------
// ResultType: 开通结果标签
// ---------------------------------------------------------------------------

/// 开通结果标签
///
/// 同时作为出站事件的 `type`、订单快照的 `status` 以及发布时的 routing key。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Fulfilled,
    Failed,
}

impl ResultType {
    pub fn from_success(success: bool) -> Self {
        if success { Self::Fulfilled } else { Self::Failed }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fulfilled => "fulfilled",
            Self::Failed => "failed",
        }
    }

    /// 所有取值，用于声明出站队列绑定
    pub const ALL: [ResultType; 2] = [ResultType::Fulfilled, ResultType::Failed];
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ResultEvent: 出站结果事件
// ---------------------------------------------------------------------------

/// 出站结果事件中的订单快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultOrder {
    pub id: String,
    pub product_type: String,
    pub status: ResultType,
}

/// 出站结果事件
///
/// 字段顺序即 JSON 输出顺序。`event_type` 与 `order.status` 由同一个 `ResultType`
/// 构造，二者不可能不一致。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEvent {
    /// 本条出站事件的唯一标识（UUID v7）
    pub message_id: String,
    /// 等于触发本事件的入站 `message_id`
    pub correlation_id: String,
    #[serde(rename = "type")]
    pub event_type: ResultType,
    pub occurred_at: DateTime<Utc>,
    pub order: ResultOrder,
}

impl ResultEvent {
    /// 根据入站事件与开通结果构造出站事件
    pub fn for_order(event: &OrderEvent, success: bool) -> Self {
        let result_type = ResultType::from_success(success);
        Self {
            message_id: Uuid::now_v7().to_string(),
            correlation_id: event.message_id.clone(),
            event_type: result_type,
            occurred_at: Utc::now(),
            order: ResultOrder {
                id: event.order.id.clone(),
                product_type: event.order.product_type.clone(),
                status: result_type,
            },
        }
    }

    /// 发布时使用的 routing key，与 `type` 取值相同
    pub fn routing_key(&self) -> &'static str {
        self.event_type.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_flat_shape() {
        let payload = br#"{"message_id":"m1","order_id":"o1","product_type":"router"}"#;
        let event = OrderEvent::decode(payload).unwrap();

        assert_eq!(event.message_id, "m1");
        assert_eq!(event.order.id, "o1");
        assert_eq!(event.order.product_type, "router");
        assert!(event.amount.is_none());
    }

    #[test]
    fn test_decode_nested_shape() {
        let payload = json!({
            "message_id": "m-nested",
            "occurred_at": "2024-05-01T10:00:00Z",
            "order": {
                "id": "o-42",
                "product_type": "Handset",
                "amount": 199.99,
                "customer_id": "c-7"
            }
        });
        let event = OrderEvent::decode(payload.to_string().as_bytes()).unwrap();

        assert_eq!(event.order.id, "o-42");
        assert_eq!(event.order.product_type, "Handset");
        assert_eq!(event.customer_id.as_deref(), Some("c-7"));
        assert_eq!(event.occurred_at.as_deref(), Some("2024-05-01T10:00:00Z"));
        assert!(event.amount.is_some());
    }

    #[test]
    fn test_decode_task_shape_with_numeric_ids() {
        let payload = json!({
            "message_id": "m-task",
            "task_id": 991,
            "id": 12345,
            "step_key": "provision",
            "product_type": "broadband_line"
        });
        let event = OrderEvent::decode(payload.to_string().as_bytes()).unwrap();

        assert_eq!(event.order.id, "12345");
        assert_eq!(event.task_id.as_deref(), Some("991"));
        assert_eq!(event.step_key.as_deref(), Some("provision"));
    }

    #[test]
    fn test_decode_prefers_nested_order() {
        let payload = json!({
            "message_id": "m2",
            "order_id": "flat-id",
            "product_type": "router",
            "order": { "id": "nested-id", "product_type": "handset" }
        });
        let event = OrderEvent::decode(payload.to_string().as_bytes()).unwrap();

        assert_eq!(event.order.id, "nested-id");
        assert_eq!(event.order.product_type, "handset");
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let payload = br#"{"message_id":"m3","order_id":"o3","product_type":"router","extra":{"a":1}}"#;
        assert!(OrderEvent::decode(payload).is_ok());
    }

    #[test]
    fn test_decode_missing_message_id() {
        let payload = br#"{"order_id":"o1","product_type":"router"}"#;
        let err = OrderEvent::decode(payload).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::MissingField {
                field: "message_id"
            }
        ));
    }

    #[test]
    fn test_decode_blank_message_id_is_missing() {
        let payload = br#"{"message_id":"  ","order_id":"o1","product_type":"router"}"#;
        assert!(OrderEvent::decode(payload).is_err());
    }

    #[test]
    fn test_decode_missing_order_id() {
        let payload = br#"{"message_id":"m1","product_type":"router"}"#;
        let err = OrderEvent::decode(payload).unwrap_err();
        assert!(matches!(err, ProvisionError::MissingField { field: "order.id" }));
    }

    #[test]
    fn test_decode_missing_product_type() {
        let payload = br#"{"message_id":"m1","order_id":"o1"}"#;
        let err = OrderEvent::decode(payload).unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::MissingField {
                field: "product_type"
            }
        ));
    }

    #[test]
    fn test_decode_empty_product_type_is_accepted() {
        let payload = br#"{"message_id":"m1","order_id":"o1","product_type":""}"#;
        let event = OrderEvent::decode(payload).unwrap();
        assert_eq!(event.order.product_type, "");
    }

    #[test]
    fn test_decode_invalid_json() {
        let err = OrderEvent::decode(b"not valid json").unwrap_err();
        assert!(matches!(err, ProvisionError::Decode(_)));
    }

    #[test]
    fn test_decode_is_idempotent() {
        let payload = br#"{"message_id":"m1","order":{"id":"o1","product_type":"router","amount":10}}"#;
        assert_eq!(
            OrderEvent::decode(payload).unwrap(),
            OrderEvent::decode(payload).unwrap()
        );
    }

    #[test]
    fn test_result_event_correlates_and_agrees() {
        let event = OrderEvent::decode(
            br#"{"message_id":"m1","order_id":"o1","product_type":"router"}"#,
        )
        .unwrap();

        for success in [true, false] {
            let result = ResultEvent::for_order(&event, success);
            assert_eq!(result.correlation_id, "m1");
            assert_eq!(result.event_type, result.order.status);
            assert_eq!(result.event_type, ResultType::from_success(success));
            assert_eq!(result.routing_key(), result.event_type.as_str());
            assert_ne!(result.message_id, event.message_id);
        }
    }

    #[test]
    fn test_result_event_fresh_message_ids() {
        let event = OrderEvent::decode(
            br#"{"message_id":"m1","order_id":"o1","product_type":"router"}"#,
        )
        .unwrap();
        let a = ResultEvent::for_order(&event, true);
        let b = ResultEvent::for_order(&event, true);
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_result_event_wire_format() {
        let event = OrderEvent::decode(
            br#"{"message_id":"m1","order_id":"o1","product_type":"router"}"#,
        )
        .unwrap();
        let result = ResultEvent::for_order(&event, false);
        let value = serde_json::to_value(&result).unwrap();

        assert_eq!(value["correlation_id"], "m1");
        assert_eq!(value["type"], "failed");
        assert_eq!(value["order"]["id"], "o1");
        assert_eq!(value["order"]["product_type"], "router");
        assert_eq!(value["order"]["status"], "failed");
        assert!(value["occurred_at"].is_string());
        assert!(value.get("event_type").is_none());
    }
}
