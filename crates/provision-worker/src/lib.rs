//! 订单开通工作者
//!
//! 从 RabbitMQ 消费"订单已创建"事件，按产品类型分发到对应的开通 handler，
//! 并向交换机发布带关联 ID 的开通结果事件。业务失败照常 ack，只有管道故障才拒绝投递。

pub mod consumer;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod product;
pub mod publisher;
pub mod registry;
