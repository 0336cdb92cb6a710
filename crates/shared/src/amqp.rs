//! RabbitMQ 基础设施封装
//!
//! 将 lapin 的底层 API 封装为业务友好的 Connection/Publisher/Consumer 抽象，
//! 统一拓扑声明、消息属性、确认/拒绝语义与优雅关闭，避免各服务重复编写样板代码。

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

use crate::config::RabbitConfig;
use crate::error::{ProvisionError, panic_message};
use crate::events::ResultType;

// ---------------------------------------------------------------------------
// 路由常量
// ---------------------------------------------------------------------------

/// 集中管理 routing key 与消息属性常量，防止字符串散落在各服务中导致拼写不一致
pub mod routing {
    pub const ORDER_CREATED: &str = "order.created";
    pub const CONTENT_TYPE_JSON: &str = "application/json";
    /// AMQP delivery_mode=2 表示持久化消息
    pub const PERSISTENT: u8 = 2;
    pub const HEADER_TYPE: &str = "type";
    pub const HEADER_SOURCE: &str = "source";
}

// ---------------------------------------------------------------------------
// Disposition
// ---------------------------------------------------------------------------

/// 单条投递的最终处置
///
/// 由业务 handler 决定，消费循环负责落到 broker 上。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// 确认消费，broker 可丢弃该消息
    Ack,
    /// 拒绝且不重新入队
    Reject,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ack => "ack",
            Self::Reject => "reject",
        }
    }
}

// ---------------------------------------------------------------------------
// IncomingDelivery
// ---------------------------------------------------------------------------

/// 消费到的 AMQP 投递的统一表示
///
/// 将 lapin 的 `Delivery`（内含 acker）拆出为只读的、拥有所有权的结构体，
/// handler 只能看到内容，确认/拒绝统一由消费循环执行。
#[derive(Debug, Clone)]
pub struct IncomingDelivery {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
    pub payload: Vec<u8>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub headers: HashMap<String, String>,
}

impl IncomingDelivery {
    fn from_delivery(delivery: &Delivery) -> Self {
        let properties = &delivery.properties;

        let mut headers = HashMap::new();
        if let Some(table) = properties.headers() {
            for (key, value) in table.inner() {
                if let AMQPValue::LongString(s) = value
                    && let Ok(text) = std::str::from_utf8(s.as_bytes())
                {
                    headers.insert(key.as_str().to_string(), text.to_string());
                }
            }
        }

        Self {
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
            payload: delivery.data.clone(),
            message_id: properties.message_id().as_ref().map(|s| s.as_str().to_string()),
            correlation_id: properties
                .correlation_id()
                .as_ref()
                .map(|s| s.as_str().to_string()),
            headers,
        }
    }
}

// ---------------------------------------------------------------------------
// PublishEnvelope
// ---------------------------------------------------------------------------

/// 出站消息的信封元数据
///
/// 这些字段写入 AMQP 属性（而不仅是消息体），下游无需解析 JSON 即可完成关联与路由。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishEnvelope {
    pub message_id: String,
    pub correlation_id: String,
    pub event_type: String,
    /// Unix 时间戳（秒）
    pub timestamp: u64,
}

/// 构造出站消息属性：JSON、持久化、message-id / correlation-id 以及 type/source header
pub fn build_properties(envelope: &PublishEnvelope, source: &str) -> BasicProperties {
    let mut headers = FieldTable::default();
    headers.insert(
        ShortString::from(routing::HEADER_TYPE),
        AMQPValue::LongString(LongString::from(envelope.event_type.clone())),
    );
    headers.insert(
        ShortString::from(routing::HEADER_SOURCE),
        AMQPValue::LongString(LongString::from(source.to_string())),
    );

    BasicProperties::default()
        .with_content_type(ShortString::from(routing::CONTENT_TYPE_JSON))
        .with_delivery_mode(routing::PERSISTENT)
        .with_message_id(ShortString::from(envelope.message_id.clone()))
        .with_correlation_id(ShortString::from(envelope.correlation_id.clone()))
        .with_kind(ShortString::from(envelope.event_type.clone()))
        .with_timestamp(envelope.timestamp)
        .with_headers(headers)
}

// ---------------------------------------------------------------------------
// AmqpConnection
// ---------------------------------------------------------------------------

/// 长生命周期的 broker 连接
///
/// 整个进程只持有一条连接；发布与消费各自使用独立 channel。
/// lapin 的 channel 本身是线程安全的，并发任务的 publish/ack 帧由 lapin 内部串行写出。
pub struct AmqpConnection {
    connection: Connection,
    config: RabbitConfig,
}

impl AmqpConnection {
    /// 建立连接
    ///
    /// 超过 `connect_timeout_seconds` 仍未握手成功视为连接失败，交由上层的重试策略处理。
    pub async fn connect(config: &RabbitConfig) -> Result<Self, ProvisionError> {
        let url = config.amqp_url();
        let connection = tokio::time::timeout(
            config.connect_timeout(),
            Connection::connect(&url, ConnectionProperties::default()),
        )
        .await
        .map_err(|_| {
            ProvisionError::Amqp(format!(
                "连接 broker 超时: {}:{} ({}s)",
                config.host, config.port, config.connect_timeout_seconds
            ))
        })??;

        info!(
            host = %config.host,
            port = config.port,
            vhost = %config.vhost,
            "RabbitMQ 连接已建立"
        );

        Ok(Self {
            connection,
            config: config.clone(),
        })
    }

    /// 声明拓扑：topic 交换机、入站队列及其 `order.created` 绑定、出站结果队列
    ///
    /// 入站侧任一步失败都返回错误（进程不能在半初始化状态下消费）；
    /// 出站队列的声明与绑定失败只记录告警，可能是其他实例或运维以不同参数抢先声明。
    pub async fn declare_topology(&self) -> Result<(), ProvisionError> {
        let channel = self.connection.create_channel().await?;

        channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        channel
            .queue_bind(
                &self.config.queue,
                &self.config.exchange,
                routing::ORDER_CREATED,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            exchange = %self.config.exchange,
            queue = %self.config.queue,
            routing_key = routing::ORDER_CREATED,
            "入站队列已绑定"
        );

        if let Err(e) = channel.close(200, "topology declared").await {
            debug!(error = %e, "关闭拓扑声明 channel 失败");
        }

        if let Err(e) = self.declare_result_queue().await {
            warn!(
                queue = %self.config.result_queue,
                error = %e,
                "出站结果队列声明或绑定失败，继续启动"
            );
        }

        Ok(())
    }

    /// 在独立 channel 上声明出站结果队列
    ///
    /// 声明参数冲突时 broker 会关闭所在 channel，独立 channel 可以避免影响入站侧。
    async fn declare_result_queue(&self) -> Result<(), ProvisionError> {
        let channel = self.connection.create_channel().await?;

        channel
            .queue_declare(
                &self.config.result_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        for result_type in ResultType::ALL {
            channel
                .queue_bind(
                    &self.config.result_queue,
                    &self.config.exchange,
                    result_type.as_str(),
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
        }

        info!(
            queue = %self.config.result_queue,
            "出站结果队列已绑定"
        );

        channel.close(200, "result queue declared").await?;
        Ok(())
    }

    /// 创建处于 confirm 模式的发布者
    pub async fn publisher(&self) -> Result<AmqpPublisher, ProvisionError> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        Ok(AmqpPublisher {
            channel,
            exchange: self.config.exchange.clone(),
            source: self.config.source.clone(),
            confirm_timeout: self.config.publish_timeout(),
        })
    }

    /// 创建入站队列的消费者
    ///
    /// `basic_qos` 的 prefetch 与本地并发上限取同一个值，
    /// broker 不会推送超出本地处理能力的未确认消息。
    pub async fn consumer(&self, consumer_tag: &str) -> Result<AmqpConsumer, ProvisionError> {
        let channel = self.connection.create_channel().await?;
        channel
            .basic_qos(self.config.prefetch.max(1), BasicQosOptions::default())
            .await?;

        let consumer = channel
            .basic_consume(
                &self.config.queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %self.config.queue,
            consumer_tag,
            prefetch = self.config.prefetch,
            "AMQP 消费者已初始化"
        );

        Ok(AmqpConsumer {
            channel,
            consumer,
            consumer_tag: consumer_tag.to_string(),
            concurrency: self.config.concurrency(),
            drain_timeout: self.config.drain_timeout(),
        })
    }

    /// 关闭连接，其上所有 channel 随之关闭
    pub async fn close(&self) {
        if let Err(e) = self.connection.close(200, "worker shutdown").await {
            warn!(error = %e, "关闭 RabbitMQ 连接失败");
        } else {
            info!("RabbitMQ 连接已关闭");
        }
    }
}

// ---------------------------------------------------------------------------
// AmqpPublisher
// ---------------------------------------------------------------------------

/// 面向业务的 AMQP 发布者
///
/// 使用 confirm 模式：只有收到 broker 的 ack 才算发布成功。
#[derive(Clone)]
pub struct AmqpPublisher {
    channel: Channel,
    exchange: String,
    source: String,
    /// 等待 broker 确认的上限，连接被流控阻塞时不会无限占用并发许可
    confirm_timeout: Duration,
}

impl AmqpPublisher {
    /// 将值序列化为 JSON 后发布到交换机
    ///
    /// 序列化与网络发送拆分为两步，便于独立定位故障原因。
    pub async fn publish_json<T: Serialize>(
        &self,
        routing_key: &str,
        envelope: &PublishEnvelope,
        value: &T,
    ) -> Result<(), ProvisionError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| ProvisionError::Serialization(e.to_string()))?;

        let properties = build_properties(envelope, &self.source);

        let confirmation = await_confirm(self.confirm_timeout, routing_key, async {
            let confirm = self
                .channel
                .basic_publish(
                    &self.exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await?;
            Ok::<_, ProvisionError>(confirm.await?)
        })
        .await?;

        if confirmation.is_nack() {
            return Err(ProvisionError::PublishNacked {
                routing_key: routing_key.to_string(),
            });
        }

        debug!(
            exchange = %self.exchange,
            routing_key,
            message_id = %envelope.message_id,
            correlation_id = %envelope.correlation_id,
            "消息已发布"
        );
        Ok(())
    }
}

/// 在期限内等待发布确认，超时视为 broker 故障
async fn await_confirm<T, Fut>(
    deadline: Duration,
    routing_key: &str,
    confirm: Fut,
) -> Result<T, ProvisionError>
where
    Fut: Future<Output = Result<T, ProvisionError>>,
{
    tokio::time::timeout(deadline, confirm)
        .await
        .map_err(|_| {
            ProvisionError::Amqp(format!(
                "等待发布确认超时: routing_key={routing_key} ({}s)",
                deadline.as_secs()
            ))
        })?
}

// ---------------------------------------------------------------------------
// AmqpConsumer
// ---------------------------------------------------------------------------

/// 消费循环结束的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerExit {
    /// 收到关闭信号
    Shutdown,
    /// broker 侧投递流结束（订阅被取消或连接断开）
    StreamEnded,
    /// 接收投递出错
    Failed(String),
}

/// 面向业务的 AMQP 消费者
///
/// 每条投递在独立任务中处理，并发度受信号量约束；
/// 基于 `watch` channel 的关闭信号先停止接收新投递，再等待在途投递完成。
pub struct AmqpConsumer {
    channel: Channel,
    consumer: lapin::Consumer,
    consumer_tag: String,
    concurrency: usize,
    drain_timeout: Duration,
}

impl AmqpConsumer {
    /// 启动消费循环
    ///
    /// - 先取得并发许可再拉取下一条投递，派生任务执行 handler，随后按 handler 返回的
    ///   `Disposition` 执行 ack 或 nack(requeue=false)。handler panic 视为 `Reject`。
    /// - 关闭信号变为 `true` 时取消 broker 侧订阅，在 `drain_timeout` 内等待在途任务；
    ///   超时未完成的任务被中止，它们从未 ack，broker 会在重连后重新投递。
    pub async fn start<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F) -> ConsumerExit
    where
        F: Fn(IncomingDelivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Disposition> + Send + 'static,
    {
        let Self {
            channel,
            mut consumer,
            consumer_tag,
            concurrency,
            drain_timeout,
        } = self;

        let handler = Arc::new(handler);
        let permits = Arc::new(Semaphore::new(concurrency));
        let mut in_flight = JoinSet::new();
        let mut permit: Option<OwnedSemaphorePermit> = None;

        info!(consumer_tag = %consumer_tag, concurrency, "AMQP 消费循环已启动");

        let exit = loop {
            tokio::select! {
                // 偏向关闭信号，保证收到关闭时能尽快停止接收
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("收到关闭信号，AMQP 消费循环停止接收新投递");
                        break ConsumerExit::Shutdown;
                    }
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    log_join_result(joined);
                }

                acquired = permits.clone().acquire_owned(), if permit.is_none() => {
                    match acquired {
                        Ok(acquired) => permit = Some(acquired),
                        Err(e) => break ConsumerExit::Failed(e.to_string()),
                    }
                }

                next = consumer.next(), if permit.is_some() => {
                    let Some(next) = next else {
                        warn!("AMQP 投递流意外结束");
                        break ConsumerExit::StreamEnded;
                    };

                    let delivery = match next {
                        Ok(delivery) => delivery,
                        Err(e) => {
                            error!(error = %e, "接收 AMQP 投递出错，消费循环退出");
                            break ConsumerExit::Failed(e.to_string());
                        }
                    };

                    let permit = permit.take();
                    let handler = handler.clone();
                    let span = tracing::info_span!(
                        "amqp.delivery",
                        delivery_tag = delivery.delivery_tag,
                        redelivered = delivery.redelivered
                    );

                    in_flight.spawn(
                        async move {
                            let _permit = permit;
                            let incoming = IncomingDelivery::from_delivery(&delivery);
                            let disposition = run_guarded(handler.as_ref(), incoming).await;
                            settle(&delivery, disposition).await;
                        }
                        .instrument(span),
                    );
                }
            }
        };

        if let Err(e) = channel
            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
            .await
        {
            warn!(consumer_tag = %consumer_tag, error = %e, "取消 broker 订阅失败");
        }

        info!(in_flight = in_flight.len(), "等待在途投递完成");

        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(joined) = in_flight.join_next().await {
                log_join_result(joined);
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                remaining = in_flight.len(),
                drain_timeout_secs = drain_timeout.as_secs(),
                "在途投递未能在期限内完成，中止后由 broker 重新投递"
            );
            in_flight.abort_all();
        }

        info!(exit = ?exit, "AMQP 消费循环已退出");
        exit
    }
}

/// 执行 handler，panic 时拒绝投递
async fn run_guarded<F, Fut>(handler: &F, incoming: IncomingDelivery) -> Disposition
where
    F: Fn(IncomingDelivery) -> Fut,
    Fut: Future<Output = Disposition>,
{
    let delivery_tag = incoming.delivery_tag;
    match AssertUnwindSafe(async move { handler(incoming).await })
        .catch_unwind()
        .await
    {
        Ok(disposition) => disposition,
        Err(payload) => {
            error!(
                delivery_tag,
                panic = %panic_message(payload.as_ref()),
                "投递处理 panic，拒绝投递"
            );
            Disposition::Reject
        }
    }
}

/// 将处置结果落到 broker
async fn settle(delivery: &Delivery, disposition: Disposition) {
    let result = match disposition {
        Disposition::Ack => delivery.ack(BasicAckOptions::default()).await,
        Disposition::Reject => {
            delivery
                .nack(BasicNackOptions {
                    multiple: false,
                    requeue: false,
                })
                .await
        }
    };

    metrics::counter!(
        "provision_deliveries_total",
        "disposition" => disposition.as_str()
    )
    .increment(1);

    if let Err(e) = result {
        error!(
            delivery_tag = delivery.delivery_tag,
            disposition = disposition.as_str(),
            error = %e,
            "投递确认失败"
        );
    }
}

fn log_join_result(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined
        && e.is_panic()
    {
        error!(error = %e, "投递处理任务 panic");
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
