//! 订单事件消费者
//!
//! 把 broker 消费循环与投递处理管道接在一起。

use std::future::Future;
use std::sync::Arc;

use provision_shared::amqp::{AmqpConsumer, ConsumerExit};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::pipeline;
use crate::publisher::ResultPublisher;
use crate::registry::HandlerRegistry;

/// 订单开通消费者
///
/// 注册表与发布者在所有在途投递间共享，二者都不持有按投递变化的状态。
pub struct ProvisionConsumer {
    consumer: AmqpConsumer,
    registry: Arc<HandlerRegistry>,
    publisher: Arc<dyn ResultPublisher>,
}

impl ProvisionConsumer {
    pub fn new(
        consumer: AmqpConsumer,
        registry: Arc<HandlerRegistry>,
        publisher: Arc<dyn ResultPublisher>,
    ) -> Self {
        Self {
            consumer,
            registry,
            publisher,
        }
    }

    /// 启动消费循环，直到收到 shutdown 信号且在途投递排空
    ///
    /// 只有因 shutdown 退出才返回 `Ok`，消费流结束或出错都视为异常停止。
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), WorkerError> {
        if self.registry.is_empty() {
            warn!("未注册任何开通 handler，所有订单都将以失败结果回复");
        }
        info!(
            handlers = self.registry.len(),
            supported_types = ?self.registry.supported_types(),
            "订单开通消费者已启动"
        );

        let registry = self.registry;
        let publisher = self.publisher;

        let exit = self
            .consumer
            .start(shutdown, move |delivery| {
                let registry = registry.clone();
                let publisher = publisher.clone();
                async move {
                    pipeline::handle_delivery(&registry, publisher.as_ref(), &delivery).await
                }
            })
            .await;

        info!(exit = ?exit, "订单开通消费者已停止");
        exit_result(exit)
    }
}

fn exit_result(exit: ConsumerExit) -> Result<(), WorkerError> {
    match exit {
        ConsumerExit::Shutdown => Ok(()),
        ConsumerExit::StreamEnded => Err(WorkerError::ConsumerStopped(
            "broker 关闭了消费流".to_string(),
        )),
        ConsumerExit::Failed(reason) => Err(WorkerError::ConsumerStopped(reason)),
    }
}

/// 等待关闭信号或消费任务结束，取先发生者
///
/// 收到信号时通知消费任务排空并等待其退出；消费任务先结束则返回错误，
/// 调用方据此以非零状态退出进程。
pub async fn supervise<S>(
    mut worker: JoinHandle<Result<(), WorkerError>>,
    shutdown_tx: watch::Sender<bool>,
    signal: S,
) -> Result<(), WorkerError>
where
    S: Future<Output = ()>,
{
    tokio::select! {
        _ = signal => {
            let _ = shutdown_tx.send(true);
            match worker.await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "消费任务异常退出");
                    Err(WorkerError::ConsumerStopped(e.to_string()))
                }
            }
        }
        joined = &mut worker => {
            let err = match joined {
                Ok(Ok(())) => WorkerError::ConsumerStopped(
                    "消费循环在收到关闭信号前退出".to_string(),
                ),
                Ok(Err(e)) => e,
                Err(e) => WorkerError::ConsumerStopped(e.to_string()),
            };
            error!(error = %err, "消费任务提前结束，服务退出");
            Err(err)
        }
    }
}
