//! 订单开通工作者
//!
//! 消费 RabbitMQ 上的订单创建事件，执行产品开通并发布开通结果。

use std::sync::Arc;

use anyhow::{Context, Result};
use provision_shared::amqp::AmqpConnection;
use provision_shared::config::AppConfig;
use provision_shared::observability;
use provision_shared::retry::{RetryPolicy, retry_with_policy};
use provision_worker::consumer::{ProvisionConsumer, supervise};
use provision_worker::handlers::SimulatedBackend;
use provision_worker::registry::HandlerRegistry;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

const SERVICE_NAME: &str = "provision-worker";

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load(SERVICE_NAME).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig {
            service_name: SERVICE_NAME.to_string(),
            ..AppConfig::default()
        }
    });

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    info!(
        environment = %config.environment,
        rabbit = ?config.rabbit,
        "Starting provision-worker..."
    );

    // 启动阶段 broker 可能尚未就绪，按退避策略重试，耗尽后退出
    let connection = retry_with_policy(&RetryPolicy::default(), "amqp.connect", || {
        AmqpConnection::connect(&config.rabbit)
    })
    .await
    .inspect_err(|e| error!(error = %e, "无法连接 RabbitMQ，服务退出"))
    .context("RabbitMQ 连接失败")?;

    connection
        .declare_topology()
        .await
        .context("声明 RabbitMQ 拓扑失败")?;

    let backend = Arc::new(SimulatedBackend::new(
        config.provisioning.step_latency_scale,
    ));
    let registry = Arc::new(HandlerRegistry::with_defaults(backend));

    let publisher = Arc::new(connection.publisher().await.context("创建发布 channel 失败")?);
    let consumer = connection
        .consumer(SERVICE_NAME)
        .await
        .context("创建消费 channel 失败")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = ProvisionConsumer::new(consumer, registry, publisher);
    let worker_handle = tokio::spawn(worker.run(shutdown_rx));

    let outcome = supervise(worker_handle, shutdown_tx, shutdown_signal()).await;

    connection.close().await;

    outcome.context("消费者异常停止")?;
    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
