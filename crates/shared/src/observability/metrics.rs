//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::ObservabilityConfig;

/// Metrics 资源守卫
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl Drop for MetricsHandle {
    fn drop(&mut self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 与 `/health` 端点。
pub async fn init(config: &ObservabilityConfig) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    register_common_metrics(&config.service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册开通流程相关指标的描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(
        "provision_deliveries_total",
        "Total number of broker deliveries settled, by disposition"
    );
    metrics::describe_counter!(
        "provision_orders_total",
        "Total number of orders dispatched, by product type and outcome"
    );
    metrics::describe_histogram!(
        "provision_order_duration_seconds",
        "Order provisioning duration in seconds"
    );
    metrics::describe_counter!(
        "provision_step_failures_total",
        "Total number of failed provisioning steps"
    );
    metrics::describe_counter!(
        "provision_results_published_total",
        "Total number of result events published, by type"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

// ============================================================================
// 指标记录函数
// ============================================================================

/// 记录一次订单分发结果
#[inline]
pub fn record_order(product_type: &str, outcome: &str, duration_secs: f64) {
    metrics::counter!(
        "provision_orders_total",
        "product_type" => product_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    metrics::histogram!(
        "provision_order_duration_seconds",
        "product_type" => product_type.to_string()
    )
    .record(duration_secs);
}

/// 记录开通步骤失败
#[inline]
pub fn record_step_failure(step: &str) {
    metrics::counter!("provision_step_failures_total", "step" => step.to_string()).increment(1);
}

/// 记录结果事件发布
#[inline]
pub fn record_result_published(result_type: &str) {
    metrics::counter!(
        "provision_results_published_total",
        "type" => result_type.to_string()
    )
    .increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_functions_do_not_panic() {
        // 即使没有初始化 recorder，这些函数也不应该 panic
        record_order("router", "fulfilled", 0.45);
        record_step_failure("activate_sim");
        record_result_published("failed");
    }
}
