//! 开通 handler
//!
//! 每种产品类型对应一个 handler，按固定顺序执行一组开通步骤。
//! 步骤通过 `ProvisioningBackend` 调用外部系统（库存、物流、运营商等），
//! 任一步骤失败即停止后续步骤并返回 `false`，错误不会逃逸出 handler。

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use provision_shared::error::panic_message;
use provision_shared::events::OrderView;
use provision_shared::observability::metrics;
use tracing::{debug, error, info};

use crate::error::WorkerError;
use crate::product::ProductType;

// ---------------------------------------------------------------------------
// ProvisioningStep
// ---------------------------------------------------------------------------

/// 开通步骤
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisioningStep {
    // 路由器
    CheckInventory,
    ReserveRouter,
    ScheduleShipping,
    // 宽带线路
    CheckLineAvailability,
    ScheduleTechnician,
    ProvisionLine,
    // 手机
    CheckModelAvailability,
    ActivateSim,
    ConfigureDevice,
    ScheduleDelivery,
}

impl ProvisioningStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckInventory => "check_inventory",
            Self::ReserveRouter => "reserve_router",
            Self::ScheduleShipping => "schedule_shipping",
            Self::CheckLineAvailability => "check_line_availability",
            Self::ScheduleTechnician => "schedule_technician",
            Self::ProvisionLine => "provision_line",
            Self::CheckModelAvailability => "check_model_availability",
            Self::ActivateSim => "activate_sim",
            Self::ConfigureDevice => "configure_device",
            Self::ScheduleDelivery => "schedule_delivery",
        }
    }

    /// 模拟外部系统调用时的名义耗时
    pub fn nominal_latency(&self) -> Duration {
        let millis = match self {
            Self::CheckInventory => 100,
            Self::ReserveRouter => 200,
            Self::ScheduleShipping => 150,
            Self::CheckLineAvailability => 300,
            Self::ScheduleTechnician => 500,
            Self::ProvisionLine => 200,
            Self::CheckModelAvailability => 150,
            Self::ActivateSim => 250,
            Self::ConfigureDevice => 300,
            Self::ScheduleDelivery => 100,
        };
        Duration::from_millis(millis)
    }
}

impl fmt::Display for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ProvisioningBackend
// ---------------------------------------------------------------------------

/// 开通步骤的执行后端
///
/// 生产中对接库存、物流、运营商等外部系统；测试中用 mock 注入失败。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn execute(&self, step: ProvisioningStep, order: &OrderView) -> Result<(), WorkerError>;
}

/// 模拟后端
///
/// 每个步骤按名义耗时乘以缩放系数休眠后返回成功，系数为 0 时不休眠。
#[derive(Debug, Clone)]
pub struct SimulatedBackend {
    latency_scale: f64,
}

impl SimulatedBackend {
    /// 负数与 NaN 视为 0
    pub fn new(latency_scale: f64) -> Self {
        let latency_scale = if latency_scale.is_finite() && latency_scale > 0.0 {
            latency_scale
        } else {
            0.0
        };
        Self { latency_scale }
    }

    /// 不休眠的后端，用于测试
    pub fn instant() -> Self {
        Self::new(0.0)
    }

    pub fn latency_for(&self, step: ProvisioningStep) -> Duration {
        step.nominal_latency().mul_f64(self.latency_scale)
    }
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new(1.0)
    }
}

#[async_trait]
impl ProvisioningBackend for SimulatedBackend {
    async fn execute(&self, step: ProvisioningStep, order: &OrderView) -> Result<(), WorkerError> {
        let latency = self.latency_for(step);
        debug!(
            order_id = %order.id,
            step = %step,
            latency_ms = latency.as_millis() as u64,
            "模拟执行开通步骤"
        );
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ProvisioningHandler
// ---------------------------------------------------------------------------

/// 产品开通 handler
///
/// 实现不得持有跨订单的可变状态，同一实例会被多个投递并发调用。
#[async_trait]
pub trait ProvisioningHandler: Send + Sync {
    fn product_type(&self) -> ProductType;

    /// 按执行顺序排列的开通步骤
    fn steps(&self) -> &'static [ProvisioningStep];

    /// 执行开通，全部步骤成功返回 `true`
    async fn process_order(&self, order: &OrderView) -> bool;
}

/// 执行单个步骤，后端 panic 转为步骤失败
async fn execute_step(
    backend: &dyn ProvisioningBackend,
    step: ProvisioningStep,
    order: &OrderView,
) -> Result<(), WorkerError> {
    AssertUnwindSafe(async move { backend.execute(step, order).await })
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(WorkerError::StepFailed {
                step,
                reason: format!("panic: {}", panic_message(payload.as_ref())),
            })
        })
}

/// 顺序执行步骤，首个失败即停止
async fn run_steps(
    backend: &dyn ProvisioningBackend,
    product_type: ProductType,
    steps: &[ProvisioningStep],
    order: &OrderView,
) -> bool {
    let started = Instant::now();
    let total_steps = steps.len();

    info!(
        order_id = %order.id,
        product_type = %product_type,
        total_steps,
        "开始开通订单"
    );

    for (index, step) in steps.iter().enumerate() {
        if let Err(e) = execute_step(backend, *step, order).await {
            metrics::record_step_failure(step.as_str());
            error!(
                order_id = %order.id,
                product_type = %product_type,
                step = %step,
                step_index = index + 1,
                total_steps,
                error = %e,
                "开通步骤失败，终止后续步骤"
            );
            return false;
        }

        info!(
            order_id = %order.id,
            product_type = %product_type,
            step = %step,
            step_index = index + 1,
            total_steps,
            "开通步骤完成"
        );
    }

    info!(
        order_id = %order.id,
        product_type = %product_type,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "订单开通完成"
    );
    true
}

/// 路由器开通：检查库存 → 预留设备 → 安排发货
pub struct RouterHandler {
    backend: Arc<dyn ProvisioningBackend>,
}

impl RouterHandler {
    const STEPS: [ProvisioningStep; 3] = [
        ProvisioningStep::CheckInventory,
        ProvisioningStep::ReserveRouter,
        ProvisioningStep::ScheduleShipping,
    ];

    pub fn new(backend: Arc<dyn ProvisioningBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ProvisioningHandler for RouterHandler {
    fn product_type(&self) -> ProductType {
        ProductType::Router
    }

    fn steps(&self) -> &'static [ProvisioningStep] {
        &Self::STEPS
    }

    async fn process_order(&self, order: &OrderView) -> bool {
        run_steps(self.backend.as_ref(), self.product_type(), self.steps(), order).await
    }
}

/// 宽带线路开通：检查线路 → 预约技术员 → 开通线路
pub struct BroadbandLineHandler {
    backend: Arc<dyn ProvisioningBackend>,
}

impl BroadbandLineHandler {
    const STEPS: [ProvisioningStep; 3] = [
        ProvisioningStep::CheckLineAvailability,
        ProvisioningStep::ScheduleTechnician,
        ProvisioningStep::ProvisionLine,
    ];

    pub fn new(backend: Arc<dyn ProvisioningBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ProvisioningHandler for BroadbandLineHandler {
    fn product_type(&self) -> ProductType {
        ProductType::BroadbandLine
    }

    fn steps(&self) -> &'static [ProvisioningStep] {
        &Self::STEPS
    }

    async fn process_order(&self, order: &OrderView) -> bool {
        run_steps(self.backend.as_ref(), self.product_type(), self.steps(), order).await
    }
}

/// 手机开通：检查机型 → 激活 SIM → 配置设备 → 安排配送
pub struct HandsetHandler {
    backend: Arc<dyn ProvisioningBackend>,
}

impl HandsetHandler {
    const STEPS: [ProvisioningStep; 4] = [
        ProvisioningStep::CheckModelAvailability,
        ProvisioningStep::ActivateSim,
        ProvisioningStep::ConfigureDevice,
        ProvisioningStep::ScheduleDelivery,
    ];

    pub fn new(backend: Arc<dyn ProvisioningBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl ProvisioningHandler for HandsetHandler {
    fn product_type(&self) -> ProductType {
        ProductType::Handset
    }

    fn steps(&self) -> &'static [ProvisioningStep] {
        &Self::STEPS
    }

    async fn process_order(&self, order: &OrderView) -> bool {
        run_steps(self.backend.as_ref(), self.product_type(), self.steps(), order).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::Sequence;

    fn order(product_type: &str) -> OrderView {
        OrderView {
            id: "order-1".to_string(),
            product_type: product_type.to_string(),
        }
    }

    #[test]
    fn test_step_names_are_unique() {
        let all = RouterHandler::STEPS
            .iter()
            .chain(BroadbandLineHandler::STEPS.iter())
            .chain(HandsetHandler::STEPS.iter())
            .map(|s| s.as_str())
            .collect::<std::collections::HashSet<_>>();
        assert_eq!(all.len(), 10);
    }

    #[test]
    fn test_simulated_backend_scales_latency() {
        let backend = SimulatedBackend::new(0.5);
        assert_eq!(
            backend.latency_for(ProvisioningStep::ScheduleTechnician),
            Duration::from_millis(250)
        );

        assert!(
            SimulatedBackend::instant()
                .latency_for(ProvisioningStep::ConfigureDevice)
                .is_zero()
        );
        assert!(
            SimulatedBackend::new(-1.0)
                .latency_for(ProvisioningStep::ActivateSim)
                .is_zero()
        );
        assert!(
            SimulatedBackend::new(f64::NAN)
                .latency_for(ProvisioningStep::ActivateSim)
                .is_zero()
        );
    }

    #[tokio::test]
    async fn test_router_runs_steps_in_order() {
        let mut backend = MockProvisioningBackend::new();
        let mut seq = Sequence::new();
        for expected in RouterHandler::STEPS {
            backend
                .expect_execute()
                .withf(move |step, _| *step == expected)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_, _| Ok(()));
        }

        let handler = RouterHandler::new(Arc::new(backend));
        assert!(handler.process_order(&order("router")).await);
    }

    #[tokio::test]
    async fn test_handset_stops_at_first_failure() {
        let mut backend = MockProvisioningBackend::new();
        backend
            .expect_execute()
            .withf(|step, _| *step == ProvisioningStep::CheckModelAvailability)
            .times(1)
            .returning(|_, _| Ok(()));
        backend
            .expect_execute()
            .withf(|step, _| *step == ProvisioningStep::ActivateSim)
            .times(1)
            .returning(|step, _| {
                Err(WorkerError::StepFailed {
                    step,
                    reason: "运营商接口超时".to_string(),
                })
            });
        // 失败之后的步骤不会被调用
        backend
            .expect_execute()
            .withf(|step, _| {
                matches!(
                    step,
                    ProvisioningStep::ConfigureDevice | ProvisioningStep::ScheduleDelivery
                )
            })
            .times(0);

        let handler = HandsetHandler::new(Arc::new(backend));
        assert!(!handler.process_order(&order("handset")).await);
    }

    /// 在指定步骤 panic 的后端，记录调用过的步骤
    struct PanicAt {
        step: ProvisioningStep,
        calls: std::sync::Mutex<Vec<ProvisioningStep>>,
    }

    impl PanicAt {
        fn new(step: ProvisioningStep) -> Self {
            Self {
                step,
                calls: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ProvisioningBackend for PanicAt {
        async fn execute(&self, step: ProvisioningStep, _order: &OrderView) -> Result<(), WorkerError> {
            self.calls.lock().unwrap().push(step);
            if step == self.step {
                panic!("carrier SDK assertion failed");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_backend_panic_is_contained_as_step_failure() {
        let backend = Arc::new(PanicAt::new(ProvisioningStep::ActivateSim));
        let handler = HandsetHandler::new(backend.clone());

        // 在独立任务中运行，panic 若逃逸会表现为 JoinError
        let joined = tokio::spawn(async move { handler.process_order(&order("handset")).await }).await;
        assert!(!tokio_test::assert_ok!(joined));

        // panic 之后不再执行后续步骤
        assert_eq!(
            *backend.calls.lock().unwrap(),
            vec![
                ProvisioningStep::CheckModelAvailability,
                ProvisioningStep::ActivateSim
            ]
        );
    }

    #[tokio::test]
    async fn test_execute_step_reports_panic_reason() {
        let backend = PanicAt::new(ProvisioningStep::CheckInventory);

        let result = execute_step(&backend, ProvisioningStep::CheckInventory, &order("router")).await;
        match result {
            Err(WorkerError::StepFailed { step, reason }) => {
                assert_eq!(step, ProvisioningStep::CheckInventory);
                assert!(reason.contains("carrier SDK assertion failed"));
            }
            other => panic!("应为步骤失败, 实际为 {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_broadband_failure_on_first_step() {
        let mut backend = MockProvisioningBackend::new();
        backend
            .expect_execute()
            .times(1)
            .returning(|step, _| {
                Err(WorkerError::StepFailed {
                    step,
                    reason: "线路不可用".to_string(),
                })
            });

        let handler = BroadbandLineHandler::new(Arc::new(backend));
        assert!(!handler.process_order(&order("broadband_line")).await);
    }

    #[tokio::test]
    async fn test_handlers_with_instant_backend_succeed() {
        let backend: Arc<dyn ProvisioningBackend> = Arc::new(SimulatedBackend::instant());
        let handlers: Vec<Box<dyn ProvisioningHandler>> = vec![
            Box::new(RouterHandler::new(backend.clone())),
            Box::new(BroadbandLineHandler::new(backend.clone())),
            Box::new(HandsetHandler::new(backend)),
        ];

        for handler in handlers {
            let view = order(handler.product_type().as_str());
            assert!(handler.process_order(&view).await);
            // 同一实例可重复调用，互不影响
            assert!(handler.process_order(&view).await);
        }
    }
}
