//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ProvisionError;
use crate::observability::ObservabilityConfig;

/// RabbitMQ 配置
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RabbitConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// topic 类型交换机，入站订单事件与出站结果事件共用
    pub exchange: String,
    /// 入站队列，绑定 `order.created`
    pub queue: String,
    /// 出站结果队列，绑定 `fulfilled` / `failed`
    pub result_queue: String,
    /// 同时在途的投递上限，同时作用于 basic_qos 与本地并发信号量
    pub prefetch: u16,
    /// 出站消息 `source` header 的固定取值
    pub source: String,
    pub connect_timeout_seconds: u64,
    /// 等待发布确认的最长时间
    pub publish_timeout_seconds: u64,
    /// 优雅关闭时等待在途投递完成的最长时间
    pub drain_timeout_seconds: u64,
}

impl Default for RabbitConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            user: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            exchange: "provisioning".to_string(),
            queue: "order.provisioning".to_string(),
            result_queue: "order.provisioning.results".to_string(),
            prefetch: default_prefetch(),
            source: "order-provisioning".to_string(),
            connect_timeout_seconds: 10,
            publish_timeout_seconds: 10,
            drain_timeout_seconds: 30,
        }
    }
}

/// 默认并发度取可用的工作线程数，避免 handler 无上限扇出
fn default_prefetch() -> u16 {
    std::thread::available_parallelism()
        .map(|n| u16::try_from(n.get()).unwrap_or(u16::MAX))
        .unwrap_or(4)
}

impl RabbitConfig {
    /// 构造 AMQP 连接串
    ///
    /// 用户名、密码与 vhost 均做百分号编码：密码中的 `@`、`:`、`/` 会破坏 URI 结构，
    /// 默认 vhost "/" 编码为 `%2F`，否则会被解析成空路径。
    pub fn amqp_url(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.user),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost)
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_seconds)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    /// 实际生效的并发度，至少为 1
    pub fn concurrency(&self) -> usize {
        usize::from(self.prefetch.max(1))
    }
}

// 手写 Debug，避免密码出现在日志中
impl std::fmt::Debug for RabbitConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RabbitConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"***")
            .field("vhost", &self.vhost)
            .field("exchange", &self.exchange)
            .field("queue", &self.queue)
            .field("result_queue", &self.result_queue)
            .field("prefetch", &self.prefetch)
            .field("source", &self.source)
            .field("connect_timeout_seconds", &self.connect_timeout_seconds)
            .field("publish_timeout_seconds", &self.publish_timeout_seconds)
            .field("drain_timeout_seconds", &self.drain_timeout_seconds)
            .finish()
    }
}

/// 开通流程配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProvisioningConfig {
    /// 模拟开通步骤耗时的缩放系数，0 表示不等待
    pub step_latency_scale: f64,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            step_latency_scale: 1.0,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub rabbit: RabbitConfig,
    pub provisioning: ProvisioningConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. .env 文件（存在时注入进程环境变量）
    /// 2. config/default.toml（默认配置）
    /// 3. config/{environment}.toml（环境特定配置）
    /// 4. config/{service_name}.toml（服务特定配置）
    /// 5. 环境变量（PROVISION_ 前缀，层级用双下划线分隔，如 PROVISION_RABBIT__HOST -> rabbit.host）
    pub fn load(service_name: &str) -> Result<Self, ProvisionError> {
        let _ = dotenvy::dotenv();

        let env = std::env::var("PROVISION_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            // 字段名本身含下划线（result_queue），因此层级分隔符用双下划线
            .add_source(
                Environment::with_prefix("PROVISION")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        Ok(builder.build()?.try_deserialize()?)
    }
}
