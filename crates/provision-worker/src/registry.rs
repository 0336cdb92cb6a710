//! Handler 注册表
//!
//! 启动时一次性构建产品类型到 handler 的映射，构建后只读，可在并发投递间共享。

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::WorkerError;
use crate::handlers::{
    BroadbandLineHandler, HandsetHandler, ProvisioningBackend, ProvisioningHandler,
    RouterHandler,
};
use crate::product::ProductType;

pub struct HandlerRegistry {
    handlers: HashMap<ProductType, Arc<dyn ProvisioningHandler>>,
}

impl HandlerRegistry {
    pub fn builder() -> HandlerRegistryBuilder {
        HandlerRegistryBuilder::default()
    }

    /// 注册全部内置 handler，共用同一个后端
    pub fn with_defaults(backend: Arc<dyn ProvisioningBackend>) -> Self {
        Self::builder()
            .register(RouterHandler::new(backend.clone()))
            .register(BroadbandLineHandler::new(backend.clone()))
            .register(HandsetHandler::new(backend))
            .build()
    }

    /// 查找产品类型对应的 handler
    ///
    /// `Unknown` 或未注册的类型返回 `UnsupportedProductType`。
    pub fn resolve(
        &self,
        product_type: ProductType,
    ) -> Result<Arc<dyn ProvisioningHandler>, WorkerError> {
        if !product_type.is_known() {
            return Err(WorkerError::UnsupportedProductType { product_type });
        }

        self.handlers
            .get(&product_type)
            .cloned()
            .ok_or(WorkerError::UnsupportedProductType { product_type })
    }

    /// 已注册的产品类型，按固定顺序返回
    pub fn supported_types(&self) -> Vec<ProductType> {
        ProductType::KNOWN
            .into_iter()
            .filter(|t| self.handlers.contains_key(t))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[derive(Default)]
pub struct HandlerRegistryBuilder {
    handlers: HashMap<ProductType, Arc<dyn ProvisioningHandler>>,
}

impl HandlerRegistryBuilder {
    /// 以 handler 自身声明的产品类型为键注册；同一类型重复注册时后者覆盖前者
    pub fn register<H>(self, handler: H) -> Self
    where
        H: ProvisioningHandler + 'static,
    {
        self.register_shared(Arc::new(handler))
    }

    pub fn register_shared(mut self, handler: Arc<dyn ProvisioningHandler>) -> Self {
        let product_type = handler.product_type();
        if !product_type.is_known() {
            warn!("忽略声明为 unknown 产品类型的 handler");
            return self;
        }
        if self.handlers.insert(product_type, handler).is_some() {
            warn!(product_type = %product_type, "重复注册 handler，已覆盖先前的实例");
        }
        self
    }

    pub fn build(self) -> HandlerRegistry {
        let registry = HandlerRegistry {
            handlers: self.handlers,
        };
        info!(
            supported_types = ?registry.supported_types(),
            "Handler 注册表已构建"
        );
        registry
    }
}
