//! 服务注册发现模块
//!
//! 一个统一契约，五种结构各异的协调后端：
//! Memory（进程内）、etcd（租约）、Consul（Agent 健康检查）、
//! Nacos（命名空间实例）、Zookeeper（会话级临时节点）。
//!
//! ## 各后端存活/一致性映射
//!
//! | 后端 | 存活机制 | Watch 投递 | 元数据保真度 |
//! |---|---|---|---|
//! | Memory | 周期清扫任务比较 `now - last_check` 与 TTL | 同步、进程内、全序 | 完整 |
//! | etcd | key 绑定可续期租约，续期任务运行至租约丢失 | 真实推送（key 前缀原生 watch） | 完整 |
//! | Consul | 原生 HTTP 健康检查 + 超临界注销超时 | 轮询模拟（周期性重新拉取，默认 5s），非推送 | 扩展字段存于旁路 KV |
//! | Nacos | 显式注册/注销 + ephemeral 标志（心跳任务维持） | 轮询模拟 | 扩展字段打包进 metadata（tags JSON 序列化） |
//! | Zookeeper | 客户端会话结束时节点自动删除 | 一次性 watch 真实推送，触发后需手动重挂 | 完整，枚举需递归遍历目录 |
//!
//! 依赖推送级 watch 延迟的调用方在轮询模拟后端上会得到约 5 秒的降级新鲜度，
//! 这是各后端原生能力差异的直接映射，本模块不做掩盖。

pub mod consul;
pub mod etcd;
pub(crate) mod hub;
pub mod load_balancer;
pub mod memory;
pub mod nacos;
pub mod zookeeper;

pub use consul::ConsulRegistry;
pub use etcd::EtcdRegistry;
pub use load_balancer::{LoadBalanceStrategy, LoadBalancer, RandomBalancer, RoundRobinBalancer};
pub use memory::MemoryRegistry;
pub use nacos::NacosRegistry;
pub use zookeeper::ZookeeperRegistry;

use crate::config::RegistryConfig;
use crate::error::{DiscoveryError, Result};
use crate::types::{ServiceEvent, ServiceRecord};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// watcher 通道容量，满时事件被丢弃（至多一次投递）
pub(crate) const WATCH_CHANNEL_CAPACITY: usize = 16;

/// 轮询模拟 watch 的默认间隔（秒）
pub(crate) const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// 服务注册发现契约
///
/// 所有后端实现同一组操作。事件通道在注册中心关闭或接收端被丢弃时关闭；
/// 关闭后的注册中心对后续操作快速返回 [`DiscoveryError::Closed`]。
#[async_trait]
pub trait Registry: Send + Sync {
    /// 注册服务实例
    ///
    /// 已存在同 ID 记录时失败。固定 created_at，TTL 未设置时应用默认值（30s），
    /// 并启动后端相关的存活任务。返回打好时间戳的记录。
    async fn register(&self, record: ServiceRecord) -> Result<ServiceRecord>;

    /// 注销服务实例，记录不存在时返回 NotFound
    async fn deregister(&self, id: &str) -> Result<()>;

    /// 更新服务实例
    ///
    /// 要求此前已注册（否则 NotFound），保留原 created_at，推进 updated_at。
    async fn update(&self, record: ServiceRecord) -> Result<ServiceRecord>;

    /// 获取服务实例（按实例 ID）
    async fn get_service(&self, id: &str) -> Result<ServiceRecord>;

    /// 获取所有服务实例
    async fn list_services(&self) -> Result<Vec<ServiceRecord>>;

    /// 监听服务变化
    ///
    /// 返回有界事件通道。发送端使用非阻塞 send，通道满时事件被丢弃。
    async fn watch(&self) -> Result<mpsc::Receiver<ServiceEvent>>;

    /// 关闭注册中心
    ///
    /// 幂等。恰好一次地关闭所有未完成的 watcher 通道并终止后台任务，
    /// 之后的调用返回 Closed。
    async fn close(&self) -> Result<()>;
}

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryType {
    Memory,
    Etcd,
    Consul,
    Nacos,
    Zookeeper,
}

impl std::str::FromStr for RegistryType {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(RegistryType::Memory),
            "etcd" => Ok(RegistryType::Etcd),
            "consul" => Ok(RegistryType::Consul),
            "nacos" => Ok(RegistryType::Nacos),
            "zookeeper" | "zk" => Ok(RegistryType::Zookeeper),
            other => Err(DiscoveryError::Configuration(format!(
                "unknown registry type: {}",
                other
            ))),
        }
    }
}

/// 从配置创建注册中心实例
///
/// 后端在构造时选定一次，之后不再按调用分发。
/// 未识别的类型返回 Configuration 错误。
pub async fn create_registry(config: &RegistryConfig) -> Result<Arc<dyn Registry>> {
    let registry_type: RegistryType = config.registry_type.parse()?;

    match registry_type {
        RegistryType::Memory => Ok(Arc::new(MemoryRegistry::new(config.ttl))),
        RegistryType::Etcd => {
            let registry = EtcdRegistry::new(
                if config.endpoints.is_empty() {
                    vec!["http://127.0.0.1:2379".to_string()]
                } else {
                    config.endpoints.clone()
                },
                config.namespace.clone(),
                config.ttl,
            )
            .await?;
            Ok(Arc::new(registry))
        }
        RegistryType::Consul => {
            let registry = ConsulRegistry::new(
                config.primary_endpoint("http://127.0.0.1:8500"),
                config.namespace.clone(),
                config.ttl,
            )?;
            Ok(Arc::new(registry))
        }
        RegistryType::Nacos => {
            let registry = NacosRegistry::new(
                config.primary_endpoint("http://127.0.0.1:8848"),
                config.namespace.clone(),
                config.ttl,
            )?;
            Ok(Arc::new(registry))
        }
        RegistryType::Zookeeper => {
            let registry = ZookeeperRegistry::new(
                config.primary_endpoint("127.0.0.1:2181"),
                config.namespace.clone(),
                config.ttl,
            )
            .await?;
            Ok(Arc::new(registry))
        }
    }
}

/// 注册中心构建器
///
/// 链式配置常见场景，与 [`create_registry`] 等价。
pub struct RegistryBuilder {
    config: RegistryConfig,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            config: RegistryConfig::default(),
        }
    }

    /// 设置后端类型（memory, etcd, consul, nacos, zookeeper）
    pub fn registry_type(mut self, registry_type: impl Into<String>) -> Self {
        self.config.registry_type = registry_type.into();
        self
    }

    /// 添加后端地址
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoints.push(endpoint.into());
        self
    }

    /// 设置命名空间
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    /// 设置默认 TTL（秒）
    pub fn ttl(mut self, ttl: u64) -> Self {
        self.config.ttl = ttl;
        self
    }

    /// 构建注册中心实例
    pub async fn build(self) -> Result<Arc<dyn Registry>> {
        create_registry(&self.config).await
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_type_from_str() {
        assert_eq!(
            "zookeeper".parse::<RegistryType>().unwrap(),
            RegistryType::Zookeeper
        );
        assert_eq!("Etcd".parse::<RegistryType>().unwrap(), RegistryType::Etcd);
        assert!(matches!(
            "eureka".parse::<RegistryType>(),
            Err(DiscoveryError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_create_registry_unknown_type() {
        let config = RegistryConfig {
            registry_type: "redis".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            create_registry(&config).await,
            Err(DiscoveryError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_builder_memory() {
        let registry = RegistryBuilder::new()
            .registry_type("memory")
            .ttl(10)
            .build()
            .await
            .unwrap();
        assert!(registry.list_services().await.unwrap().is_empty());
        registry.close().await.unwrap();
    }
}
