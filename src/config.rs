//! 配置定义
//!
//! 注册中心、统一客户端和健康检查的声明式配置，支持从 TOML 文件加载。

use crate::error::{DiscoveryError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 顶层配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub registry: RegistryConfig,
    pub client: Option<ClientConfig>,
    pub health_check: Option<HealthCheckConfig>,
}

/// 注册中心配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistryConfig {
    /// 后端类型：memory, etcd, consul, nacos, zookeeper
    #[serde(default = "default_registry_type")]
    pub registry_type: String,

    /// 后端地址列表（缺省时按后端类型应用本地默认地址）
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// 命名空间
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// 默认 TTL（秒）
    #[serde(default = "default_ttl")]
    pub ttl: u64,
}

fn default_registry_type() -> String {
    "memory".to_string()
}

fn default_namespace() -> String {
    "services".to_string()
}

fn default_ttl() -> u64 {
    crate::types::DEFAULT_TTL_SECS
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registry_type: default_registry_type(),
            endpoints: Vec::new(),
            namespace: default_namespace(),
            ttl: default_ttl(),
        }
    }
}

impl RegistryConfig {
    /// 返回首个后端地址，缺省时使用给定的默认地址
    pub fn primary_endpoint(&self, default: &str) -> String {
        self.endpoints
            .first()
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

/// 统一客户端配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// 单次请求超时（秒）
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// 重试次数（不含首次尝试之外的额外尝试上限）
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,

    /// 重试间隔（毫秒；固定策略下为每次延迟，指数策略下为基准延迟）
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// 重试退避策略
    #[serde(default)]
    pub retry_backoff: RetryBackoff,

    /// 指数退避的延迟上限（毫秒），仅指数策略使用
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// 熔断配置（None 表示不启用熔断）
    pub breaker: Option<BreakerConfig>,
}

/// 重试退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
    /// 固定延迟
    #[default]
    Fixed,
    /// 指数退避（基准延迟按次翻倍，封顶于 retry_max_delay_ms）
    Exponential,
}

fn default_timeout() -> u64 {
    30
}

fn default_retry_count() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            retry_count: default_retry_count(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_backoff: RetryBackoff::default(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            breaker: Some(BreakerConfig::default()),
        }
    }
}

impl ClientConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

/// 熔断器配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BreakerConfig {
    /// 连续失败多少次后打开熔断
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// 打开后多久允许半开探测（秒）
    #[serde(default = "default_breaker_timeout")]
    pub timeout: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> u64 {
    30
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            timeout: default_breaker_timeout(),
        }
    }
}

/// 健康检查配置
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthCheckConfig {
    /// 健康检查间隔（秒）
    #[serde(default = "default_check_interval")]
    pub interval: u64,

    /// 超时时间（秒）
    #[serde(default = "default_check_timeout")]
    pub timeout: u64,

    /// 健康检查路径（HTTP）
    #[serde(default = "default_check_path")]
    pub path: String,
}

fn default_check_interval() -> u64 {
    10
}

fn default_check_timeout() -> u64 {
    5
}

fn default_check_path() -> String {
    "/health".to_string()
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: default_check_interval(),
            timeout: default_check_timeout(),
            path: default_check_path(),
        }
    }
}

impl Config {
    /// 从 TOML 文件加载配置
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DiscoveryError::Configuration(format!("read {}: {}", path, e)))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| DiscoveryError::Configuration(format!("parse {}: {}", path, e)))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_config_defaults() {
        let config: RegistryConfig = toml::from_str("").unwrap();
        assert_eq!(config.registry_type, "memory");
        assert_eq!(config.namespace, "services");
        assert_eq!(config.ttl, 30);
        assert_eq!(
            config.primary_endpoint("http://127.0.0.1:2379"),
            "http://127.0.0.1:2379"
        );
    }

    #[test]
    fn test_client_config_from_toml() {
        let toml_str = r#"
            timeout = 5
            retry_count = 2
            retry_delay_ms = 50

            [breaker]
            failure_threshold = 3
            timeout = 10
        "#;
        let config: ClientConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.timeout, 5);
        assert_eq!(config.retry_count, 2);
        assert_eq!(config.retry_delay(), Duration::from_millis(50));
        // 未写 retry_backoff 时默认固定延迟
        assert_eq!(config.retry_backoff, RetryBackoff::Fixed);
        assert_eq!(config.breaker.unwrap().failure_threshold, 3);
    }

    #[test]
    fn test_client_config_exponential_backoff() {
        let toml_str = r#"
            retry_backoff = "exponential"
            retry_max_delay_ms = 2000
        "#;
        let config: ClientConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.retry_backoff, RetryBackoff::Exponential);
        assert_eq!(config.retry_max_delay(), Duration::from_millis(2000));
    }
}
