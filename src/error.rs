//! 统一错误类型
//!
//! 注册发现、负载均衡、熔断与统一客户端共用的错误分类。
//! 后端驱动的原始错误总是附带操作名和服务/实例标识再向上传播，
//! 便于在不深入后端内部的情况下定位问题。

use thiserror::Error;

/// 服务注册发现统一错误类型
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// 记录不存在
    #[error("service not found: {id}")]
    NotFound { id: String },

    /// 没有健康的服务实例可用
    #[error("no available instance for service: {service}")]
    Unavailable { service: String },

    /// 后端驱动错误（网络/认证/序列化），带操作上下文
    #[error("{operation} failed: {message}")]
    Backend { operation: String, message: String },

    /// 在已关闭的注册中心/发现器上执行操作
    #[error("registry is closed")]
    Closed,

    /// 配置错误（未知后端类型或子配置不合法）
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// 熔断器打开，调用被直接拒绝
    #[error("circuit breaker open for service: {service}")]
    CircuitOpen { service: String },
}

impl DiscoveryError {
    /// 创建带操作上下文的后端错误
    pub fn backend(operation: impl Into<String>, message: impl std::fmt::Display) -> Self {
        DiscoveryError::Backend {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// 创建记录不存在错误
    pub fn not_found(id: impl Into<String>) -> Self {
        DiscoveryError::NotFound { id: id.into() }
    }

    /// 创建无可用实例错误
    pub fn unavailable(service: impl Into<String>) -> Self {
        DiscoveryError::Unavailable {
            service: service.into(),
        }
    }

    /// 判断是否为可重试的错误（传输层失败可以重试，
    /// 无可用实例和熔断打开不应重试）
    pub fn is_retryable(&self) -> bool {
        matches!(self, DiscoveryError::Backend { .. })
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, DiscoveryError>;
