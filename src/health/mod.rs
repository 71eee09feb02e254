//! 健康检查模块
//!
//! 主动探测服务实例并回写健康状态。检查器只修改 health 和 last_check，
//! 从不移除记录，记录的存活归各后端的存活机制管。

use crate::config::HealthCheckConfig;
use crate::error::{DiscoveryError, Result};
use crate::types::{Health, ServiceRecord};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::debug;

/// 健康检查器
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// 探测实例并回写 health / last_check
    async fn check(&self, record: &mut ServiceRecord) -> Result<()>;

    fn is_healthy(&self, record: &ServiceRecord) -> bool {
        record.is_healthy()
    }
}

/// HTTP 健康检查器
///
/// GET `http://address:port{path}`，2xx 视为健康。
pub struct HttpHealthChecker {
    http: reqwest::Client,
    path: String,
    timeout: Duration,
}

impl HttpHealthChecker {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            path: path.into(),
            timeout,
        }
    }

    pub fn from_config(config: &HealthCheckConfig) -> Self {
        Self::new(config.path.clone(), Duration::from_secs(config.timeout))
    }
}

impl Default for HttpHealthChecker {
    fn default() -> Self {
        Self::from_config(&HealthCheckConfig::default())
    }
}

#[async_trait]
impl HealthChecker for HttpHealthChecker {
    async fn check(&self, record: &mut ServiceRecord) -> Result<()> {
        let url = format!("{}{}", record.http_url(), self.path);
        let healthy = match self
            .http
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        };

        record.health = if healthy {
            Health::Healthy
        } else {
            Health::Unhealthy
        };
        record.last_check = Utc::now();

        debug!(
            instance_id = %record.id,
            service = %record.name,
            url = %url,
            healthy,
            "Health check completed"
        );
        Ok(())
    }
}

/// gRPC 健康检查器
///
/// 以连接探测代替健康协议调用：限时建连成功即视为健康。
pub struct GrpcHealthChecker {
    timeout: Duration,
}

impl GrpcHealthChecker {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for GrpcHealthChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl HealthChecker for GrpcHealthChecker {
    async fn check(&self, record: &mut ServiceRecord) -> Result<()> {
        let endpoint = tonic::transport::Endpoint::from_shared(record.grpc_uri())
            .map_err(|e| {
                DiscoveryError::backend("health_check", format!("invalid uri: {}", e))
            })?
            .connect_timeout(self.timeout)
            .timeout(self.timeout);

        let healthy = endpoint.connect().await.is_ok();
        record.health = if healthy {
            Health::Healthy
        } else {
            Health::Unhealthy
        };
        record.last_check = Utc::now();

        debug!(
            instance_id = %record.id,
            service = %record.name,
            healthy,
            "Grpc connect probe completed"
        );
        Ok(())
    }
}
