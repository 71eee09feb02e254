//! 统一服务客户端
//!
//! 一次调用 = 发现选址 → 可选熔断 → 按协议传输 → 按配置策略重试。
//! 三种失败保持可区分：无实例（Unavailable）、传输失败（Backend）、
//! 熔断拒绝（CircuitOpen）。

pub mod transport;

pub use transport::{GrpcTransport, HttpTransport, Transport, TransportRequest, TransportResponse};

use crate::breaker::CircuitBreaker;
use crate::config::{ClientConfig, RetryBackoff};
use crate::discovery::Discovery;
use crate::error::{DiscoveryError, Result};
use crate::retry::{ExponentialBackoffPolicy, FixedRetryPolicy, RetryPolicy};
use crate::types::Protocol;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// 统一服务客户端
pub struct Client {
    discovery: Arc<Discovery>,
    config: ClientConfig,
    http: Arc<dyn Transport>,
    grpc: Arc<dyn Transport>,
    /// 按服务名懒创建的熔断器，仅在配置了熔断时使用
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl Client {
    pub fn new(discovery: Arc<Discovery>) -> Self {
        Self::with_config(discovery, ClientConfig::default())
    }

    pub fn with_config(discovery: Arc<Discovery>, config: ClientConfig) -> Self {
        let timeout = config.timeout_duration();
        Self {
            discovery,
            config,
            http: Arc::new(HttpTransport::new(timeout)),
            grpc: Arc::new(GrpcTransport::new(timeout)),
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// 替换某个协议的传输实现
    pub fn with_transport(mut self, protocol: Protocol, transport: Arc<dyn Transport>) -> Self {
        match protocol {
            Protocol::Http => self.http = transport,
            Protocol::Grpc => self.grpc = transport,
        }
        self
    }

    /// 调用服务
    ///
    /// `path` 对 HTTP 是请求路径，对 gRPC 是方法全路径。
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        path: &str,
        body: Vec<u8>,
    ) -> Result<TransportResponse> {
        let request = TransportRequest::new(method, path, body);
        match self.breaker_for(service).await {
            Some(breaker) => {
                breaker
                    .execute(|| self.call_with_retry(service, &request))
                    .await
            }
            None => self.call_with_retry(service, &request).await,
        }
    }

    /// JSON 便捷调用：请求序列化为 body，响应 body 反序列化
    pub async fn call_json<Req, Resp>(
        &self,
        service: &str,
        method: &str,
        path: &str,
        request: &Req,
    ) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_vec(request)
            .map_err(|e| DiscoveryError::backend("call", format!("encode request: {}", e)))?;
        let response = self.call(service, method, path, body).await?;
        serde_json::from_slice(&response.body)
            .map_err(|e| DiscoveryError::backend("call", format!("decode response: {}", e)))
    }

    async fn breaker_for(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        let config = self.config.breaker.as_ref()?;

        if let Some(breaker) = self.breakers.read().await.get(service) {
            return Some(breaker.clone());
        }
        let mut breakers = self.breakers.write().await;
        Some(
            breakers
                .entry(service.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::from_config(service, config)))
                .clone(),
        )
    }

    /// 根据配置构造重试策略
    fn retry_policy(&self) -> Box<dyn RetryPolicy> {
        match self.config.retry_backoff {
            RetryBackoff::Fixed => Box::new(FixedRetryPolicy::new(
                self.config.retry_count,
                self.config.retry_delay(),
            )),
            RetryBackoff::Exponential => Box::new(ExponentialBackoffPolicy::new(
                self.config.retry_count,
                self.config.retry_delay(),
                self.config.retry_max_delay(),
            )),
        }
    }

    /// 选址并调用，可重试错误按配置的退避策略重试，耗尽后返回最后一个错误
    async fn call_with_retry(
        &self,
        service: &str,
        request: &TransportRequest,
    ) -> Result<TransportResponse> {
        let policy = self.retry_policy();
        let mut attempt = 0;

        loop {
            match self.call_once(service, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    attempt += 1;
                    if !policy.should_retry(attempt, &e) {
                        return Err(e);
                    }
                    warn!(
                        service = %service,
                        attempt,
                        error = %e,
                        "Call failed, retrying"
                    );
                    tokio::time::sleep(policy.backoff_duration(attempt)).await;
                }
            }
        }
    }

    async fn call_once(
        &self,
        service: &str,
        request: &TransportRequest,
    ) -> Result<TransportResponse> {
        let record = self.discovery.discover_one(service).await?;
        let transport = match record.protocol {
            Protocol::Http => &self.http,
            Protocol::Grpc => &self.grpc,
        };

        let response = transport.invoke(&record, request).await?;
        // 5xx 等价于传输失败，进入重试
        if response.status >= 500 {
            return Err(DiscoveryError::backend(
                "call",
                format!("{} responded with status {}", record.id, response.status),
            ));
        }
        Ok(response)
    }
}
