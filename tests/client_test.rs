//! 统一客户端集成测试
//!
//! 通过脚本化的 mock 传输验证重试、熔断与错误区分，不依赖外部服务。

use async_trait::async_trait;
use flare_discovery::{
    BreakerConfig, Client, ClientConfig, Discovery, DiscoveryError, Health, MemoryRegistry,
    Protocol, Registry, Result, RetryBackoff, ServiceRecord, Transport, TransportRequest,
    TransportResponse,
};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

/// 按脚本返回结果的传输，耗尽脚本后一律失败
struct MockTransport {
    attempts: AtomicUsize,
    script: Mutex<VecDeque<Result<TransportResponse>>>,
}

impl MockTransport {
    fn new(script: Vec<Result<TransportResponse>>) -> Arc<Self> {
        Arc::new(Self {
            attempts: AtomicUsize::new(0),
            script: Mutex::new(script.into()),
        })
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn invoke(
        &self,
        _record: &ServiceRecord,
        _request: &TransportRequest,
    ) -> Result<TransportResponse> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| Err(DiscoveryError::backend("call", "script exhausted")))
    }
}

fn ok_response() -> Result<TransportResponse> {
    Ok(TransportResponse {
        status: 200,
        body: b"ok".to_vec(),
    })
}

fn transport_error() -> Result<TransportResponse> {
    Err(DiscoveryError::backend("call", "connection refused"))
}

async fn registry_with_one_instance() -> Arc<dyn Registry> {
    let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new(30));
    registry
        .register(
            ServiceRecord::new("user-service", "127.0.0.1", 8080)
                .with_id("node-1")
                .with_health(Health::Healthy),
        )
        .await
        .unwrap();
    registry
}

fn client_config(retry_count: usize, breaker: Option<BreakerConfig>) -> ClientConfig {
    ClientConfig {
        timeout: 1,
        retry_count,
        retry_delay_ms: 10,
        breaker,
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn test_retry_succeeds_on_third_attempt() {
    let registry = registry_with_one_instance().await;
    let discovery = Arc::new(Discovery::new(registry.clone()));
    let mock = MockTransport::new(vec![transport_error(), transport_error(), ok_response()]);

    let client = Client::with_config(discovery, client_config(3, None))
        .with_transport(Protocol::Http, mock.clone());

    let response = client
        .call("user-service", "GET", "/users/1", Vec::new())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(mock.attempts(), 3);

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_retry_exhaustion_returns_last_error() {
    let registry = registry_with_one_instance().await;
    let discovery = Arc::new(Discovery::new(registry.clone()));
    let mock = MockTransport::new(vec![transport_error(), transport_error()]);

    let client = Client::with_config(discovery, client_config(2, None))
        .with_transport(Protocol::Http, mock.clone());

    let err = client
        .call("user-service", "GET", "/users/1", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Backend { .. }));
    assert_eq!(mock.attempts(), 2);

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_5xx_is_retried() {
    let registry = registry_with_one_instance().await;
    let discovery = Arc::new(Discovery::new(registry.clone()));
    let mock = MockTransport::new(vec![
        Ok(TransportResponse {
            status: 503,
            body: Vec::new(),
        }),
        ok_response(),
    ]);

    let client = Client::with_config(discovery, client_config(3, None))
        .with_transport(Protocol::Http, mock.clone());

    let response = client
        .call("user-service", "GET", "/users/1", Vec::new())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(mock.attempts(), 2);

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_exponential_backoff_is_used_when_configured() {
    let registry = registry_with_one_instance().await;
    let discovery = Arc::new(Discovery::new(registry.clone()));
    let mock = MockTransport::new(vec![transport_error(), transport_error(), ok_response()]);

    let mut config = client_config(3, None);
    config.retry_backoff = RetryBackoff::Exponential;
    config.retry_max_delay_ms = 50;
    let client =
        Client::with_config(discovery, config).with_transport(Protocol::Http, mock.clone());

    let response = client
        .call("user-service", "GET", "/users/1", Vec::new())
        .await
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(mock.attempts(), 3);

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_unavailable_short_circuits_without_transport() {
    let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new(30));
    let discovery = Arc::new(Discovery::new(registry.clone()));
    let mock = MockTransport::new(vec![ok_response()]);

    let client = Client::with_config(discovery, client_config(3, None))
        .with_transport(Protocol::Http, mock.clone());

    let err = client
        .call("ghost-service", "GET", "/", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::Unavailable { .. }));
    // 没有实例时不走传输、不重试
    assert_eq!(mock.attempts(), 0);

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_breaker_opens_after_threshold_and_rejects() {
    let registry = registry_with_one_instance().await;
    let discovery = Arc::new(Discovery::new(registry.clone()));
    let mock = MockTransport::new(Vec::new());

    let breaker = BreakerConfig {
        failure_threshold: 2,
        timeout: 60,
    };
    let client = Client::with_config(discovery, client_config(1, Some(breaker)))
        .with_transport(Protocol::Http, mock.clone());

    for _ in 0..2 {
        let err = client
            .call("user-service", "GET", "/", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Backend { .. }));
    }
    let attempts_before = mock.attempts();

    // 熔断打开后快速拒绝，传输不再被调用
    let err = client
        .call("user-service", "GET", "/", Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DiscoveryError::CircuitOpen { .. }));
    assert_eq!(mock.attempts(), attempts_before);

    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_call_json_round_trip() {
    let registry = registry_with_one_instance().await;
    let discovery = Arc::new(Discovery::new(registry.clone()));
    let mock = MockTransport::new(vec![Ok(TransportResponse {
        status: 200,
        body: br#"{"id":1,"name":"alice"}"#.to_vec(),
    })]);

    let client = Client::with_config(discovery, client_config(1, None))
        .with_transport(Protocol::Http, mock.clone());

    #[derive(serde::Serialize)]
    struct Query {
        id: u64,
    }
    #[derive(serde::Deserialize)]
    struct User {
        id: u64,
        name: String,
    }

    let user: User = client
        .call_json("user-service", "POST", "/users/get", &Query { id: 1 })
        .await
        .unwrap();
    assert_eq!(user.id, 1);
    assert_eq!(user.name, "alice");

    registry.close().await.unwrap();
}
