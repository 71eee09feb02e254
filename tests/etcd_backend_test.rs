//! etcd 后端集成测试
//!
//! 这些测试需要运行中的 etcd 服务器实例。
//! 默认情况下，测试会被忽略，需要使用 `cargo test --test etcd_backend_test -- --ignored` 运行。
//!
//! 启动 etcd 服务器：
//! ```bash
//! # 使用 Docker 启动 etcd
//! docker run -d --name etcd-test -p 2379:2379 -p 2380:2380 \
//!   quay.io/coreos/etcd:v3.5.9 \
//!   etcd --advertise-client-urls=http://127.0.0.1:2379 \
//!        --listen-client-urls=http://0.0.0.0:2379
//! ```

use flare_discovery::{
    DiscoveryError, EtcdRegistry, EventType, Health, Registry, ServiceRecord,
};
use tokio::time::{Duration, timeout};
use uuid::Uuid;

/// etcd 服务器地址
/// 可以通过环境变量 ETCD_ENDPOINTS 覆盖，默认为 http://127.0.0.1:2379
fn etcd_endpoints() -> Vec<String> {
    std::env::var("ETCD_ENDPOINTS")
        .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|_| vec!["http://127.0.0.1:2379".to_string()])
}

/// 每个测试独立命名空间，避免互相污染
fn test_namespace() -> String {
    format!("flare-test-{}", Uuid::new_v4())
}

fn record(name: &str, id: &str, port: u16) -> ServiceRecord {
    ServiceRecord::new(name, "127.0.0.1", port)
        .with_id(id)
        .with_health(Health::Healthy)
        .with_metadata("env", "test")
}

#[tokio::test]
#[ignore]
async fn test_etcd_register_get_list_deregister() {
    let registry = EtcdRegistry::new(etcd_endpoints(), test_namespace(), 30)
        .await
        .unwrap();

    let registered = registry
        .register(record("user-service", "node-1", 8080))
        .await
        .unwrap();
    assert_eq!(registry.get_service("node-1").await.unwrap(), registered);
    assert_eq!(registry.list_services().await.unwrap().len(), 1);

    registry.deregister("node-1").await.unwrap();
    assert!(matches!(
        registry.get_service("node-1").await,
        Err(DiscoveryError::NotFound { .. })
    ));

    registry.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_etcd_update_preserves_created_at() {
    let registry = EtcdRegistry::new(etcd_endpoints(), test_namespace(), 30)
        .await
        .unwrap();

    let registered = registry
        .register(record("user-service", "node-1", 8080))
        .await
        .unwrap();
    let mut changed = registered.clone();
    changed.port = 9090;
    let updated = registry.update(changed).await.unwrap();
    assert_eq!(updated.created_at, registered.created_at);
    assert!(updated.updated_at >= registered.updated_at);

    registry.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_etcd_watch_pushes_events() {
    let registry = EtcdRegistry::new(etcd_endpoints(), test_namespace(), 30)
        .await
        .unwrap();
    let mut events = registry.watch().await.unwrap();

    registry
        .register(record("user-service", "node-1", 8080))
        .await
        .unwrap();
    let created = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.event_type, EventType::Created);
    assert_eq!(created.record.id, "node-1");

    registry.deregister("node-1").await.unwrap();
    let deleted = timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deleted.event_type, EventType::Deleted);

    registry.close().await.unwrap();
}

#[tokio::test]
#[ignore]
async fn test_etcd_lease_expiry_removes_record() {
    let namespace = test_namespace();
    let registry = EtcdRegistry::new(etcd_endpoints(), namespace.clone(), 2)
        .await
        .unwrap();
    registry
        .register(record("user-service", "node-1", 8080).with_ttl(2))
        .await
        .unwrap();
    // close 终止续期任务但不吊销租约，租约到期后记录消失
    registry.close().await.unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    let verifier = EtcdRegistry::new(etcd_endpoints(), namespace, 30)
        .await
        .unwrap();
    assert!(verifier.list_services().await.unwrap().is_empty());
    verifier.close().await.unwrap();
}
