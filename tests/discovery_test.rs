//! 服务发现层集成测试

use async_trait::async_trait;
use flare_discovery::{
    Discovery, DiscoveryError, EventType, Health, LoadBalanceStrategy, MemoryRegistry, Registry,
    Result, ServiceEvent, ServiceRecord,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep, timeout};

fn record(name: &str, id: &str, port: u16, health: Health) -> ServiceRecord {
    ServiceRecord::new(name, "127.0.0.1", port)
        .with_id(id)
        .with_health(health)
}

/// 统计 list_services 回源次数的注册中心包装
struct CountingRegistry {
    inner: MemoryRegistry,
    list_calls: AtomicUsize,
}

impl CountingRegistry {
    fn new() -> Self {
        Self {
            inner: MemoryRegistry::new(30),
            list_calls: AtomicUsize::new(0),
        }
    }

    fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Registry for CountingRegistry {
    async fn register(&self, record: ServiceRecord) -> Result<ServiceRecord> {
        self.inner.register(record).await
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.inner.deregister(id).await
    }

    async fn update(&self, record: ServiceRecord) -> Result<ServiceRecord> {
        self.inner.update(record).await
    }

    async fn get_service(&self, id: &str) -> Result<ServiceRecord> {
        self.inner.get_service(id).await
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.list_services().await
    }

    async fn watch(&self) -> Result<mpsc::Receiver<ServiceEvent>> {
        self.inner.watch().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_round_robin_skips_unhealthy_instance() {
    let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new(30));
    registry
        .register(record("user-service", "healthy-1", 8081, Health::Healthy))
        .await
        .unwrap();
    registry
        .register(record("user-service", "healthy-2", 8082, Health::Healthy))
        .await
        .unwrap();
    registry
        .register(record("user-service", "broken", 8083, Health::Unhealthy))
        .await
        .unwrap();

    let discovery =
        Discovery::with_strategy(registry.clone(), LoadBalanceStrategy::RoundRobin);

    let mut picked = HashSet::new();
    for _ in 0..20 {
        let selected = discovery.discover_one("user-service").await.unwrap();
        assert_ne!(selected.id, "broken");
        picked.insert(selected.id);
    }
    // 两个健康实例都被轮到
    assert_eq!(picked.len(), 2);

    discovery.close().await.unwrap();
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_discover_one_unavailable_when_no_instances() {
    let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new(30));
    let discovery = Discovery::new(registry.clone());

    assert!(matches!(
        discovery.discover_one("ghost-service").await,
        Err(DiscoveryError::Unavailable { .. })
    ));

    discovery.close().await.unwrap();
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_cache_applies_delete_without_new_list() {
    let counting = Arc::new(CountingRegistry::new());
    counting
        .register(record("user-service", "node-1", 8081, Health::Healthy))
        .await
        .unwrap();
    counting
        .register(record("user-service", "node-2", 8082, Health::Healthy))
        .await
        .unwrap();

    let registry: Arc<dyn Registry> = counting.clone();
    let discovery = Discovery::new(registry);

    // 首次未命中回源一次
    assert_eq!(discovery.discover("user-service").await.unwrap().len(), 2);
    assert_eq!(counting.list_calls(), 1);

    counting.deregister("node-1").await.unwrap();
    // 等转发任务消费 Deleted 事件
    sleep(Duration::from_millis(100)).await;

    let records = discovery.discover("user-service").await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "node-2");
    // 增量维护，没有新的回源
    assert_eq!(counting.list_calls(), 1);

    discovery.close().await.unwrap();
    counting.close().await.unwrap();
}

#[tokio::test]
async fn test_cache_applies_create_and_update() {
    let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new(30));
    registry
        .register(record("user-service", "node-1", 8081, Health::Healthy))
        .await
        .unwrap();

    let discovery = Discovery::new(registry.clone());
    assert_eq!(discovery.discover("user-service").await.unwrap().len(), 1);

    registry
        .register(record("user-service", "node-2", 8082, Health::Healthy))
        .await
        .unwrap();
    let mut changed = registry.get_service("node-1").await.unwrap();
    changed.port = 9090;
    registry.update(changed).await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let records = discovery.discover("user-service").await.unwrap();
    assert_eq!(records.len(), 2);
    let node1 = records.iter().find(|r| r.id == "node-1").unwrap();
    assert_eq!(node1.port, 9090);

    discovery.close().await.unwrap();
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_watch_filters_by_service_name() {
    let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new(30));
    let discovery = Discovery::new(registry.clone());

    let mut events = discovery.watch("user-service").await.unwrap();

    registry
        .register(record("order-service", "order-1", 8090, Health::Healthy))
        .await
        .unwrap();
    registry
        .register(record("user-service", "user-1", 8081, Health::Healthy))
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.event_type, EventType::Created);
    assert_eq!(event.record.name, "user-service");
    assert_eq!(event.record.id, "user-1");

    // 其他服务的事件不会串进来
    assert!(
        timeout(Duration::from_millis(200), events.recv())
            .await
            .is_err()
    );

    discovery.close().await.unwrap();
    registry.close().await.unwrap();
}

#[tokio::test]
async fn test_close_leaves_registry_usable() {
    let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new(30));
    let discovery = Discovery::new(registry.clone());
    registry
        .register(record("user-service", "node-1", 8081, Health::Healthy))
        .await
        .unwrap();
    discovery.discover("user-service").await.unwrap();

    discovery.close().await.unwrap();
    discovery.close().await.unwrap();
    assert!(matches!(
        discovery.discover("user-service").await,
        Err(DiscoveryError::Closed)
    ));

    // 注册中心不随发现层关闭
    assert_eq!(registry.list_services().await.unwrap().len(), 1);
    registry.close().await.unwrap();
}
