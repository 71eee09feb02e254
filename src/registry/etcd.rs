//! etcd 服务注册发现实现
//!
//! 每条记录对应一个以记录 TTL 授予的租约，key 为 `/{namespace}/{name}/{id}`，
//! value 为 JSON 序列化的记录。续期任务按 TTL/3 周期续约直至注销或租约丢失，
//! 租约丢失即 key 消失。Watch 为 key 前缀上的原生推送。

use super::hub::WatchHub;
use super::Registry;
use crate::error::{DiscoveryError, Result};
use crate::types::{ServiceEvent, ServiceRecord};
use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

struct LeaseHandle {
    lease_id: i64,
    key: String,
    keep_alive: tokio::task::JoinHandle<()>,
}

/// etcd 服务注册发现
pub struct EtcdRegistry {
    client: Client,
    namespace: String,
    default_ttl: u64,
    leases: Mutex<HashMap<String, LeaseHandle>>,
    hub: Arc<WatchHub>,
    watch_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl EtcdRegistry {
    pub async fn new(endpoints: Vec<String>, namespace: String, ttl: u64) -> Result<Self> {
        let client = Client::connect(endpoints, None)
            .await
            .map_err(|e| DiscoveryError::backend("connect", format!("etcd: {}", e)))?;

        Ok(Self {
            client,
            namespace,
            default_ttl: if ttl == 0 {
                crate::types::DEFAULT_TTL_SECS
            } else {
                ttl
            },
            leases: Mutex::new(HashMap::new()),
            hub: Arc::new(WatchHub::new()),
            watch_handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn prefix(&self) -> String {
        format!("/{}/", self.namespace)
    }

    fn key_for(&self, record: &ServiceRecord) -> String {
        format!("/{}/{}/{}", self.namespace, record.name, record.id)
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DiscoveryError::Closed)
        } else {
            Ok(())
        }
    }

    /// 启动租约续期任务，运行至注销或租约丢失
    fn start_keep_alive(&self, lease_id: i64, ttl: u64, instance_id: String) -> tokio::task::JoinHandle<()> {
        let mut client = self.client.clone();

        tokio::spawn(async move {
            let (mut keeper, mut stream) = match client.lease_keep_alive(lease_id).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(instance_id = %instance_id, error = %e, "Failed to open lease keep-alive stream");
                    return;
                }
            };

            let mut ticker =
                tokio::time::interval(Duration::from_secs((ttl / 3).max(1)));
            loop {
                ticker.tick().await;

                if let Err(e) = keeper.keep_alive().await {
                    error!(instance_id = %instance_id, error = %e, "Lease keep-alive failed");
                    break;
                }
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.ttl() <= 0 {
                            error!(instance_id = %instance_id, lease_id, "Lease lost, stopping renewal");
                            break;
                        }
                        debug!(instance_id = %instance_id, lease_id, ttl = resp.ttl(), "Lease renewed");
                    }
                    Ok(None) => {
                        error!(instance_id = %instance_id, "Lease keep-alive stream closed");
                        break;
                    }
                    Err(e) => {
                        error!(instance_id = %instance_id, error = %e, "Lease keep-alive stream error");
                        break;
                    }
                }
            }
        })
    }

    /// 确保前缀 watch 泵已启动（惰性，首个 watcher 触发）
    async fn ensure_watch_pump(&self) {
        let mut guard = self.watch_handle.lock().await;
        if guard.is_some() {
            return;
        }

        let mut client = self.client.clone();
        let prefix = self.prefix();
        let hub = self.hub.clone();

        let handle = tokio::spawn(async move {
            let options = WatchOptions::new().with_prefix().with_prev_key();
            let (_watcher, mut stream) = match client.watch(prefix.clone(), Some(options)).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(prefix = %prefix, error = %e, "Failed to open etcd watch");
                    return;
                }
            };

            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        for ev in resp.events() {
                            match ev.event_type() {
                                EventType::Put => {
                                    if let Some(kv) = ev.kv() {
                                        if let Ok(record) =
                                            serde_json::from_slice::<ServiceRecord>(kv.value())
                                        {
                                            // version 1 表示 key 首次写入
                                            let event = if kv.version() == 1 {
                                                ServiceEvent::created(record)
                                            } else {
                                                ServiceEvent::updated(record)
                                            };
                                            hub.emit(event).await;
                                        }
                                    }
                                }
                                EventType::Delete => {
                                    if let Some(prev) = ev.prev_kv() {
                                        if let Ok(record) =
                                            serde_json::from_slice::<ServiceRecord>(prev.value())
                                        {
                                            hub.emit(ServiceEvent::deleted(record)).await;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        warn!("etcd watch stream closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "etcd watch stream error");
                        break;
                    }
                }
            }
        });

        *guard = Some(handle);
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register(&self, mut record: ServiceRecord) -> Result<ServiceRecord> {
        self.check_open()?;
        if record.name.is_empty() {
            return Err(DiscoveryError::Configuration(
                "service name must not be empty".to_string(),
            ));
        }
        if record.ttl_secs == 0 {
            record.ttl_secs = self.default_ttl;
        }
        record.stamp_registered();

        let key = self.key_for(&record);
        let mut client = self.client.clone();

        let existing = client
            .get(key.clone(), None)
            .await
            .map_err(|e| DiscoveryError::backend("register", format!("etcd get {}: {}", key, e)))?;
        if !existing.kvs().is_empty() {
            return Err(DiscoveryError::backend(
                "register",
                format!("service already registered: {}", record.id),
            ));
        }

        let lease = client
            .lease_grant(record.ttl_secs as i64, None)
            .await
            .map_err(|e| DiscoveryError::backend("register", format!("etcd lease grant: {}", e)))?;
        let lease_id = lease.id();

        let value = serde_json::to_string(&record)
            .map_err(|e| DiscoveryError::backend("register", format!("serialize record: {}", e)))?;
        client
            .put(key.clone(), value, Some(PutOptions::new().with_lease(lease_id)))
            .await
            .map_err(|e| DiscoveryError::backend("register", format!("etcd put {}: {}", key, e)))?;

        let keep_alive = self.start_keep_alive(lease_id, record.ttl_secs, record.id.clone());
        self.leases.lock().await.insert(
            record.id.clone(),
            LeaseHandle {
                lease_id,
                key,
                keep_alive,
            },
        );

        info!(
            instance_id = %record.id,
            service = %record.name,
            address = %record.address,
            port = record.port,
            lease_id,
            "Service registered"
        );
        Ok(record)
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.check_open()?;
        let mut client = self.client.clone();

        if let Some(handle) = self.leases.lock().await.remove(id) {
            handle.keep_alive.abort();
            // 租约吊销会一并删除绑定的 key；失败时退回显式删除
            if let Err(e) = client.lease_revoke(handle.lease_id).await {
                warn!(instance_id = %id, error = %e, "Lease revoke failed, deleting key directly");
                client.delete(handle.key.clone(), None).await.map_err(|e| {
                    DiscoveryError::backend("deregister", format!("etcd delete {}: {}", handle.key, e))
                })?;
            }
            info!(instance_id = %id, "Service deregistered");
            return Ok(());
        }

        // 非本实例注册的记录：扫描前缀定位
        let resp = client
            .get(self.prefix(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| DiscoveryError::backend("deregister", format!("etcd get prefix: {}", e)))?;
        for kv in resp.kvs() {
            if let Ok(record) = serde_json::from_slice::<ServiceRecord>(kv.value()) {
                if record.id == id {
                    let key = String::from_utf8_lossy(kv.key()).to_string();
                    client.delete(key.clone(), None).await.map_err(|e| {
                        DiscoveryError::backend("deregister", format!("etcd delete {}: {}", key, e))
                    })?;
                    info!(instance_id = %id, "Service deregistered");
                    return Ok(());
                }
            }
        }
        Err(DiscoveryError::not_found(id))
    }

    async fn update(&self, mut record: ServiceRecord) -> Result<ServiceRecord> {
        self.check_open()?;
        let key = self.key_for(&record);
        let mut client = self.client.clone();

        let existing = client
            .get(key.clone(), None)
            .await
            .map_err(|e| DiscoveryError::backend("update", format!("etcd get {}: {}", key, e)))?;
        let kv = existing
            .kvs()
            .first()
            .ok_or_else(|| DiscoveryError::not_found(&record.id))?;
        let current: ServiceRecord = serde_json::from_slice(kv.value())
            .map_err(|e| DiscoveryError::backend("update", format!("parse record: {}", e)))?;
        record.stamp_updated(current.created_at);

        let lease_id = self
            .leases
            .lock()
            .await
            .get(&record.id)
            .map(|handle| handle.lease_id);
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));

        let value = serde_json::to_string(&record)
            .map_err(|e| DiscoveryError::backend("update", format!("serialize record: {}", e)))?;
        client
            .put(key.clone(), value, options)
            .await
            .map_err(|e| DiscoveryError::backend("update", format!("etcd put {}: {}", key, e)))?;

        Ok(record)
    }

    async fn get_service(&self, id: &str) -> Result<ServiceRecord> {
        self.check_open()?;
        let mut client = self.client.clone();
        let resp = client
            .get(self.prefix(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| DiscoveryError::backend("get_service", format!("etcd get prefix: {}", e)))?;

        for kv in resp.kvs() {
            if let Ok(record) = serde_json::from_slice::<ServiceRecord>(kv.value()) {
                if record.id == id {
                    return Ok(record);
                }
            }
        }
        Err(DiscoveryError::not_found(id))
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        self.check_open()?;
        let mut client = self.client.clone();
        let resp = client
            .get(self.prefix(), Some(GetOptions::new().with_prefix()))
            .await
            .map_err(|e| DiscoveryError::backend("list_services", format!("etcd get prefix: {}", e)))?;

        let mut records = Vec::new();
        for kv in resp.kvs() {
            if let Ok(record) = serde_json::from_slice::<ServiceRecord>(kv.value()) {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn watch(&self) -> Result<mpsc::Receiver<ServiceEvent>> {
        self.check_open()?;
        self.ensure_watch_pump().await;
        Ok(self.hub.subscribe().await)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        for (_, handle) in self.leases.lock().await.drain() {
            handle.keep_alive.abort();
        }
        if let Some(handle) = self.watch_handle.lock().await.take() {
            handle.abort();
        }
        self.hub.clear().await;
        info!("etcd registry closed");
        Ok(())
    }
}

impl Drop for EtcdRegistry {
    fn drop(&mut self) {
        if let Ok(mut leases) = self.leases.try_lock() {
            for (_, handle) in leases.drain() {
                handle.keep_alive.abort();
            }
        }
        if let Ok(mut guard) = self.watch_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
