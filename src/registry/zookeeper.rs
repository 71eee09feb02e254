//! Zookeeper 服务注册发现实现
//!
//! 实例记录以 JSON 存放在临时节点 `/{namespace}/{service}/{id}` 中，
//! 客户端会话结束时节点由 Zookeeper 自动删除，无需续期任务。
//! Zookeeper 的 watch 是一次性的：pump 任务每轮对命名空间、各服务目录
//! 和各实例节点挂一次性 watch，任一触发后全量重扫、diff、重挂。
//! 枚举没有前缀扫描，只能递归遍历两级目录。

use super::hub::WatchHub;
use super::Registry;
use crate::error::{DiscoveryError, Result};
use crate::types::{ServiceEvent, ServiceRecord};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};
use zookeeper_client as zk;

/// 全量重扫失败后的重试间隔
const RESCAN_RETRY: Duration = Duration::from_secs(1);

fn zk_error(operation: &str, err: zk::Error) -> DiscoveryError {
    DiscoveryError::backend(operation, format!("zookeeper: {}", err))
}

/// Zookeeper 服务注册发现
pub struct ZookeeperRegistry {
    client: zk::Client,
    namespace: String,
    default_ttl: u64,
    /// 本实例注册的记录 id → 服务名，注销时免去目录遍历
    registered: Mutex<HashMap<String, String>>,
    hub: Arc<WatchHub>,
    pump_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ZookeeperRegistry {
    pub async fn new(endpoint: String, namespace: String, ttl: u64) -> Result<Self> {
        let client = zk::Client::connect(&endpoint)
            .await
            .map_err(|e| zk_error("connect", e))?;

        let registry = Self {
            client,
            namespace,
            default_ttl: if ttl == 0 {
                crate::types::DEFAULT_TTL_SECS
            } else {
                ttl
            },
            registered: Mutex::new(HashMap::new()),
            hub: Arc::new(WatchHub::new()),
            pump_handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        registry.ensure_node(&registry.namespace_path()).await?;

        info!(endpoint = %endpoint, namespace = %registry.namespace, "Connected to Zookeeper");
        Ok(registry)
    }

    fn namespace_path(&self) -> String {
        format!("/{}", self.namespace)
    }

    fn service_path(&self, name: &str) -> String {
        format!("/{}/{}", self.namespace, name)
    }

    fn node_path(&self, name: &str, id: &str) -> String {
        format!("/{}/{}/{}", self.namespace, name, id)
    }

    /// 创建持久目录节点，已存在视为成功
    async fn ensure_node(&self, path: &str) -> Result<()> {
        let options = zk::CreateMode::Persistent.with_acls(zk::Acls::anyone_all());
        match self.client.create(path, &[], &options).await {
            Ok(_) | Err(zk::Error::NodeExists) => Ok(()),
            Err(e) => Err(zk_error("create", e)),
        }
    }

    /// 定位记录所在路径：优先本地注册表，否则遍历目录
    async fn find_node_path(&self, id: &str) -> Result<String> {
        if let Some(name) = self.registered.lock().await.get(id) {
            return Ok(self.node_path(name, id));
        }
        let services = match self.client.get_children(&self.namespace_path()).await {
            Ok((services, _)) => services,
            Err(zk::Error::NoNode) => return Err(DiscoveryError::not_found(id)),
            Err(e) => return Err(zk_error("get_service", e)),
        };
        for name in services {
            let ids = match self.client.get_children(&self.service_path(&name)).await {
                Ok((ids, _)) => ids,
                Err(zk::Error::NoNode) => continue,
                Err(e) => return Err(zk_error("get_service", e)),
            };
            if ids.iter().any(|node| node == id) {
                return Ok(self.node_path(&name, id));
            }
        }
        Err(DiscoveryError::not_found(id))
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DiscoveryError::Closed)
        } else {
            Ok(())
        }
    }

    async fn ensure_pump_task(&self) {
        let mut guard = self.pump_handle.lock().await;
        if guard.is_some() {
            return;
        }

        let client = self.client.clone();
        let ns_path = self.namespace_path();
        let hub = self.hub.clone();

        let handle = tokio::spawn(async move {
            let (notify_tx, mut notify_rx) = mpsc::channel::<()>(16);
            let mut snapshot: HashMap<String, ServiceRecord> = HashMap::new();
            let mut forwarders: Vec<tokio::task::JoinHandle<()>> = Vec::new();

            loop {
                // 上一轮未触发的 watch 随任务中止被丢弃，避免在服务端累积
                for handle in forwarders.drain(..) {
                    handle.abort();
                }

                let current = match scan_and_arm(&client, &ns_path, &notify_tx, &mut forwarders)
                    .await
                {
                    Ok(records) => records,
                    Err(e) => {
                        warn!(error = %e, "Failed to scan zookeeper tree");
                        tokio::time::sleep(RESCAN_RETRY).await;
                        continue;
                    }
                };

                for (id, record) in &current {
                    match snapshot.get(id) {
                        None => hub.emit(ServiceEvent::created(record.clone())).await,
                        Some(old) if old != record => {
                            hub.emit(ServiceEvent::updated(record.clone())).await
                        }
                        _ => {}
                    }
                }
                for (id, record) in &snapshot {
                    if !current.contains_key(id) {
                        hub.emit(ServiceEvent::deleted(record.clone())).await;
                    }
                }
                snapshot = current;

                if notify_rx.recv().await.is_none() {
                    break;
                }
                // 合并同一批触发，下一轮全量重扫已覆盖
                while notify_rx.try_recv().is_ok() {}
            }
        });

        *guard = Some(handle);
    }
}

/// 遍历命名空间树，对每个节点挂一次性 watch 并把触发转发到通知通道
async fn scan_and_arm(
    client: &zk::Client,
    ns_path: &str,
    notify_tx: &mpsc::Sender<()>,
    forwarders: &mut Vec<tokio::task::JoinHandle<()>>,
) -> Result<HashMap<String, ServiceRecord>> {
    let mut arm = |watcher: zk::OneshotWatcher| {
        let tx = notify_tx.clone();
        forwarders.push(tokio::spawn(async move {
            watcher.changed().await;
            let _ = tx.try_send(());
        }));
    };

    let mut records = HashMap::new();
    let services = match client.get_and_watch_children(ns_path).await {
        Ok((services, _, watcher)) => {
            arm(watcher);
            services
        }
        Err(zk::Error::NoNode) => return Ok(records),
        Err(e) => return Err(zk_error("watch", e)),
    };

    for name in services {
        let service_path = format!("{}/{}", ns_path, name);
        let ids = match client.get_and_watch_children(&service_path).await {
            Ok((ids, _, watcher)) => {
                arm(watcher);
                ids
            }
            Err(zk::Error::NoNode) => continue,
            Err(e) => return Err(zk_error("watch", e)),
        };

        for id in ids {
            let node_path = format!("{}/{}", service_path, id);
            let data = match client.get_and_watch_data(&node_path).await {
                Ok((data, _, watcher)) => {
                    arm(watcher);
                    data
                }
                Err(zk::Error::NoNode) => continue,
                Err(e) => return Err(zk_error("watch", e)),
            };
            match serde_json::from_slice::<ServiceRecord>(&data) {
                Ok(record) => {
                    records.insert(record.id.clone(), record);
                }
                Err(e) => warn!(path = %node_path, error = %e, "Skipping undecodable record"),
            }
        }
    }
    Ok(records)
}

#[async_trait]
impl Registry for ZookeeperRegistry {
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

        self.ensure_node(&self.service_path(&record.name)).await?;

        let data = serde_json::to_vec(&record)
            .map_err(|e| DiscoveryError::backend("register", format!("serialize record: {}", e)))?;
        let options = zk::CreateMode::Ephemeral.with_acls(zk::Acls::anyone_all());
        let path = self.node_path(&record.name, &record.id);
        match self.client.create(&path, &data, &options).await {
            Ok(_) => {}
            Err(zk::Error::NodeExists) => {
                return Err(DiscoveryError::backend(
                    "register",
                    format!("service already registered: {}", record.id),
                ));
            }
            Err(e) => return Err(zk_error("register", e)),
        }

        self.registered
            .lock()
            .await
            .insert(record.id.clone(), record.name.clone());

        info!(
            instance_id = %record.id,
            service = %record.name,
            path = %path,
            "Service registered with Zookeeper"
        );
        Ok(record)
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.check_open()?;

        let path = self.find_node_path(id).await?;
        match self.client.delete(&path, None).await {
            Ok(()) => {}
            Err(zk::Error::NoNode) => return Err(DiscoveryError::not_found(id)),
            Err(e) => return Err(zk_error("deregister", e)),
        }
        self.registered.lock().await.remove(id);

        info!(instance_id = %id, path = %path, "Service deregistered from Zookeeper");
        Ok(())
    }

    async fn update(&self, mut record: ServiceRecord) -> Result<ServiceRecord> {
        self.check_open()?;

        let path = self.find_node_path(&record.id).await?;
        let current = match self.client.get_data(&path).await {
            Ok((data, _)) => serde_json::from_slice::<ServiceRecord>(&data)
                .map_err(|e| DiscoveryError::backend("update", format!("decode record: {}", e)))?,
            Err(zk::Error::NoNode) => return Err(DiscoveryError::not_found(&record.id)),
            Err(e) => return Err(zk_error("update", e)),
        };
        record.stamp_updated(current.created_at);

        let data = serde_json::to_vec(&record)
            .map_err(|e| DiscoveryError::backend("update", format!("serialize record: {}", e)))?;
        match self.client.set_data(&path, &data, None).await {
            Ok(_) => Ok(record),
            Err(zk::Error::NoNode) => Err(DiscoveryError::not_found(&record.id)),
            Err(e) => Err(zk_error("update", e)),
        }
    }

    async fn get_service(&self, id: &str) -> Result<ServiceRecord> {
        self.check_open()?;

        let path = self.find_node_path(id).await?;
        match self.client.get_data(&path).await {
            Ok((data, _)) => serde_json::from_slice(&data).map_err(|e| {
                DiscoveryError::backend("get_service", format!("decode record: {}", e))
            }),
            Err(zk::Error::NoNode) => Err(DiscoveryError::not_found(id)),
            Err(e) => Err(zk_error("get_service", e)),
        }
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        self.check_open()?;

        let services = match self.client.get_children(&self.namespace_path()).await {
            Ok((services, _)) => services,
            Err(zk::Error::NoNode) => return Ok(Vec::new()),
            Err(e) => return Err(zk_error("list_services", e)),
        };

        let mut records = Vec::new();
        for name in services {
            let ids = match self.client.get_children(&self.service_path(&name)).await {
                Ok((ids, _)) => ids,
                Err(zk::Error::NoNode) => continue,
                Err(e) => return Err(zk_error("list_services", e)),
            };
            for id in ids {
                let path = self.node_path(&name, &id);
                match self.client.get_data(&path).await {
                    Ok((data, _)) => match serde_json::from_slice::<ServiceRecord>(&data) {
                        Ok(record) => records.push(record),
                        Err(e) => {
                            warn!(path = %path, error = %e, "Skipping undecodable record")
                        }
                    },
                    // 遍历与删除竞争，节点消失直接跳过
                    Err(zk::Error::NoNode) => continue,
                    Err(e) => return Err(zk_error("list_services", e)),
                }
            }
        }
        Ok(records)
    }

    async fn watch(&self) -> Result<mpsc::Receiver<ServiceEvent>> {
        self.check_open()?;
        self.ensure_pump_task().await;
        Ok(self.hub.subscribe().await)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.pump_handle.lock().await.take() {
            handle.abort();
        }
        self.hub.clear().await;
        self.registered.lock().await.clear();
        info!("Zookeeper registry closed");
        Ok(())
    }
}

impl Drop for ZookeeperRegistry {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.pump_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
