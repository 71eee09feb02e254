//! 进程内服务注册发现实现
//!
//! 记录保存在进程内 HashMap 中，周期清扫任务按 TTL 驱逐过期记录。
//! 事件由写入方在持有写锁时同步发出，同进程 watcher 获得严格的 happens-before 全序。

use super::hub::WatchHub;
use super::Registry;
use crate::error::{DiscoveryError, Result};
use crate::types::{ServiceEvent, ServiceRecord};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tracing::info;

/// 清扫任务的运行间隔
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

struct Shared {
    records: RwLock<HashMap<String, ServiceRecord>>,
    hub: WatchHub,
    closed: AtomicBool,
}

/// 进程内服务注册发现
pub struct MemoryRegistry {
    default_ttl: u64,
    shared: Arc<Shared>,
    sweep_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl MemoryRegistry {
    pub fn new(default_ttl: u64) -> Self {
        let shared = Arc::new(Shared {
            records: RwLock::new(HashMap::new()),
            hub: WatchHub::new(),
            closed: AtomicBool::new(false),
        });

        let handle = Self::start_sweep(shared.clone());

        Self {
            default_ttl: if default_ttl == 0 {
                crate::types::DEFAULT_TTL_SECS
            } else {
                default_ttl
            },
            shared,
            sweep_handle: Mutex::new(Some(handle)),
        }
    }

    /// 启动 TTL 清扫任务：`now - last_check` 超过 TTL 的记录被移除并发出 Deleted 事件
    fn start_sweep(shared: Arc<Shared>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;

                let now = Utc::now();
                let expired: Vec<ServiceRecord> = {
                    let mut records = shared.records.write().await;
                    let ids: Vec<String> = records
                        .values()
                        .filter(|r| {
                            (now - r.last_check).num_milliseconds() > (r.ttl_secs as i64) * 1000
                        })
                        .map(|r| r.id.clone())
                        .collect();
                    ids.iter().filter_map(|id| records.remove(id)).collect()
                };

                for record in expired {
                    info!(
                        instance_id = %record.id,
                        service = %record.name,
                        ttl = record.ttl_secs,
                        "Service record expired, removed by sweep"
                    );
                    shared.hub.emit(ServiceEvent::deleted(record)).await;
                }
            }
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(DiscoveryError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
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

        let mut records = self.shared.records.write().await;
        if records.contains_key(&record.id) {
            return Err(DiscoveryError::backend(
                "register",
                format!("service already registered: {}", record.id),
            ));
        }
        records.insert(record.id.clone(), record.clone());

        info!(
            instance_id = %record.id,
            service = %record.name,
            address = %record.address,
            port = record.port,
            "Service registered"
        );
        // 持有写锁时发出事件，保证同进程 watcher 观察到的顺序与写入顺序一致
        self.shared.hub.emit(ServiceEvent::created(record.clone())).await;
        Ok(record)
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.check_open()?;

        let mut records = self.shared.records.write().await;
        match records.remove(id) {
            Some(record) => {
                info!(instance_id = %id, service = %record.name, "Service deregistered");
                self.shared.hub.emit(ServiceEvent::deleted(record)).await;
                Ok(())
            }
            None => Err(DiscoveryError::not_found(id)),
        }
    }

    async fn update(&self, mut record: ServiceRecord) -> Result<ServiceRecord> {
        self.check_open()?;

        let mut records = self.shared.records.write().await;
        let existing = records
            .get(&record.id)
            .ok_or_else(|| DiscoveryError::not_found(&record.id))?;
        record.stamp_updated(existing.created_at);
        records.insert(record.id.clone(), record.clone());

        self.shared.hub.emit(ServiceEvent::updated(record.clone())).await;
        Ok(record)
    }

    async fn get_service(&self, id: &str) -> Result<ServiceRecord> {
        self.check_open()?;
        let records = self.shared.records.read().await;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| DiscoveryError::not_found(id))
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        self.check_open()?;
        let records = self.shared.records.read().await;
        Ok(records.values().cloned().collect())
    }

    async fn watch(&self) -> Result<mpsc::Receiver<ServiceEvent>> {
        self.check_open()?;
        Ok(self.shared.hub.subscribe().await)
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.sweep_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.shared.hub.clear().await;
        self.shared.records.write().await.clear();
        info!("Memory registry closed");
        Ok(())
    }
}

impl Drop for MemoryRegistry {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.sweep_handle.lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
