//! Consul 服务注册发现实现
//!
//! 通过 Agent HTTP API 注册，存活由 Consul 原生 HTTP 健康检查负责
//! （检查持续 critical 超过 TTL 后由 Consul 自动注销）。
//! 原生服务记录承载不了全部扩展字段，完整记录以 JSON 存入旁路 KV
//! `{namespace}/records/{id}`，读取时合并。Watch 为轮询模拟（默认 5s），
//! 成员变化最多延迟一个轮询周期可见。

use super::hub::WatchHub;
use super::{DEFAULT_POLL_INTERVAL_SECS, Registry};
use crate::error::{DiscoveryError, Result};
use crate::types::{Health, ServiceEvent, ServiceRecord};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};

#[allow(non_snake_case)]
#[derive(Serialize)]
struct AgentServiceRegistration {
    ID: String,
    Name: String,
    Tags: Vec<String>,
    Address: String,
    Port: u16,
    Meta: HashMap<String, String>,
    Check: AgentCheckRegistration,
}

#[allow(non_snake_case)]
#[derive(Serialize)]
struct AgentCheckRegistration {
    HTTP: String,
    Interval: String,
    Timeout: String,
    DeregisterCriticalServiceAfter: String,
}

#[allow(non_snake_case)]
#[derive(Deserialize)]
struct AgentService {
    ID: String,
    Service: String,
    Address: String,
    Port: u16,
}

#[allow(non_snake_case)]
#[derive(Deserialize)]
struct HealthEntry {
    Service: AgentService,
    Checks: Vec<HealthCheck>,
}

#[allow(non_snake_case)]
#[derive(Deserialize)]
struct HealthCheck {
    Status: String,
}

struct Backend {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
}

impl Backend {
    fn consul_name(&self, service_name: &str) -> String {
        format!("{}-{}", self.namespace, service_name)
    }

    fn kv_key(&self, id: &str) -> String {
        format!("{}/records/{}", self.namespace, id)
    }

    /// 从旁路 KV 读取完整记录（不存在时返回 None）
    async fn fetch_kv_record(&self, id: &str) -> Result<Option<ServiceRecord>> {
        let url = format!("{}/v1/kv/{}?raw", self.base_url, self.kv_key(id));
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("kv_get", format!("consul {}: {}", id, e)))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| DiscoveryError::backend("kv_get", format!("consul {}: {}", id, e)))?;
        Ok(serde_json::from_slice(&bytes).ok())
    }

    async fn put_kv_record(&self, record: &ServiceRecord) -> Result<()> {
        let url = format!("{}/v1/kv/{}", self.base_url, self.kv_key(&record.id));
        let body = serde_json::to_vec(record).map_err(|e| {
            DiscoveryError::backend("kv_put", format!("serialize record {}: {}", record.id, e))
        })?;
        self.http
            .put(&url)
            .body(body)
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("kv_put", format!("consul {}: {}", record.id, e)))?
            .error_for_status()
            .map_err(|e| DiscoveryError::backend("kv_put", format!("consul {}: {}", record.id, e)))?;
        Ok(())
    }

    /// 枚举本命名空间的全部服务实例，健康状态取自 Consul 检查结果，
    /// 扩展字段从旁路 KV 合并
    async fn fetch_all(&self) -> Result<Vec<ServiceRecord>> {
        let url = format!("{}/v1/catalog/services", self.base_url);
        let catalog: HashMap<String, Vec<String>> = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("list_services", format!("consul catalog: {}", e)))?
            .json()
            .await
            .map_err(|e| DiscoveryError::backend("list_services", format!("consul catalog: {}", e)))?;

        let prefix = format!("{}-", self.namespace);
        let mut records = Vec::new();
        for consul_name in catalog.keys().filter(|n| n.starts_with(&prefix)) {
            let url = format!("{}/v1/health/service/{}", self.base_url, consul_name);
            let entries: Vec<HealthEntry> = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| {
                    DiscoveryError::backend("list_services", format!("consul health {}: {}", consul_name, e))
                })?
                .json()
                .await
                .map_err(|e| {
                    DiscoveryError::backend("list_services", format!("consul health {}: {}", consul_name, e))
                })?;

            for entry in entries {
                let healthy = entry.Checks.iter().all(|c| c.Status == "passing");
                let health = if healthy {
                    Health::Healthy
                } else {
                    Health::Unhealthy
                };
                let record = match self.fetch_kv_record(&entry.Service.ID).await? {
                    Some(mut record) => {
                        record.health = health;
                        record
                    }
                    None => {
                        // 无旁路记录（非本库注册的实例），从原生字段重建
                        let name = consul_name
                            .strip_prefix(&prefix)
                            .unwrap_or(&entry.Service.Service)
                            .to_string();
                        ServiceRecord::new(name, entry.Service.Address, entry.Service.Port)
                            .with_id(entry.Service.ID)
                            .with_health(health)
                    }
                };
                records.push(record);
            }
        }
        Ok(records)
    }
}

/// Consul 服务注册发现
pub struct ConsulRegistry {
    backend: Arc<Backend>,
    default_ttl: u64,
    hub: Arc<WatchHub>,
    poll_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ConsulRegistry {
    pub fn new(base_url: String, namespace: String, ttl: u64) -> Result<Self> {
        Ok(Self {
            backend: Arc::new(Backend {
                http: reqwest::Client::new(),
                base_url,
                namespace,
            }),
            default_ttl: if ttl == 0 {
                crate::types::DEFAULT_TTL_SECS
            } else {
                ttl
            },
            hub: Arc::new(WatchHub::new()),
            poll_handle: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DiscoveryError::Closed)
        } else {
            Ok(())
        }
    }

    /// 启动轮询任务（惰性，首个 watcher 触发）：周期性重新拉取并与上一快照比对
    async fn ensure_poll_task(&self) {
        let mut guard = self.poll_handle.lock().await;
        if guard.is_some() {
            return;
        }

        let backend = self.backend.clone();
        let hub = self.hub.clone();

        let handle = tokio::spawn(async move {
            let mut snapshot: HashMap<String, ServiceRecord> = HashMap::new();
            let mut ticker =
                tokio::time::interval(Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS));
            loop {
                ticker.tick().await;

                let current = match backend.fetch_all().await {
                    Ok(records) => records,
                    Err(e) => {
                        warn!(error = %e, "Failed to poll consul services");
                        continue;
                    }
                };
                let current: HashMap<String, ServiceRecord> =
                    current.into_iter().map(|r| (r.id.clone(), r)).collect();

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
            }
        });

        *guard = Some(handle);
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
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

        let url = format!("{}/v1/agent/service/{}", self.backend.base_url, record.id);
        let existing = self
            .backend
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("register", format!("consul: {}", e)))?;
        if existing.status().is_success() {
            return Err(DiscoveryError::backend(
                "register",
                format!("service already registered: {}", record.id),
            ));
        }

        let registration = AgentServiceRegistration {
            ID: record.id.clone(),
            Name: self.backend.consul_name(&record.name),
            Tags: record.tags.clone(),
            Address: record.address.clone(),
            Port: record.port,
            Meta: record.metadata.clone(),
            Check: AgentCheckRegistration {
                HTTP: format!("http://{}:{}/health", record.address, record.port),
                Interval: format!("{}s", (record.ttl_secs / 3).max(1)),
                Timeout: "5s".to_string(),
                DeregisterCriticalServiceAfter: format!("{}s", record.ttl_secs),
            },
        };

        let url = format!("{}/v1/agent/service/register", self.backend.base_url);
        self.backend
            .http
            .put(&url)
            .json(&registration)
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("register", format!("consul: {}", e)))?
            .error_for_status()
            .map_err(|e| DiscoveryError::backend("register", format!("consul: {}", e)))?;

        self.backend.put_kv_record(&record).await?;

        info!(
            instance_id = %record.id,
            service = %record.name,
            address = %record.address,
            port = record.port,
            "Service registered with Consul"
        );
        Ok(record)
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.check_open()?;

        let url = format!("{}/v1/agent/service/{}", self.backend.base_url, id);
        let existing = self
            .backend
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("deregister", format!("consul: {}", e)))?;
        if !existing.status().is_success() {
            return Err(DiscoveryError::not_found(id));
        }

        let url = format!("{}/v1/agent/service/deregister/{}", self.backend.base_url, id);
        self.backend
            .http
            .put(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("deregister", format!("consul: {}", e)))?
            .error_for_status()
            .map_err(|e| DiscoveryError::backend("deregister", format!("consul: {}", e)))?;

        // 旁路 KV 清理为尽力而为：失败不影响主注销结果
        let url = format!("{}/v1/kv/{}", self.backend.base_url, self.backend.kv_key(id));
        if let Err(e) = self.backend.http.delete(&url).send().await {
            warn!(instance_id = %id, error = %e, "Failed to delete KV record, continuing");
        }

        info!(instance_id = %id, "Service deregistered from Consul");
        Ok(())
    }

    async fn update(&self, mut record: ServiceRecord) -> Result<ServiceRecord> {
        self.check_open()?;

        let url = format!("{}/v1/agent/service/{}", self.backend.base_url, record.id);
        let existing = self
            .backend
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("update", format!("consul: {}", e)))?;
        if !existing.status().is_success() {
            return Err(DiscoveryError::not_found(&record.id));
        }

        let created_at = self
            .backend
            .fetch_kv_record(&record.id)
            .await?
            .map(|r| r.created_at)
            .unwrap_or(record.created_at);
        record.stamp_updated(created_at);

        let registration = AgentServiceRegistration {
            ID: record.id.clone(),
            Name: self.backend.consul_name(&record.name),
            Tags: record.tags.clone(),
            Address: record.address.clone(),
            Port: record.port,
            Meta: record.metadata.clone(),
            Check: AgentCheckRegistration {
                HTTP: format!("http://{}:{}/health", record.address, record.port),
                Interval: format!("{}s", (record.ttl_secs / 3).max(1)),
                Timeout: "5s".to_string(),
                DeregisterCriticalServiceAfter: format!("{}s", record.ttl_secs),
            },
        };
        let url = format!("{}/v1/agent/service/register", self.backend.base_url);
        self.backend
            .http
            .put(&url)
            .json(&registration)
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("update", format!("consul: {}", e)))?
            .error_for_status()
            .map_err(|e| DiscoveryError::backend("update", format!("consul: {}", e)))?;

        self.backend.put_kv_record(&record).await?;
        Ok(record)
    }

    async fn get_service(&self, id: &str) -> Result<ServiceRecord> {
        self.check_open()?;

        let url = format!("{}/v1/agent/service/{}", self.backend.base_url, id);
        let resp = self
            .backend
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("get_service", format!("consul: {}", e)))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DiscoveryError::not_found(id));
        }
        let native: AgentService = resp
            .json()
            .await
            .map_err(|e| DiscoveryError::backend("get_service", format!("consul: {}", e)))?;

        match self.backend.fetch_kv_record(id).await? {
            Some(record) => Ok(record),
            None => {
                let prefix = format!("{}-", self.backend.namespace);
                let name = native
                    .Service
                    .strip_prefix(&prefix)
                    .unwrap_or(&native.Service)
                    .to_string();
                Ok(ServiceRecord::new(name, native.Address, native.Port)
                    .with_id(native.ID)
                    .with_health(Health::Unknown))
            }
        }
    }

    async fn list_services(&self) -> Result<Vec<ServiceRecord>> {
        self.check_open()?;
        self.backend.fetch_all().await
    }

    async fn watch(&self) -> Result<mpsc::Receiver<ServiceEvent>> {
        self.check_open()?;
        self.ensure_poll_task().await;
        Ok(self.hub.subscribe().await)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.abort();
        }
        self.hub.clear().await;
        info!("Consul registry closed");
        Ok(())
    }
}

impl Drop for ConsulRegistry {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.poll_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
