//! Nacos 服务注册发现实现
//!
//! 通过 Nacos v1 开放 HTTP API 以 ephemeral 实例注册，心跳任务按 TTL/3
//! 维持实例存活。Nacos 原生实例记录承载不了全部扩展字段，完整字段打包进
//! 实例 metadata（tags 做 JSON 序列化），读取时解包还原。
//! Watch 为轮询模拟（默认 5s）。

use super::hub::WatchHub;
use super::{DEFAULT_POLL_INTERVAL_SECS, Registry};
use crate::error::{DiscoveryError, Result};
use crate::types::{Health, Protocol, ServiceEvent, ServiceRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

/// 打包进实例 metadata 的扩展字段键
const META_ID: &str = "flare.id";
const META_VERSION: &str = "flare.version";
const META_PROTOCOL: &str = "flare.protocol";
const META_TAGS: &str = "flare.tags";
const META_CREATED_AT: &str = "flare.created-at";
const META_UPDATED_AT: &str = "flare.updated-at";
const META_LAST_CHECK: &str = "flare.last-check";
const META_TTL: &str = "flare.ttl";

/// 服务列表分页大小，服务数超过一页时继续翻页
const SERVICE_PAGE_SIZE: usize = 1024;

#[derive(Deserialize)]
struct ServiceListResponse {
    #[serde(default)]
    doms: Vec<String>,
}

#[derive(Deserialize)]
struct InstanceListResponse {
    #[serde(default)]
    hosts: Vec<NacosInstance>,
}

#[derive(Deserialize)]
struct NacosInstance {
    ip: String,
    port: u16,
    healthy: bool,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

struct Backend {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
}

impl Backend {
    /// 记录 → Nacos 实例 metadata（扩展字段打包，tags JSON 序列化）
    fn pack_metadata(record: &ServiceRecord) -> HashMap<String, String> {
        let mut meta = record.metadata.clone();
        meta.insert(META_ID.to_string(), record.id.clone());
        meta.insert(META_VERSION.to_string(), record.version.clone());
        meta.insert(
            META_PROTOCOL.to_string(),
            match record.protocol {
                Protocol::Http => "http".to_string(),
                Protocol::Grpc => "grpc".to_string(),
            },
        );
        meta.insert(
            META_TAGS.to_string(),
            serde_json::to_string(&record.tags).unwrap_or_else(|_| "[]".to_string()),
        );
        meta.insert(META_CREATED_AT.to_string(), record.created_at.to_rfc3339());
        meta.insert(META_UPDATED_AT.to_string(), record.updated_at.to_rfc3339());
        meta.insert(META_LAST_CHECK.to_string(), record.last_check.to_rfc3339());
        meta.insert(META_TTL.to_string(), record.ttl_secs.to_string());
        meta
    }

    /// Nacos 实例 → 记录（解包扩展字段，缺失时从原生字段重建）
    fn unpack_instance(service_name: &str, instance: NacosInstance) -> ServiceRecord {
        let mut meta = instance.metadata;
        let parse_time = |value: Option<String>| {
            value
                .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(Utc::now)
        };

        let id = meta
            .remove(META_ID)
            .unwrap_or_else(|| format!("{}-{}-{}", service_name, instance.ip, instance.port));
        let version = meta.remove(META_VERSION).unwrap_or_else(|| "v1.0.0".to_string());
        let protocol = match meta.remove(META_PROTOCOL).as_deref() {
            Some("grpc") => Protocol::Grpc,
            _ => Protocol::Http,
        };
        let tags: Vec<String> = meta
            .remove(META_TAGS)
            .and_then(|v| serde_json::from_str(&v).ok())
            .unwrap_or_default();
        let created_at = parse_time(meta.remove(META_CREATED_AT));
        let updated_at = parse_time(meta.remove(META_UPDATED_AT));
        let last_check = parse_time(meta.remove(META_LAST_CHECK));
        let ttl_secs = meta
            .remove(META_TTL)
            .and_then(|v| v.parse().ok())
            .unwrap_or(crate::types::DEFAULT_TTL_SECS);

        ServiceRecord {
            id,
            name: service_name.to_string(),
            version,
            address: instance.ip,
            port: instance.port,
            protocol,
            health: if instance.healthy {
                Health::Healthy
            } else {
                Health::Unhealthy
            },
            metadata: meta,
            tags,
            created_at,
            updated_at,
            last_check,
            ttl_secs,
        }
    }

    /// 枚举本命名空间的全部服务实例
    async fn fetch_all(&self) -> Result<Vec<ServiceRecord>> {
        let url = format!("{}/nacos/v1/ns/service/list", self.base_url);
        let page_size = SERVICE_PAGE_SIZE.to_string();
        let mut service_names = Vec::new();
        let mut page_no = 1usize;
        loop {
            let page_no_str = page_no.to_string();
            let page: ServiceListResponse = self
                .http
                .get(&url)
                .query(&[
                    ("pageNo", page_no_str.as_str()),
                    ("pageSize", page_size.as_str()),
                    ("namespaceId", self.namespace.as_str()),
                ])
                .send()
                .await
                .map_err(|e| DiscoveryError::backend("list_services", format!("nacos: {}", e)))?
                .json()
                .await
                .map_err(|e| DiscoveryError::backend("list_services", format!("nacos: {}", e)))?;

            let count = page.doms.len();
            service_names.extend(page.doms);
            if count < SERVICE_PAGE_SIZE {
                break;
            }
            page_no += 1;
        }

        let mut records = Vec::new();
        for service_name in &service_names {
            let url = format!("{}/nacos/v1/ns/instance/list", self.base_url);
            let instances: InstanceListResponse = self
                .http
                .get(&url)
                .query(&[
                    ("serviceName", service_name.as_str()),
                    ("namespaceId", self.namespace.as_str()),
                ])
                .send()
                .await
                .map_err(|e| {
                    DiscoveryError::backend("list_services", format!("nacos {}: {}", service_name, e))
                })?
                .json()
                .await
                .map_err(|e| {
                    DiscoveryError::backend("list_services", format!("nacos {}: {}", service_name, e))
                })?;

            for instance in instances.hosts {
                records.push(Self::unpack_instance(service_name, instance));
            }
        }
        Ok(records)
    }

    async fn register_instance(&self, record: &ServiceRecord) -> Result<()> {
        let metadata = serde_json::to_string(&Self::pack_metadata(record)).map_err(|e| {
            DiscoveryError::backend("register", format!("serialize metadata: {}", e))
        })?;

        let port = record.port.to_string();
        let url = format!("{}/nacos/v1/ns/instance", self.base_url);
        self.http
            .post(&url)
            .query(&[
                ("serviceName", record.name.as_str()),
                ("ip", record.address.as_str()),
                ("port", port.as_str()),
                ("namespaceId", self.namespace.as_str()),
                ("ephemeral", "true"),
                ("healthy", "true"),
                ("metadata", metadata.as_str()),
            ])
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("register", format!("nacos: {}", e)))?
            .error_for_status()
            .map_err(|e| DiscoveryError::backend("register", format!("nacos: {}", e)))?;
        Ok(())
    }

    async fn send_beat(&self, name: &str, ip: &str, port: u16) -> Result<()> {
        let beat = json!({ "ip": ip, "port": port, "serviceName": name }).to_string();
        let url = format!("{}/nacos/v1/ns/instance/beat", self.base_url);
        self.http
            .put(&url)
            .query(&[
                ("serviceName", name),
                ("namespaceId", self.namespace.as_str()),
                ("beat", beat.as_str()),
            ])
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("beat", format!("nacos: {}", e)))?
            .error_for_status()
            .map_err(|e| DiscoveryError::backend("beat", format!("nacos: {}", e)))?;
        Ok(())
    }
}

struct Registration {
    name: String,
    ip: String,
    port: u16,
    beat: tokio::task::JoinHandle<()>,
}

/// Nacos 服务注册发现
pub struct NacosRegistry {
    backend: Arc<Backend>,
    default_ttl: u64,
    registrations: Mutex<HashMap<String, Registration>>,
    hub: Arc<WatchHub>,
    poll_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl NacosRegistry {
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
            registrations: Mutex::new(HashMap::new()),
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

    /// 启动心跳任务，维持 ephemeral 实例存活
    fn start_beat(&self, record: &ServiceRecord) -> tokio::task::JoinHandle<()> {
        let backend = self.backend.clone();
        let name = record.name.clone();
        let ip = record.address.clone();
        let port = record.port;
        let interval = Duration::from_secs((record.ttl_secs / 3).max(1));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match backend.send_beat(&name, &ip, port).await {
                    Ok(()) => debug!(service = %name, ip = %ip, port, "Heartbeat sent"),
                    Err(e) => error!(service = %name, ip = %ip, port, error = %e, "Failed to send heartbeat"),
                }
            }
        })
    }

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
                        warn!(error = %e, "Failed to poll nacos services");
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
impl Registry for NacosRegistry {
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

        let mut registrations = self.registrations.lock().await;
        if registrations.contains_key(&record.id) {
            return Err(DiscoveryError::backend(
                "register",
                format!("service already registered: {}", record.id),
            ));
        }

        self.backend.register_instance(&record).await?;
        let beat = self.start_beat(&record);
        registrations.insert(
            record.id.clone(),
            Registration {
                name: record.name.clone(),
                ip: record.address.clone(),
                port: record.port,
                beat,
            },
        );

        info!(
            instance_id = %record.id,
            service = %record.name,
            address = %record.address,
            port = record.port,
            "Service registered with Nacos"
        );
        Ok(record)
    }

    async fn deregister(&self, id: &str) -> Result<()> {
        self.check_open()?;

        let (name, ip, port) = match self.registrations.lock().await.remove(id) {
            Some(registration) => {
                registration.beat.abort();
                (registration.name, registration.ip, registration.port)
            }
            None => {
                // 非本实例注册的记录：全量扫描定位
                let record = self
                    .backend
                    .fetch_all()
                    .await?
                    .into_iter()
                    .find(|r| r.id == id)
                    .ok_or_else(|| DiscoveryError::not_found(id))?;
                (record.name, record.address, record.port)
            }
        };

        let port = port.to_string();
        let url = format!("{}/nacos/v1/ns/instance", self.backend.base_url);
        self.backend
            .http
            .delete(&url)
            .query(&[
                ("serviceName", name.as_str()),
                ("ip", ip.as_str()),
                ("port", port.as_str()),
                ("namespaceId", self.backend.namespace.as_str()),
                ("ephemeral", "true"),
            ])
            .send()
            .await
            .map_err(|e| DiscoveryError::backend("deregister", format!("nacos: {}", e)))?
            .error_for_status()
            .map_err(|e| DiscoveryError::backend("deregister", format!("nacos: {}", e)))?;

        info!(instance_id = %id, service = %name, "Service deregistered from Nacos");
        Ok(())
    }

    async fn update(&self, mut record: ServiceRecord) -> Result<ServiceRecord> {
        self.check_open()?;

        let current = self
            .backend
            .fetch_all()
            .await?
            .into_iter()
            .find(|r| r.id == record.id)
            .ok_or_else(|| DiscoveryError::not_found(&record.id))?;
        record.stamp_updated(current.created_at);

        // Nacos 的注册接口按 (serviceName, ip, port) 幂等，重复注册即更新 metadata
        self.backend.register_instance(&record).await?;
        Ok(record)
    }

    async fn get_service(&self, id: &str) -> Result<ServiceRecord> {
        self.check_open()?;
        self.backend
            .fetch_all()
            .await?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| DiscoveryError::not_found(id))
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
        for (_, registration) in self.registrations.lock().await.drain() {
            registration.beat.abort();
        }
        if let Some(handle) = self.poll_handle.lock().await.take() {
            handle.abort();
        }
        self.hub.clear().await;
        info!("Nacos registry closed");
        Ok(())
    }
}

impl Drop for NacosRegistry {
    fn drop(&mut self) {
        if let Ok(mut registrations) = self.registrations.try_lock() {
            for (_, registration) in registrations.drain() {
                registration.beat.abort();
            }
        }
        if let Ok(mut guard) = self.poll_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_pack_unpack() {
        let record = ServiceRecord::new("user-service", "10.0.0.5", 8848)
            .with_id("node-1")
            .with_version("v2.0.0")
            .with_protocol(Protocol::Grpc)
            .with_tag("canary")
            .with_tag("edge")
            .with_metadata("zone", "cn-beijing-a");

        let packed = Backend::pack_metadata(&record);
        assert_eq!(packed.get(META_ID).unwrap(), "node-1");
        assert_eq!(packed.get(META_TAGS).unwrap(), r#"["canary","edge"]"#);

        let instance = NacosInstance {
            ip: "10.0.0.5".to_string(),
            port: 8848,
            healthy: true,
            metadata: packed,
        };
        let unpacked = Backend::unpack_instance("user-service", instance);
        assert_eq!(unpacked.id, "node-1");
        assert_eq!(unpacked.version, "v2.0.0");
        assert_eq!(unpacked.protocol, Protocol::Grpc);
        assert_eq!(unpacked.tags, vec!["canary", "edge"]);
        assert_eq!(unpacked.metadata.get("zone").unwrap(), "cn-beijing-a");
        assert_eq!(unpacked.health, Health::Healthy);
    }
}
