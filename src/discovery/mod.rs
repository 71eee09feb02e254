//! 服务发现模块
//!
//! 在注册中心之上维护按服务名组织的本地缓存：首次查询某服务名时懒加载，
//! 之后由转发任务消费注册中心事件流做增量维护，并把事件按名字分发给订阅方。
//! 并发的首次未命中会各自回源，属已知代价，不做去重。

use crate::error::{DiscoveryError, Result};
use crate::registry::{LoadBalanceStrategy, LoadBalancer, Registry, WATCH_CHANNEL_CAPACITY};
use crate::types::{EventType, ServiceEvent, ServiceRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::{debug, info, warn};

struct Shared {
    /// 服务名 → 实例列表，仅缓存查询过的名字
    cache: RwLock<HashMap<String, Vec<ServiceRecord>>>,
    /// 订阅者：id → (关注的服务名, 发送端)
    subscribers: RwLock<HashMap<u64, (String, mpsc::Sender<ServiceEvent>)>>,
    next_subscriber_id: AtomicU64,
    closed: AtomicBool,
}

impl Shared {
    /// 增量维护缓存：只动已缓存的服务名，未查询过的名字留给懒加载
    async fn apply_event(&self, event: &ServiceEvent) {
        let mut cache = self.cache.write().await;
        let Some(records) = cache.get_mut(&event.record.name) else {
            return;
        };
        match event.event_type {
            EventType::Created | EventType::Updated => {
                match records.iter_mut().find(|r| r.id == event.record.id) {
                    Some(existing) => *existing = event.record.clone(),
                    None => records.push(event.record.clone()),
                }
            }
            EventType::Deleted => {
                records.retain(|r| r.id != event.record.id);
            }
        }
    }

    /// 按服务名分发事件，通道满时丢弃，发送端已关闭的订阅者被移除
    async fn fan_out(&self, event: &ServiceEvent) {
        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, (name, tx)) in subscribers.iter() {
                if *name != event.record.name {
                    continue;
                }
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(
                            subscriber = id,
                            service = %event.record.name,
                            "Subscriber channel full, event dropped"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*id),
                }
            }
        }
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
            }
        }
    }
}

/// 服务发现
///
/// 关闭只终止本层的缓存与订阅，不关闭底层注册中心。
pub struct Discovery {
    registry: Arc<dyn Registry>,
    balancer: Box<dyn LoadBalancer>,
    shared: Arc<Shared>,
    forward_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self::with_strategy(registry, LoadBalanceStrategy::default())
    }

    pub fn with_strategy(registry: Arc<dyn Registry>, strategy: LoadBalanceStrategy) -> Self {
        Self {
            registry,
            balancer: strategy.into_balancer(),
            shared: Arc::new(Shared {
                cache: RwLock::new(HashMap::new()),
                subscribers: RwLock::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
            }),
            forward_handle: Mutex::new(None),
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            Err(DiscoveryError::Closed)
        } else {
            Ok(())
        }
    }

    /// 懒启动转发任务：消费注册中心事件流，维护缓存并分发给订阅者
    async fn ensure_forward_task(&self) -> Result<()> {
        let mut guard = self.forward_handle.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let mut events = self.registry.watch().await?;
        let shared = self.shared.clone();

        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                shared.apply_event(&event).await;
                shared.fan_out(&event).await;
            }
            // 注册中心关闭了事件流，缓存从此不再新鲜
            warn!("Registry event stream closed, discovery cache is no longer maintained");
        });

        *guard = Some(handle);
        Ok(())
    }

    /// 查询服务实例列表
    ///
    /// 缓存命中直接返回快照，未命中回源注册中心并填充缓存。
    pub async fn discover(&self, name: &str) -> Result<Vec<ServiceRecord>> {
        self.check_open()?;
        self.ensure_forward_task().await?;

        if let Some(records) = self.shared.cache.read().await.get(name) {
            return Ok(records.clone());
        }

        let records: Vec<ServiceRecord> = self
            .registry
            .list_services()
            .await?
            .into_iter()
            .filter(|r| r.name == name)
            .collect();

        debug!(service = %name, count = records.len(), "Discovery cache filled");
        self.shared
            .cache
            .write()
            .await
            .insert(name.to_string(), records.clone());
        Ok(records)
    }

    /// 查询并选择一个服务实例
    ///
    /// 没有任何实例时返回 Unavailable。
    pub async fn discover_one(&self, name: &str) -> Result<ServiceRecord> {
        let records = self.discover(name).await?;
        self.balancer
            .select(&records)
            .ok_or_else(|| DiscoveryError::unavailable(name))
    }

    /// 订阅某个服务名的事件
    ///
    /// 返回有界通道，满时事件被丢弃。通道在发现层关闭时关闭。
    pub async fn watch(&self, name: &str) -> Result<mpsc::Receiver<ServiceEvent>> {
        self.check_open()?;
        self.ensure_forward_task().await?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let id = self.shared.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.shared
            .subscribers
            .write()
            .await
            .insert(id, (name.to_string(), tx));
        Ok(rx)
    }

    /// 关闭发现层
    ///
    /// 幂等。终止转发任务，关闭所有订阅通道并清空缓存，注册中心保持可用。
    pub async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.forward_handle.lock().await.take() {
            handle.abort();
        }
        self.shared.subscribers.write().await.clear();
        self.shared.cache.write().await.clear();
        info!("Discovery closed");
        Ok(())
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.forward_handle.try_lock() {
            if let Some(handle) = guard.take() {
                handle.abort();
            }
        }
    }
}
