//! watcher 扇出
//!
//! 各后端共享的订阅簿记：有界通道、非阻塞投递、惰性清理已断开的订阅者。

use super::WATCH_CHANNEL_CAPACITY;
use crate::types::ServiceEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{RwLock, mpsc};
use tracing::debug;

/// watcher 集合
///
/// 通道满时事件被丢弃（至多一次投递，不重放）。从 map 中移除条目即丢弃
/// 发送端，保证每个通道恰好关闭一次。
pub(crate) struct WatchHub {
    watchers: RwLock<HashMap<u64, mpsc::Sender<ServiceEvent>>>,
    next_id: AtomicU64,
}

impl WatchHub {
    pub(crate) fn new() -> Self {
        Self {
            watchers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// 新建订阅，返回接收端
    pub(crate) async fn subscribe(&self) -> mpsc::Receiver<ServiceEvent> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.watchers.write().await.insert(id, tx);
        rx
    }

    /// 向所有订阅者投递事件
    pub(crate) async fn emit(&self, event: ServiceEvent) {
        let mut dead = Vec::new();
        {
            let watchers = self.watchers.read().await;
            for (id, tx) in watchers.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(watcher_id = id, "Watcher channel full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        dead.push(*id);
                    }
                }
            }
        }
        if !dead.is_empty() {
            let mut watchers = self.watchers.write().await;
            for id in dead {
                watchers.remove(&id);
            }
        }
    }

    /// 关闭所有订阅
    pub(crate) async fn clear(&self) {
        self.watchers.write().await.clear();
    }
}
