//! 负载均衡模块
//!
//! 提供多种负载均衡策略，用于从多个服务实例中选择一个。
//! 所有策略只在健康实例中选择，候选为空或全部不健康时不选。

use crate::types::ServiceRecord;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};

/// 负载均衡策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// 轮询（Round Robin）
    RoundRobin,
    /// 随机（Random）
    Random,
}

impl Default for LoadBalanceStrategy {
    fn default() -> Self {
        LoadBalanceStrategy::RoundRobin
    }
}

impl std::str::FromStr for LoadBalanceStrategy {
    type Err = crate::error::DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" | "roundrobin" => Ok(LoadBalanceStrategy::RoundRobin),
            "random" => Ok(LoadBalanceStrategy::Random),
            other => Err(crate::error::DiscoveryError::Configuration(format!(
                "unknown load balance strategy: {}",
                other
            ))),
        }
    }
}

impl LoadBalanceStrategy {
    /// 策略 → 均衡器实例
    pub fn into_balancer(self) -> Box<dyn LoadBalancer> {
        match self {
            LoadBalanceStrategy::RoundRobin => Box::new(RoundRobinBalancer::new()),
            LoadBalanceStrategy::Random => Box::new(RandomBalancer),
        }
    }
}

/// 负载均衡器
///
/// 候选集由调用方按服务名查好后传入，均衡器只负责选择。
pub trait LoadBalancer: Send + Sync {
    fn select(&self, candidates: &[ServiceRecord]) -> Option<ServiceRecord>;
}

/// 只在健康实例中选择，没有健康实例时不选
fn healthy_only(candidates: &[ServiceRecord]) -> Vec<&ServiceRecord> {
    candidates.iter().filter(|r| r.is_healthy()).collect()
}

/// 轮询均衡器
///
/// 计数器单调递增且在候选集变化时不重置，同一候选集上连续选择均匀轮转。
pub struct RoundRobinBalancer {
    index: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self {
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(&self, candidates: &[ServiceRecord]) -> Option<ServiceRecord> {
        let pool = healthy_only(candidates);
        if pool.is_empty() {
            return None;
        }
        let index = self.index.fetch_add(1, Ordering::Relaxed);
        pool.get(index % pool.len()).map(|r| (*r).clone())
    }
}

/// 随机均衡器
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn select(&self, candidates: &[ServiceRecord]) -> Option<ServiceRecord> {
        use std::collections::hash_map::DefaultHasher;
        use std::time::{SystemTime, UNIX_EPOCH};

        let pool = healthy_only(candidates);
        if pool.is_empty() {
            return None;
        }

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        let hash = hasher.finish();

        pool.get((hash as usize) % pool.len()).map(|r| (*r).clone())
    }
}
