//! 服务记录与事件定义
//!
//! 所有注册发现后端共享的值类型，JSON 序列化后作为
//! etcd value / Consul KV / Nacos metadata / Zookeeper 节点数据存储。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 默认 TTL（秒）
pub const DEFAULT_TTL_SECS: u64 = 30;

/// 传输协议
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// HTTP 请求/响应
    Http,
    /// gRPC 流式 RPC
    Grpc,
}

/// 健康状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
    Unknown,
}

/// 服务记录
///
/// 一个已注册服务实例的地址/元数据/健康状态快照。
/// `id` 在单个注册中心实例内唯一，`name` 将同一逻辑服务的多个实例分组。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceRecord {
    /// 实例 ID（唯一标识）
    pub id: String,

    /// 服务名（同一逻辑服务的实例共享，不允许为空）
    pub name: String,

    /// 版本
    pub version: String,

    /// 服务地址
    pub address: String,

    /// 服务端口
    pub port: u16,

    /// 传输协议
    pub protocol: Protocol,

    /// 健康状态
    pub health: Health,

    /// 元数据
    pub metadata: HashMap<String, String>,

    /// 标签（有序）
    pub tags: Vec<String>,

    /// 创建时间（注册时固定，此后不变）
    pub created_at: DateTime<Utc>,

    /// 更新时间（每次 update 推进）
    pub updated_at: DateTime<Utc>,

    /// 最近一次健康检查时间
    pub last_check: DateTime<Utc>,

    /// 存活预算（秒），超过未刷新即视为过期
    pub ttl_secs: u64,
}

impl ServiceRecord {
    /// 创建新的服务记录
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            version: "v1.0.0".to_string(),
            address: address.into(),
            port,
            protocol: Protocol::Http,
            health: Health::Healthy,
            metadata: HashMap::new(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
            last_check: now,
            ttl_secs: DEFAULT_TTL_SECS,
        }
    }

    /// 设置实例 ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// 设置版本
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// 设置传输协议
    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// 添加元数据
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 添加标签
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// 设置 TTL（秒）
    pub fn with_ttl(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// 设置健康状态
    pub fn with_health(mut self, health: Health) -> Self {
        self.health = health;
        self
    }

    /// 转换为 HTTP URL
    pub fn http_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    /// 转换为 gRPC URI
    pub fn grpc_uri(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    /// 是否健康
    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }

    /// 注册时打时间戳：created_at 固定，updated_at/last_check 置为当前时间，
    /// TTL 为 0 时应用默认值
    pub(crate) fn stamp_registered(&mut self) {
        let now = Utc::now();
        self.created_at = now;
        self.updated_at = now;
        self.last_check = now;
        if self.ttl_secs == 0 {
            self.ttl_secs = DEFAULT_TTL_SECS;
        }
    }

    /// 更新时打时间戳：保留原 created_at，推进 updated_at/last_check
    pub(crate) fn stamp_updated(&mut self, created_at: DateTime<Utc>) {
        let now = Utc::now();
        self.created_at = created_at;
        self.updated_at = now;
        self.last_check = now;
    }
}

/// 服务事件类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

/// 服务事件
///
/// 注册中心在每次变更操作时产生，由零个或多个 watcher 消费。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub event_type: EventType,
    pub record: ServiceRecord,
}

impl ServiceEvent {
    pub fn created(record: ServiceRecord) -> Self {
        Self {
            event_type: EventType::Created,
            record,
        }
    }

    pub fn updated(record: ServiceRecord) -> Self {
        Self {
            event_type: EventType::Updated,
            record,
        }
    }

    pub fn deleted(record: ServiceRecord) -> Self {
        Self {
            event_type: EventType::Deleted,
            record,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_defaults() {
        let record = ServiceRecord::new("user-service", "127.0.0.1", 8080);
        assert!(!record.id.is_empty());
        assert_eq!(record.name, "user-service");
        assert_eq!(record.ttl_secs, DEFAULT_TTL_SECS);
        assert_eq!(record.health, Health::Healthy);
        assert_eq!(record.http_url(), "http://127.0.0.1:8080");
    }

    #[test]
    fn test_record_roundtrip() {
        let record = ServiceRecord::new("user-service", "10.0.0.3", 9000)
            .with_version("v2.1.0")
            .with_protocol(Protocol::Grpc)
            .with_tag("canary")
            .with_metadata("zone", "us-east-1a");
        let json = serde_json::to_string(&record).unwrap();
        let parsed: ServiceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }
}
