//! Flare Service Discovery Library
//!
//! Provides a unified service registry contract over memory, etcd, Consul,
//! Nacos and Zookeeper backends, with cached discovery, load balancing,
//! health checking, circuit breaking and a unified calling client.

pub mod breaker;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod registry;
pub mod retry;
pub mod types;

// Re-exports
pub use breaker::CircuitBreaker;
pub use client::{
    Client, GrpcTransport, HttpTransport, Transport, TransportRequest, TransportResponse,
};
pub use config::{
    BreakerConfig, ClientConfig, Config, HealthCheckConfig, RegistryConfig, RetryBackoff,
};
pub use discovery::Discovery;
pub use error::{DiscoveryError, Result};
pub use health::{GrpcHealthChecker, HealthChecker, HttpHealthChecker};
pub use registry::{
    ConsulRegistry, EtcdRegistry, LoadBalanceStrategy, LoadBalancer, MemoryRegistry,
    NacosRegistry, RandomBalancer, Registry, RegistryBuilder, RegistryType, RoundRobinBalancer,
    ZookeeperRegistry, create_registry,
};
pub use retry::{ExponentialBackoffPolicy, FixedRetryPolicy, RetryPolicy};
pub use types::{
    DEFAULT_TTL_SECS, EventType, Health, Protocol, ServiceEvent, ServiceRecord,
};
