//! 熔断器模块
//!
//! 按依赖维护三态熔断：Closed 计数失败，达到阈值进入 Open 快速拒绝，
//! 超时后放行单个半开探测，探测结果决定恢复或再次熔断。
//! 状态迁移在 `std::sync::Mutex` 下串行，锁从不跨 await 持有。

use crate::config::BreakerConfig;
use crate::error::{DiscoveryError, Result};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 默认失败阈值
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// 默认熔断时长
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy)]
enum State {
    Closed { failures: u32 },
    Open { opened_at: Instant },
    HalfOpen,
}

/// 熔断器
///
/// 每个受保护的服务一个实例。操作通过 [`execute`](Self::execute) 进入，
/// 熔断期间返回 [`DiscoveryError::CircuitOpen`]，被保护的操作不会被调用。
pub struct CircuitBreaker {
    service: String,
    failure_threshold: u32,
    open_timeout: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>) -> Self {
        Self::with_settings(service, DEFAULT_FAILURE_THRESHOLD, DEFAULT_OPEN_TIMEOUT)
    }

    pub fn with_settings(
        service: impl Into<String>,
        failure_threshold: u32,
        open_timeout: Duration,
    ) -> Self {
        Self {
            service: service.into(),
            failure_threshold: failure_threshold.max(1),
            open_timeout,
            state: Mutex::new(State::Closed { failures: 0 }),
        }
    }

    pub fn from_config(service: impl Into<String>, config: &BreakerConfig) -> Self {
        Self::with_settings(
            service,
            config.failure_threshold,
            Duration::from_secs(config.timeout),
        )
    }

    /// 执行受保护的操作
    ///
    /// Open 状态下超时未到直接拒绝；超时已到的第一个调用方拿到唯一的
    /// 半开探测名额，其余调用方仍被拒绝。探测 future 在出结果前被丢弃
    /// （如调用方超时取消）时名额退回 Open，不会永久占用。
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let probe = self.begin()?;
        let result = op().await;
        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }
        if let Some(probe) = probe {
            probe.complete();
        }
        result
    }

    /// 是否处于熔断（Open）状态
    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Open { .. })
    }

    /// 手动复位到 Closed
    pub fn reset(&self) {
        *self.state.lock().unwrap() = State::Closed { failures: 0 };
    }

    fn begin(&self) -> Result<Option<ProbeGuard<'_>>> {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed { .. } => Ok(None),
            State::Open { opened_at } => {
                if opened_at.elapsed() >= self.open_timeout {
                    // 迁移到半开的调用方即探测者
                    *state = State::HalfOpen;
                    info!(service = %self.service, "Circuit half-open, probing");
                    Ok(Some(ProbeGuard {
                        breaker: self,
                        done: false,
                    }))
                } else {
                    Err(DiscoveryError::CircuitOpen {
                        service: self.service.clone(),
                    })
                }
            }
            State::HalfOpen => Err(DiscoveryError::CircuitOpen {
                service: self.service.clone(),
            }),
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock().unwrap();
        if !matches!(*state, State::Closed { failures: 0 }) {
            if matches!(*state, State::HalfOpen) {
                info!(service = %self.service, "Circuit closed after successful probe");
            }
            *state = State::Closed { failures: 0 };
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock().unwrap();
        match *state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= self.failure_threshold {
                    warn!(
                        service = %self.service,
                        failures,
                        "Failure threshold reached, circuit opened"
                    );
                    *state = State::Open {
                        opened_at: Instant::now(),
                    };
                } else {
                    *state = State::Closed { failures };
                }
            }
            State::HalfOpen => {
                warn!(service = %self.service, "Probe failed, circuit re-opened");
                *state = State::Open {
                    opened_at: Instant::now(),
                };
            }
            State::Open { .. } => {}
        }
    }
}

/// 半开探测名额的持有凭证
///
/// 探测 future 被中途丢弃时（凭证未 `complete` 即 Drop），状态退回
/// Open 并重新计时，名额可被后续调用方再次取得。
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    done: bool,
}

impl ProbeGuard<'_> {
    fn complete(mut self) {
        self.done = true;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        let mut state = self.breaker.state.lock().unwrap();
        if matches!(*state, State::HalfOpen) {
            warn!(
                service = %self.breaker.service,
                "Probe abandoned before completion, circuit re-opened"
            );
            *state = State::Open {
                opened_at: Instant::now(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing() -> impl Future<Output = Result<()>> {
        async { Err(DiscoveryError::backend("call", "boom")) }
    }

    fn succeeding() -> impl Future<Output = Result<()>> {
        async { Ok(()) }
    }

    #[tokio::test]
    async fn test_opens_at_threshold() {
        let breaker = CircuitBreaker::with_settings("svc", 3, Duration::from_secs(30));
        for _ in 0..3 {
            let _ = breaker.execute(failing).await;
        }
        assert!(breaker.is_open());

        // 熔断期间操作不被调用
        let result = breaker.execute(succeeding).await;
        assert!(matches!(result, Err(DiscoveryError::CircuitOpen { .. })));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::with_settings("svc", 3, Duration::from_secs(30));
        let _ = breaker.execute(failing).await;
        let _ = breaker.execute(failing).await;
        breaker.execute(succeeding).await.unwrap();
        let _ = breaker.execute(failing).await;
        let _ = breaker.execute(failing).await;
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_on_success() {
        let breaker = CircuitBreaker::with_settings("svc", 1, Duration::from_millis(20));
        let _ = breaker.execute(failing).await;
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(30)).await;
        breaker.execute(succeeding).await.unwrap();
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn test_half_open_probe_reopens_on_failure() {
        let breaker = CircuitBreaker::with_settings("svc", 1, Duration::from_millis(20));
        let _ = breaker.execute(failing).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = breaker.execute(failing).await;
        assert!(breaker.is_open());
    }

    #[tokio::test]
    async fn test_abandoned_probe_releases_slot() {
        let breaker = CircuitBreaker::with_settings("svc", 1, Duration::from_millis(20));
        let _ = breaker.execute(failing).await;
        assert!(breaker.is_open());

        tokio::time::sleep(Duration::from_millis(30)).await;
        // 探测方在操作完成前被取消，半开名额应退回 Open
        let hung = breaker.execute(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let cancelled = tokio::time::timeout(Duration::from_millis(30), hung).await;
        assert!(cancelled.is_err());
        assert!(breaker.is_open());

        // 熔断重新计时后名额可再次取得并正常闭合
        tokio::time::sleep(Duration::from_millis(30)).await;
        breaker.execute(succeeding).await.unwrap();
        assert!(!breaker.is_open());
    }

    #[tokio::test]
    async fn test_reset() {
        let breaker = CircuitBreaker::with_settings("svc", 1, Duration::from_secs(30));
        let _ = breaker.execute(failing).await;
        assert!(breaker.is_open());
        breaker.reset();
        assert!(!breaker.is_open());
        breaker.execute(succeeding).await.unwrap();
    }
}
