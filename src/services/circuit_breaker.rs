use crate::error::{AppError, AppResult};
use crate::models::CircuitBreakerSnapshot;
use crate::services::metrics::{BreakerOutcome, MetricsRegistry};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// 首次失败后的重开延迟
const INITIAL_REOPEN_DELAY: Duration = Duration::from_secs(10);
/// 指数退避上限
const MAX_REOPEN_DELAY: Duration = Duration::from_secs(60 * 60);

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// 请求放行
    Closed,
    /// 快速失败
    Open,
    /// 只允许一个探测请求
    HalfOpen,
}

impl BreakerState {
    fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    reopen_delay: Duration,
    reopen_at: Option<Instant>,
    probe_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            reopen_delay: Duration::ZERO,
            reopen_at: None,
            probe_in_flight: false,
        }
    }
}

/// 对单个Hub全部出站调用的熔断保护
///
/// closed状态下首次失败进入open，重开延迟10秒；此后每经历一轮
/// open → half-open → open，延迟翻倍，封顶1小时。half-open下任意
/// 一次成功回到closed并清零延迟。这里是唯一把Hub故障归类为瞬时
/// 错误的地方。
#[derive(Debug)]
pub struct CircuitBreaker {
    host: String,
    inner: Mutex<BreakerInner>,
    metrics: Arc<MetricsRegistry>,
}

impl CircuitBreaker {
    pub fn new(host: impl Into<String>, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            host: host.into(),
            inner: Mutex::new(BreakerInner::new()),
            metrics,
        }
    }

    /// 放行检查：open状态快速失败，half-open只放行一个探测
    fn check(&self) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let due = inner
                    .reopen_at
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if due {
                    info!("熔断器 {} 进入half-open，允许探测", self.host);
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(AppError::circuit_open(self.host.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(AppError::circuit_open(self.host.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != BreakerState::Closed {
            info!("熔断器 {} 恢复closed", self.host);
        }
        *inner = BreakerInner::new();
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.consecutive_failures += 1;
        let exponent = inner.consecutive_failures.saturating_sub(1).min(32);
        let delay = INITIAL_REOPEN_DELAY
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(MAX_REOPEN_DELAY);
        inner.reopen_delay = delay;
        inner.reopen_at = Some(Instant::now() + delay);
        inner.state = BreakerState::Open;
        inner.probe_in_flight = false;
        warn!(
            "熔断器 {} 打开，连续失败 {} 次，{}秒后允许探测",
            self.host,
            inner.consecutive_failures,
            delay.as_secs()
        );
    }

    /// 经熔断器执行一次出站调用，记录延迟与结果
    pub async fn call<T, F, Fut>(&self, operation: &str, f: F) -> AppResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        if let Err(e) = self.check() {
            self.metrics
                .record_breaker_call(&self.host, BreakerOutcome::Rejected, Duration::ZERO);
            return Err(e);
        }

        let start = Instant::now();
        let result = f().await;
        let latency = start.elapsed();

        match &result {
            Ok(_) => {
                self.metrics
                    .record_breaker_call(&self.host, BreakerOutcome::Success, latency);
                self.record_success();
            }
            Err(e) => {
                self.metrics
                    .record_breaker_call(&self.host, BreakerOutcome::Failure, latency);
                warn!("熔断器 {} 调用 {} 失败: {}", self.host, operation, e);
                self.record_failure();
            }
        }

        result
    }

    /// 线程安全地强制回到closed并清零延迟
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = BreakerInner::new();
        info!("熔断器 {} 已重置", self.host);
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        CircuitBreakerSnapshot {
            state: inner.state.as_str().to_string(),
            consecutive_failures: inner.consecutive_failures,
            reopen_delay_secs: inner.reopen_delay.as_secs(),
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> BreakerState {
        self.inner.lock().unwrap().state
    }

    #[cfg(test)]
    pub(crate) fn reopen_delay(&self) -> Duration {
        self.inner.lock().unwrap().reopen_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("hub1", Arc::new(MetricsRegistry::new()))
    }

    async fn fail(b: &CircuitBreaker) {
        let _ = b
            .call("test", || async { Err::<(), _>(AppError::hub("模拟失败")) })
            .await;
    }

    async fn succeed(b: &CircuitBreaker) -> AppResult<()> {
        b.call("test", || async { Ok(()) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_on_first_failure() {
        let b = breaker();
        fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.reopen_delay(), Duration::from_secs(10));

        // open期间快速失败
        let err = succeed(&b).await.unwrap_err();
        assert!(matches!(err, AppError::CircuitOpen { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_law() {
        let b = breaker();

        // N次连续失败后延迟 = min(10·2^(N-1), 1h)
        for (n, expected_secs) in [(1u32, 10u64), (2, 20), (3, 40), (4, 80)] {
            fail(&b).await;
            assert_eq!(
                b.reopen_delay(),
                Duration::from_secs(expected_secs),
                "第{}次失败后的延迟",
                n
            );
            // 等到重开时刻，half-open探测再次失败
            tokio::time::advance(Duration::from_secs(expected_secs)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_capped_at_one_hour() {
        let b = breaker();
        for _ in 0..20 {
            fail(&b).await;
            let delay = b.reopen_delay();
            tokio::time::advance(delay).await;
        }
        assert_eq!(b.reopen_delay(), Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_success_closes() {
        let b = breaker();
        fail(&b).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        // half-open探测成功，回到closed并清零
        succeed(&b).await.unwrap();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.reopen_delay(), Duration::ZERO);

        // 下一次失败重新从10秒开始
        fail(&b).await;
        assert_eq!(b.reopen_delay(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_forces_closed() {
        let b = breaker();
        fail(&b).await;
        fail(&b).await;
        assert_eq!(b.state(), BreakerState::Open);

        b.reset();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.reopen_delay(), Duration::ZERO);
        succeed(&b).await.unwrap();
    }
}
