//! 有界轮询
//!
//! 指数退避 + 总超时 + 取消令牌。等待期间按小片段休眠，
//! 取消请求最迟在一个片段内生效。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 取消检查粒度
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
            timeout: Duration::from_secs(120),
        }
    }
}

impl PollPolicy {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次 (从 0 开始) 失败后的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial_delay.as_secs_f64() * self.factor.max(1.0).powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// 取消令牌 (可跨线程克隆)
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// 是否是同一个令牌的克隆
    pub fn same_as(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// 单步轮询结果
#[derive(Debug)]
pub enum PollStep<T> {
    Done(T),
    Pending,
}

#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("gave up after {0:?}")]
    TimedOut(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("{0}")]
    Step(E),
}

/// 反复调用 `step` 直到完成、出错、超时或被取消
///
/// `step` 收到从 0 开始的尝试序号。超时只在两次尝试之间检查，
/// 单次尝试自身的耗时由调用方的 HTTP 超时约束。
pub fn poll_until<T, E, F>(policy: &PollPolicy, cancel: &CancelToken, mut step: F) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Result<PollStep<T>, E>,
{
    let deadline = Instant::now() + policy.timeout;
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }

        match step(attempt).map_err(PollError::Step)? {
            PollStep::Done(value) => return Ok(value),
            PollStep::Pending => {}
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::TimedOut(policy.timeout));
        }

        let delay = policy.delay_for(attempt).min(deadline - now);
        tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "still pending");
        sleep_cancellable(delay, cancel)?;
        attempt = attempt.saturating_add(1);
    }
}

fn sleep_cancellable<E>(total: Duration, cancel: &CancelToken) -> Result<(), PollError<E>> {
    let end = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return Err(PollError::Cancelled);
        }
        let now = Instant::now();
        if now >= end {
            return Ok(());
        }
        thread::sleep((end - now).min(CANCEL_CHECK_INTERVAL));
    }
}
