/// Request-unit token bucket refilled once per control interval
///
/// Costs are estimated before dispatch and corrected afterwards, so the token
/// count may go negative; that debt is paid off by later refills.
use crate::error::{RoutingError, RoutingResult};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default control interval
pub const DEFAULT_CONTROL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct BucketState {
    capacity: f64,
    available: f64,
    interval_start: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant, interval: Duration) {
        let elapsed = now.saturating_duration_since(self.interval_start);
        let intervals = (elapsed.as_nanos() / interval.as_nanos().max(1)) as u32;
        if intervals == 0 {
            return;
        }

        self.available = (self.available + self.capacity * intervals as f64).min(self.capacity);
        self.interval_start += interval * intervals;
    }

    fn is_full(&self) -> bool {
        self.available >= self.capacity
    }
}

#[derive(Debug)]
pub struct ThroughputBucket {
    state: Mutex<BucketState>,
    interval: Duration,
}

impl ThroughputBucket {
    /// A full bucket holding `capacity` request units per interval
    pub fn new(capacity: f64, interval: Duration) -> Self {
        Self {
            state: Mutex::new(BucketState {
                capacity,
                available: capacity,
                interval_start: Instant::now(),
            }),
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn capacity(&self) -> f64 {
        self.state.lock().await.capacity
    }

    /// Tokens left in the current interval (negative while in debt)
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(Instant::now(), self.interval);
        state.available
    }

    /// Take `estimate` tokens, or report how long until the next refill
    ///
    /// A request larger than the whole capacity is admitted once the bucket
    /// is full, otherwise it could never run.
    pub async fn try_acquire(&self, estimate: f64) -> Result<(), Duration> {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.refill(now, self.interval);

        let fits = state.available >= estimate;
        let oversized = estimate > state.capacity && state.is_full();
        if fits || oversized {
            state.available -= estimate;
            return Ok(());
        }

        let next_refill = state.interval_start + self.interval;
        Err(next_refill.saturating_duration_since(now))
    }

    /// Wait for admission, giving up when `cancel` fires
    pub async fn acquire(&self, estimate: f64, cancel: &CancellationToken) -> RoutingResult<()> {
        loop {
            let wait = match self.try_acquire(estimate).await {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            log::trace!("Throughput bucket exhausted, waiting {:?}", wait);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(RoutingError::cancelled("throughput admission"));
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Correct the token count once the actual charge is known
    pub async fn reconcile(&self, estimate: f64, actual: f64) {
        let mut state = self.state.lock().await;
        state.available = (state.available + estimate - actual).min(state.capacity);
    }

    /// Publish a new per-interval budget
    pub async fn set_capacity(&self, capacity: f64) {
        let mut state = self.state.lock().await;
        state.refill(Instant::now(), self.interval);
        state.capacity = capacity;
        state.available = state.available.min(capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    #[tokio::test(start_paused = true)]
    async fn test_admission_boundary() {
        let bucket = ThroughputBucket::new(10.0, Duration::from_secs(1));

        assert_ok!(bucket.try_acquire(8.0).await);
        let wait = bucket.try_acquire(5.0).await.unwrap_err();
        assert_eq!(wait, Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(
            bucket.try_acquire(5.0).await.unwrap_err(),
            Duration::from_millis(600)
        );

        tokio::time::advance(Duration::from_millis(600)).await;
        assert_ok!(bucket.try_acquire(5.0).await);
        assert_eq!(bucket.available().await, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped() {
        let bucket = ThroughputBucket::new(10.0, Duration::from_secs(1));
        assert_ok!(bucket.try_acquire(10.0).await);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(bucket.available().await, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debt_carries_over() {
        let bucket = ThroughputBucket::new(10.0, Duration::from_secs(1));
        assert_ok!(bucket.try_acquire(2.0).await);
        // The request actually cost far more than estimated
        bucket.reconcile(2.0, 25.0).await;
        assert_eq!(bucket.available().await, -15.0);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.available().await, -5.0);
        assert!(bucket.try_acquire(1.0).await.is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_ok!(bucket.try_acquire(1.0).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_request_waits_for_full_bucket() {
        let bucket = ThroughputBucket::new(10.0, Duration::from_secs(1));
        assert_ok!(bucket.try_acquire(1.0).await);
        assert!(bucket.try_acquire(30.0).await.is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_ok!(bucket.try_acquire(30.0).await);
        assert_eq!(bucket.available().await, -20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = ThroughputBucket::new(10.0, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        assert_ok!(bucket.acquire(10.0, &cancel).await);

        let start = Instant::now();
        assert_ok!(bucket.acquire(4.0, &cancel).await);
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_honours_cancellation() {
        let bucket = ThroughputBucket::new(10.0, Duration::from_secs(1));
        let cancel = CancellationToken::new();
        assert_ok!(bucket.acquire(10.0, &cancel).await);

        cancel.cancel();
        let result = bucket.acquire(4.0, &cancel).await;
        assert!(matches!(result, Err(RoutingError::Cancelled { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_capacity_clamps_available() {
        let bucket = ThroughputBucket::new(100.0, Duration::from_secs(1));
        bucket.set_capacity(20.0).await;
        assert_eq!(bucket.capacity().await, 20.0);
        assert_eq!(bucket.available().await, 20.0);

        bucket.set_capacity(50.0).await;
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.available().await, 50.0);
    }
}
