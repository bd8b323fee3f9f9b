use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Per-user rate limiter and credit ledger, shared by all sessions of that user.
///
/// `rx` is traffic coming from the client (upload), `tx` is traffic going back
/// to it (download). Rates are bytes per second, a rate `<= 0` disables
/// pacing. Credit is a byte balance: every byte passed through the valve is
/// deducted exactly once and the balance may go negative, in which case the
/// next transfer in that direction waits until credit is granted again.
pub struct Valve {
    rx: Direction,
    tx: Direction,
}

struct Direction {
    rate: AtomicI64,
    credit: AtomicI64,
    bytes: AtomicU64,
    bucket: Mutex<TokenBucket>,
    credit_granted: Notify,
}

/// Token bucket holding at most one second worth of bytes.
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: i64) -> Self {
        Self {
            tokens: rate.max(0) as f64,
            last_refill: Instant::now(),
        }
    }

    /// Takes `n` tokens and returns how long the caller must wait before they
    /// are actually available. The balance is allowed to go negative so that
    /// concurrent reservations queue behind each other.
    fn reserve(&mut self, n: u64, rate: i64) -> Duration {
        let now = Instant::now();
        if rate <= 0 {
            // Debt built up while paced does not outlive the unlimited spell.
            self.tokens = 0.0;
            self.last_refill = now;
            return Duration::ZERO;
        }

        let rate = rate as f64;
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(rate);
        self.last_refill = now;
        self.tokens -= n as f64;

        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / rate)
        }
    }
}

impl Direction {
    fn new(rate: i64, credit: i64) -> Self {
        Self {
            rate: AtomicI64::new(rate),
            credit: AtomicI64::new(credit),
            bytes: AtomicU64::new(0),
            bucket: Mutex::new(TokenBucket::new(rate)),
            credit_granted: Notify::new(),
        }
    }

    fn add_credit(&self, delta: i64) {
        self.credit.fetch_add(delta, Ordering::AcqRel);
        self.credit_granted.notify_waiters();
    }

    fn set_credit(&self, n: i64) {
        self.credit.store(n, Ordering::Release);
        self.credit_granted.notify_waiters();
    }

    fn consume(&self, n: u64) -> i64 {
        self.bytes.fetch_add(n, Ordering::Relaxed);
        let n = i64::try_from(n).unwrap_or(i64::MAX);
        self.credit.fetch_sub(n, Ordering::AcqRel).wrapping_sub(n)
    }

    async fn wait_for_credit(&self) {
        loop {
            let granted = self.credit_granted.notified();
            tokio::pin!(granted);
            // Register before checking so a grant between the load and the
            // await is not missed.
            granted.as_mut().enable();
            if self.credit.load(Ordering::Acquire) > 0 {
                return;
            }
            granted.await;
        }
    }

    async fn wait(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.wait_for_credit().await;

        let n = n as u64;
        let balance = self.consume(n);
        let delay = self
            .bucket
            .lock()
            .reserve(n, self.rate.load(Ordering::Acquire));

        if !delay.is_zero() {
            trace!(bytes = n, balance, ?delay, "throttling");
            tokio::time::sleep(delay).await;
        }
    }
}

impl Valve {
    pub fn new(rx_rate: i64, tx_rate: i64, rx_credit: i64, tx_credit: i64) -> Self {
        Self {
            rx: Direction::new(rx_rate, rx_credit),
            tx: Direction::new(tx_rate, tx_credit),
        }
    }

    /// A valve that never paces and starts with practically endless credit.
    pub fn unlimited() -> Self {
        Self::new(0, 0, i64::MAX, i64::MAX)
    }

    pub fn rx_rate(&self) -> i64 {
        self.rx.rate.load(Ordering::Acquire)
    }

    pub fn tx_rate(&self) -> i64 {
        self.tx.rate.load(Ordering::Acquire)
    }

    pub fn rx_credit(&self) -> i64 {
        self.rx.credit.load(Ordering::Acquire)
    }

    pub fn tx_credit(&self) -> i64 {
        self.tx.credit.load(Ordering::Acquire)
    }

    /// Total bytes received through this valve since it was made.
    pub fn rx_bytes(&self) -> u64 {
        self.rx.bytes.load(Ordering::Relaxed)
    }

    /// Total bytes sent through this valve since it was made.
    pub fn tx_bytes(&self) -> u64 {
        self.tx.bytes.load(Ordering::Relaxed)
    }

    pub fn set_rx_rate(&self, rate: i64) {
        self.rx.rate.store(rate, Ordering::Release);
    }

    pub fn set_tx_rate(&self, rate: i64) {
        self.tx.rate.store(rate, Ordering::Release);
    }

    pub fn add_rx_credit(&self, delta: i64) {
        self.rx.add_credit(delta);
    }

    pub fn add_tx_credit(&self, delta: i64) {
        self.tx.add_credit(delta);
    }

    pub fn set_rx_credit(&self, n: i64) {
        self.rx.set_credit(n);
    }

    pub fn set_tx_credit(&self, n: i64) {
        self.tx.set_credit(n);
    }

    /// Deducts `n` received bytes without pacing and returns the new balance.
    pub fn consume_rx(&self, n: usize) -> i64 {
        self.rx.consume(n as u64)
    }

    /// Deducts `n` sent bytes without pacing and returns the new balance.
    pub fn consume_tx(&self, n: usize) -> i64 {
        self.tx.consume(n as u64)
    }

    /// Accounts for `n` received bytes, waiting first for positive credit and
    /// then for the rate ceiling.
    pub async fn rx_wait(&self, n: usize) {
        self.rx.wait(n).await
    }

    /// Accounts for `n` sent bytes, waiting first for positive credit and
    /// then for the rate ceiling.
    pub async fn tx_wait(&self, n: usize) {
        self.tx.wait(n).await
    }
}

impl fmt::Debug for Valve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Valve")
            .field("rx_rate", &self.rx_rate())
            .field("tx_rate", &self.tx_rate())
            .field("rx_credit", &self.rx_credit())
            .field("tx_credit", &self.tx_credit())
            .finish()
    }
}
