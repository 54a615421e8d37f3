// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{event, Level};

const MAX_OVERSIZE_SLEEP: Duration = Duration::from_secs(60 * 5);

struct TokenBucketInner {
    last_refill_time: Instant,
    tokens: f64,
    fill_rate: f64,
    capacity: f64,
}

impl TokenBucketInner {
    fn refill(&mut self) {
        if self.capacity.is_infinite() {
            self.tokens = f64::INFINITY;
            self.last_refill_time = Instant::now();
            return;
        }
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill_time);
        self.last_refill_time = now;
        if self.fill_rate > 0.0 && self.fill_rate.is_finite() {
            self.tokens = (self.tokens + elapsed.as_secs_f64() * self.fill_rate).min(self.capacity);
        }
    }
}

/// Byte-rate limiter shared by every peer connection of a session.
/// A rate of zero means unlimited and skips the lock entirely.
pub struct TokenBucket {
    is_infinite: AtomicBool,
    inner: Mutex<TokenBucketInner>,
}

impl TokenBucket {
    pub fn new(capacity: f64, fill_rate: f64) -> Self {
        let fill_rate = fill_rate.max(0.0);
        let infinite = fill_rate == 0.0 || !fill_rate.is_finite();
        let capacity = if infinite {
            f64::INFINITY
        } else {
            capacity.max(0.0)
        };

        TokenBucket {
            is_infinite: AtomicBool::new(infinite),
            inner: Mutex::new(TokenBucketInner {
                last_refill_time: Instant::now(),
                tokens: capacity,
                fill_rate,
                capacity,
            }),
        }
    }

    /// A bucket holding one second of burst at `bytes_per_sec`.
    pub fn with_rate(bytes_per_sec: u64) -> Self {
        Self::new(bytes_per_sec as f64, bytes_per_sec as f64)
    }

    pub fn unlimited() -> Self {
        Self::new(0.0, 0.0)
    }

    fn lock(&self) -> MutexGuard<'_, TokenBucketInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_unlimited(&self) -> bool {
        self.is_infinite.load(Ordering::Relaxed)
    }

    pub fn rate(&self) -> f64 {
        self.lock().fill_rate
    }

    pub fn set_rate(&self, new_fill_rate: f64) {
        let rate = new_fill_rate.max(0.0);
        let infinite = !rate.is_finite() || rate == 0.0;
        self.is_infinite.store(infinite, Ordering::Relaxed);

        let mut guard = self.lock();
        if infinite {
            guard.fill_rate = 0.0;
            guard.capacity = f64::INFINITY;
            guard.tokens = f64::INFINITY;
        } else {
            guard.fill_rate = rate;
            guard.capacity = rate;
            guard.tokens = rate;
        }
        guard.last_refill_time = Instant::now();
    }

    /// Waits until `amount` tokens are available and takes them.
    /// Requests larger than the bucket capacity sleep for `amount / rate` instead.
    pub async fn consume(&self, amount: f64) {
        if self.is_unlimited() || amount <= 0.0 || !amount.is_finite() {
            return;
        }

        let (fill_rate, capacity) = {
            let guard = self.lock();
            (guard.fill_rate, guard.capacity)
        };
        if capacity.is_infinite() || fill_rate <= 0.0 || !fill_rate.is_finite() {
            return;
        }

        if amount > capacity {
            let required = Duration::from_secs_f64(amount / fill_rate);
            if required < MAX_OVERSIZE_SLEEP {
                tokio::time::sleep(required).await;
            } else {
                event!(
                    Level::WARN,
                    ?required,
                    "Rate limit sleep for oversize request exceeds cap, not throttling"
                );
            }
            return;
        }

        loop {
            let wait = {
                let mut guard = self.lock();
                guard.refill();
                if guard.tokens >= amount {
                    guard.tokens -= amount;
                    return;
                }
                let needed = amount - guard.tokens;
                Duration::from_secs_f64((needed / fill_rate).max(0.001))
            };
            tokio::time::sleep(wait).await;
        }
    }

    #[cfg(test)]
    fn tokens(&self) -> f64 {
        self.lock().tokens
    }

    #[cfg(test)]
    fn capacity(&self) -> f64 {
        self.lock().capacity
    }

    #[cfg(test)]
    fn set_tokens(&self, val: f64) {
        self.lock().tokens = val;
    }
}

/// The pair of buckets a session hands to every connection.
#[derive(Clone)]
pub struct RateLimits {
    pub download: Arc<TokenBucket>,
    pub upload: Arc<TokenBucket>,
}

impl RateLimits {
    pub fn new(download_bps: u64, upload_bps: u64) -> Self {
        Self {
            download: Arc::new(TokenBucket::with_rate(download_bps)),
            upload: Arc::new(TokenBucket::with_rate(upload_bps)),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            download: Arc::new(TokenBucket::unlimited()),
            upload: Arc::new(TokenBucket::unlimited()),
        }
    }
}
