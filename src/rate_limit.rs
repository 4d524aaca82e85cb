//! Outbound call pacing for the upstream API.
//!
//! The API allows 60 requests per sliding 60-second window. `acquire()` is
//! the sole suspension point of the crawler and validator hot loops: it
//! parks the task until a slot opens. A 429 observed by the client is
//! reported back here and delays every subsequent acquisition.
//!
//! Nothing is persisted; a fresh process starts with a clean window.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

pub const WINDOW: Duration = Duration::from_secs(60);
pub const MAX_PER_WINDOW: usize = 60;

/// Upper bound of the random jitter added on top of a reported retry-after.
const RETRY_JITTER_MS: u64 = 500;

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<Inner>>,
    window: Duration,
    max_per_window: usize,
}

struct Inner {
    /// Send instants within the current window, oldest first.
    sent: VecDeque<Instant>,
    /// No acquisition may complete before this instant (429 penalty).
    penalty_until: Option<Instant>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(MAX_PER_WINDOW, WINDOW)
    }
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sent: VecDeque::with_capacity(max_per_window),
                penalty_until: None,
            })),
            window,
            max_per_window,
        }
    }

    /// Block until a request slot is available, then claim it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();

                while let Some(front) = inner.sent.front() {
                    if *front + self.window <= now {
                        inner.sent.pop_front();
                    } else {
                        break;
                    }
                }

                if let Some(until) = inner.penalty_until {
                    if until > now {
                        until - now
                    } else {
                        inner.penalty_until = None;
                        continue;
                    }
                } else if inner.sent.len() < self.max_per_window {
                    inner.sent.push_back(now);
                    return;
                } else {
                    // Window full: wait for the oldest entry to age out.
                    *inner.sent.front().expect("window non-empty") + self.window - now
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Record a 429 from upstream. All subsequent `acquire()` calls are
    /// delayed by at least `retry_after`, plus jitter so that concurrent
    /// processes sharing the key don't reconverge on the same instant.
    pub async fn report_retry_after(&self, retry_after: Duration) {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=RETRY_JITTER_MS));
        let until = Instant::now() + retry_after + jitter;
        let mut inner = self.inner.lock().await;
        if inner.penalty_until.is_none_or(|existing| until > existing) {
            inner.penalty_until = Some(until);
        }
        tracing::warn!(
            retry_after_secs = retry_after.as_secs_f64(),
            "rate limited upstream — delaying subsequent requests"
        );
    }
}
