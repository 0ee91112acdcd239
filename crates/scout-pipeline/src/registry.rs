//! Active-run bookkeeping: cancellation tokens, the single-run guard and per-client admission.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("A search is already running")]
    AlreadyRunning,
    #[error("Rate limit exceeded: at most {limit} searches per {window_secs} seconds")]
    RateLimited { limit: usize, window_secs: u64 },
}

/// Cooperative cancellation signal shared by every unit of one run.
#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`CancelToken::cancel`] has been called on any clone.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// Counts events per key over a trailing window. Old entries are pruned on each check.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    limit: usize,
    window: Duration,
    hits: HashMap<String, VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            hits: HashMap::new(),
        }
    }

    /// Record a hit for `key` at `now` unless the window is already full. Keys whose hits
    /// have all expired are forgotten.
    pub fn try_acquire(&mut self, key: &str, now: Instant) -> bool {
        let window = self.window;
        self.hits.retain(|_, hits| {
            while let Some(oldest) = hits.front() {
                if now.saturating_duration_since(*oldest) >= window {
                    hits.pop_front();
                } else {
                    break;
                }
            }
            !hits.is_empty()
        });

        let held = self.hits.get(key).map_or(0, VecDeque::len);
        if held >= self.limit {
            return false;
        }
        self.hits.entry(key.to_string()).or_default().push_back(now);
        true
    }

    /// Number of keys with hits still inside the window.
    pub fn tracked_keys(&self) -> usize {
        self.hits.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }
}

#[derive(Debug)]
struct Inner {
    active: Mutex<HashMap<String, CancelToken>>,
    limiter: Mutex<SlidingWindowLimiter>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle over the process-wide run registry.
#[derive(Debug, Clone)]
pub struct RunRegistry {
    inner: Arc<Inner>,
}

impl RunRegistry {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                active: Mutex::new(HashMap::new()),
                limiter: Mutex::new(SlidingWindowLimiter::new(limit, window)),
            }),
        }
    }

    /// Admission for a new run from `client`: refused while any run is active or when the
    /// client's window is full. An admitted start counts against the window.
    pub fn admit(&self, client: &str) -> Result<(), AdmissionError> {
        self.admit_at(client, Instant::now())
    }

    pub fn admit_at(&self, client: &str, now: Instant) -> Result<(), AdmissionError> {
        if self.has_active() {
            return Err(AdmissionError::AlreadyRunning);
        }
        let mut limiter = lock(&self.inner.limiter);
        if !limiter.try_acquire(client, now) {
            debug!(client, "run admission rate limited");
            return Err(AdmissionError::RateLimited {
                limit: limiter.limit(),
                window_secs: limiter.window().as_secs(),
            });
        }
        Ok(())
    }

    /// Mark `run_id` active. Fails if any run is already active.
    pub fn activate(&self, run_id: &str) -> Result<ActiveRun, AdmissionError> {
        let mut active = lock(&self.inner.active);
        if !active.is_empty() {
            return Err(AdmissionError::AlreadyRunning);
        }
        let token = CancelToken::new();
        active.insert(run_id.to_string(), token.clone());
        info!(run_id, "run activated");
        Ok(ActiveRun {
            registry: self.clone(),
            run_id: run_id.to_string(),
            token,
        })
    }

    /// Signal cancellation. Returns `false` if `run_id` is not active.
    pub fn cancel(&self, run_id: &str) -> bool {
        match lock(&self.inner.active).get(run_id) {
            Some(token) => {
                token.cancel();
                info!(run_id, "run cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, run_id: &str) -> bool {
        lock(&self.inner.active).contains_key(run_id)
    }

    pub fn has_active(&self) -> bool {
        !lock(&self.inner.active).is_empty()
    }

    fn release(&self, run_id: &str) {
        lock(&self.inner.active).remove(run_id);
        debug!(run_id, "run released");
    }
}

/// Marks a run active until dropped.
#[derive(Debug)]
pub struct ActiveRun {
    registry: RunRegistry,
    run_id: String,
    token: CancelToken,
}

impl ActiveRun {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn token(&self) -> CancelToken {
        self.token.clone()
    }
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.registry.release(&self.run_id);
    }
}
