//! Per-client token-bucket rate limiting.
//!
//! DESIGN
//! ======
//! One bucket per client, materialized lazily on first sight and kept for
//! the process lifetime. The bucket map is read-heavy and write-rare, so it
//! sits behind a `RwLock` with a double-checked insert; each bucket guards
//! its own state with a `Mutex`, which is always the innermost lock. The
//! only valid lock order is map lock then bucket mutex, and neither is ever
//! held across store I/O: quota and saved-state lookups happen before the
//! map write-lock is taken.
//!
//! A background task refills every bucket once per second, which keeps
//! `allow` itself pure in-memory arithmetic and bounds the per-tick cost
//! to O(active clients).
//!
//! ERROR HANDLING
//! ==============
//! Store failures never fail a request: a missing or erroring quota lookup
//! falls back to the configured defaults, a missing or erroring saved state
//! starts the bucket full. Both degrade with a warning.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::RateLimitConfig;
use crate::storage::{QuotaRecord, QuotaStore, SavedState, StateStore, StorageError};

const REFILL_TICK: Duration = Duration::from_secs(1);

/// Slack for float drift when testing `tokens >= 1`.
const FLOAT_EPSILON: f64 = 1e-9;

// =============================================================================
// TOKEN BUCKET
// =============================================================================

#[derive(Debug)]
struct BucketState {
    /// Tokens per second. Zero means the bucket never refills.
    rate: f64,
    capacity: f64,
    tokens: f64,
    /// `None` means "start refilling from the next observation".
    last_refill: Option<DateTime<Utc>>,
}

impl BucketState {
    /// Credit elapsed time since the last refill, clamped to capacity.
    /// Time is never rewound: a negative delta leaves the bucket untouched.
    fn refill(&mut self, now: DateTime<Utc>) {
        let Some(last) = self.last_refill else {
            self.last_refill = Some(now);
            return;
        };
        if self.rate <= 0.0 {
            return;
        }
        let Ok(elapsed) = (now - last).to_std() else {
            return;
        };
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = Some(now);
    }

    /// Adopt new limits when they differ, clamping tokens down if the
    /// capacity shrank. Logs only on an actual change.
    fn apply_quota(&mut self, rate: f64, capacity: f64, client_id: &str, source: &'static str) {
        if self.rate == rate && self.capacity == capacity {
            return;
        }
        info!(
            client_id,
            source,
            old_rate = self.rate,
            new_rate = rate,
            old_capacity = self.capacity,
            new_capacity = capacity,
            "client limits changed"
        );
        self.rate = rate;
        self.capacity = capacity;
        if self.tokens > self.capacity {
            self.tokens = self.capacity;
        }
    }
}

struct TokenBucket {
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(quota: QuotaRecord, saved: SavedState) -> Self {
        Self {
            state: Mutex::new(BucketState {
                rate: quota.rate,
                capacity: quota.capacity,
                tokens: saved.tokens,
                last_refill: saved.last_refill,
            }),
        }
    }
}

// =============================================================================
// RATE LIMITER
// =============================================================================

/// The engine. Construct with [`RateLimiter::new`]; a disabled configuration
/// yields an inert instance whose `allow` is constant true.
pub struct RateLimiter {
    enabled: bool,
    default_rate: f64,
    default_capacity: f64,
    /// Header naming the rate-limit subject; `None` means IP-only.
    identifier_header: Option<String>,
    store: Option<Arc<dyn QuotaStore>>,
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
    refiller_shutdown: Option<watch::Sender<bool>>,
}

impl RateLimiter {
    /// Build the engine and start its background refiller. Must be called
    /// from within a tokio runtime.
    pub fn new(cfg: &RateLimitConfig, store: Option<Arc<dyn QuotaStore>>) -> Arc<Self> {
        if !cfg.enabled {
            info!("rate limiter disabled");
            return Self::disabled();
        }
        if store.is_none() {
            warn!("rate limiter enabled without a store; only default limits apply");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let limiter = Arc::new(Self {
            enabled: true,
            default_rate: cfg.default_rate,
            default_capacity: cfg.default_capacity,
            identifier_header: Some(cfg.identifier_header.clone()).filter(|h| !h.is_empty()),
            store,
            buckets: RwLock::new(HashMap::new()),
            refiller_shutdown: Some(shutdown_tx),
        });

        info!(
            default_rate = limiter.default_rate,
            default_capacity = limiter.default_capacity,
            identifier_header = limiter.identifier_header.as_deref().unwrap_or("<ip>"),
            "rate limiter initialized"
        );

        tokio::spawn(run_refiller(Arc::clone(&limiter), shutdown_rx));
        limiter
    }

    /// Inert instance: `allow` is constant true, `stop` and `save_state`
    /// are no-ops, `client_id` still works.
    pub fn disabled() -> Arc<Self> {
        Arc::new(Self {
            enabled: false,
            default_rate: 0.0,
            default_capacity: 0.0,
            identifier_header: None,
            store: None,
            buckets: RwLock::new(HashMap::new()),
            refiller_shutdown: None,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// The hot path: admit the request iff the client's bucket holds at
    /// least one token, deducting it. Refill happens in the background
    /// ticker, not here.
    pub async fn allow(&self, client_id: &str) -> bool {
        if !self.enabled {
            return true;
        }

        let bucket = self.bucket_for(client_id).await;
        let mut state = bucket.state.lock().unwrap();
        debug!(
            client_id,
            tokens = state.tokens,
            rate = state.rate,
            capacity = state.capacity,
            "rate limit check"
        );
        if state.tokens >= 1.0 - FLOAT_EPSILON {
            state.tokens -= 1.0;
            true
        } else {
            debug!(client_id, "request denied by rate limit");
            false
        }
    }

    /// Extract the rate-limit subject from a request: configured header
    /// first, then the first valid IP in `X-Forwarded-For`, then the
    /// remote address. Never fails.
    pub fn client_id(&self, headers: &HeaderMap, remote_addr: SocketAddr) -> String {
        if let Some(name) = &self.identifier_header {
            if let Some(value) = headers.get(name.as_str()).and_then(|v| v.to_str().ok()) {
                if !value.is_empty() {
                    return value.to_string();
                }
            }
        }

        if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            for part in xff.split(',') {
                let candidate = part.trim();
                if !candidate.is_empty() && candidate.parse::<IpAddr>().is_ok() {
                    return candidate.to_string();
                }
            }
        }

        remote_addr.ip().to_string()
    }

    /// Stop the background refiller. Idempotent; the task exits within one
    /// tick.
    pub fn stop(&self) {
        if let Some(tx) = &self.refiller_shutdown {
            if tx.send(true).is_ok() {
                info!("rate limiter refiller stopping");
            }
        }
    }

    /// Snapshot every bucket and write the state through the store in one
    /// transaction. A no-op when disabled or when the store does not
    /// persist state.
    ///
    /// # Errors
    ///
    /// Returns the storage error from the batch write; clients deleted
    /// concurrently are counted and logged by the store, never an error.
    pub async fn save_state(&self) -> Result<(), StorageError> {
        if !self.enabled {
            return Ok(());
        }
        let Some(store) = &self.store else {
            debug!("no store configured; skipping state save");
            return Ok(());
        };
        if !store.supports_state_persistence() {
            debug!("store does not persist state; skipping save");
            return Ok(());
        }
        let Some(state_store) = store.state_store() else {
            return Ok(());
        };

        // Copy each bucket's state under its own lock, briefly; the map
        // read-lock covers the walk.
        let snapshot: HashMap<String, SavedState> = {
            let map = self.buckets.read().unwrap();
            map.iter()
                .map(|(client_id, bucket)| {
                    let state = bucket.state.lock().unwrap();
                    (
                        client_id.clone(),
                        SavedState { tokens: state.tokens, last_refill: state.last_refill },
                    )
                })
                .collect()
        };

        if snapshot.is_empty() {
            debug!("no active buckets to save");
            return Ok(());
        }

        let saved = state_store.batch_update_state(&snapshot).await?;
        info!(saved, total = snapshot.len(), "rate limiter state saved");
        Ok(())
    }

    /// One refill pass over every bucket. Called by the background ticker;
    /// exposed to the crate so tests can drive the cadence directly.
    pub(crate) fn refill_all(&self) {
        let now = Utc::now();
        let map = self.buckets.read().unwrap();
        for bucket in map.values() {
            bucket.state.lock().unwrap().refill(now);
        }
    }

    // -------------------------------------------------------------------------
    // Bucket materialization
    // -------------------------------------------------------------------------

    async fn bucket_for(&self, client_id: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.lookup(client_id) {
            // Admin edits take effect without restart: reconcile limits
            // against the store on every revisit.
            self.reconcile_quota(client_id, &bucket).await;
            return bucket;
        }
        self.materialize(client_id).await
    }

    fn lookup(&self, client_id: &str) -> Option<Arc<TokenBucket>> {
        self.buckets.read().unwrap().get(client_id).cloned()
    }

    /// First sight of this client: fetch quota and saved state (no locks
    /// held), then insert with a double-check. When two requests race for
    /// the same new client, the first insert wins and the loser continues
    /// with the winner's bucket.
    async fn materialize(&self, client_id: &str) -> Arc<TokenBucket> {
        let quota = self.quota_or_defaults(client_id).await;
        let saved = self.saved_state_or_full(client_id, quota.capacity).await;
        let fresh = Arc::new(TokenBucket::new(quota, saved));

        let (bucket, raced) = {
            let mut map = self.buckets.write().unwrap();
            match map.entry(client_id.to_string()) {
                Entry::Occupied(entry) => (Arc::clone(entry.get()), true),
                Entry::Vacant(entry) => {
                    entry.insert(Arc::clone(&fresh));
                    (fresh, false)
                }
            }
        };

        if raced {
            self.reconcile_quota(client_id, &bucket).await;
        } else {
            info!(
                client_id,
                rate = quota.rate,
                capacity = quota.capacity,
                tokens = saved.tokens,
                restored = saved.last_refill.is_some(),
                "bucket created"
            );
        }

        // Credit offline time (saved last_refill up to now), capped at
        // capacity.
        bucket.state.lock().unwrap().refill(Utc::now());
        bucket
    }

    async fn quota_or_defaults(&self, client_id: &str) -> QuotaRecord {
        let defaults = QuotaRecord { rate: self.default_rate, capacity: self.default_capacity };
        let Some(store) = &self.store else {
            return defaults;
        };
        match store.get_quota(client_id).await {
            Ok(Some(record)) => record,
            Ok(None) => defaults,
            Err(e) => {
                warn!(client_id, error = %e, "quota lookup failed; using defaults");
                defaults
            }
        }
    }

    async fn saved_state_or_full(&self, client_id: &str, capacity: f64) -> SavedState {
        let full = SavedState { tokens: capacity, last_refill: None };
        let Some(state_store) = self
            .store
            .as_deref()
            .filter(|s| s.supports_state_persistence())
            .and_then(|s| s.state_store())
        else {
            return full;
        };

        match state_store.get_state(client_id).await {
            Ok(Some(mut saved)) => {
                // The saved capacity may have shrunk since the state was
                // written.
                if saved.tokens > capacity {
                    saved.tokens = capacity;
                }
                saved
            }
            Ok(None) => full,
            Err(e) => {
                warn!(client_id, error = %e, "saved state lookup failed; starting full");
                full
            }
        }
    }

    /// Refresh an existing bucket's limits from the store. On a store
    /// error the current limits are kept.
    async fn reconcile_quota(&self, client_id: &str, bucket: &TokenBucket) {
        let Some(store) = &self.store else {
            return;
        };
        match store.get_quota(client_id).await {
            Ok(Some(record)) => {
                bucket
                    .state
                    .lock()
                    .unwrap()
                    .apply_quota(record.rate, record.capacity, client_id, "store");
            }
            Ok(None) => {
                bucket.state.lock().unwrap().apply_quota(
                    self.default_rate,
                    self.default_capacity,
                    client_id,
                    "defaults",
                );
            }
            Err(e) => {
                warn!(client_id, error = %e, "quota lookup failed; keeping current limits");
            }
        }
    }
}

async fn run_refiller(limiter: Arc<RateLimiter>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(REFILL_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => limiter.refill_all(),
            _ = shutdown.changed() => {
                debug!("background refiller stopped");
                break;
            }
        }
    }
}

#[cfg(test)]
#[path = "rate_limit_test.rs"]
mod tests;
