//! Backend pool — liveness tracking and selection policies.
//!
//! DESIGN
//! ======
//! The pool is built once at startup from the configured URL list and never
//! resizes. Ordering is configuration order; that stability is what makes
//! round-robin well-defined and lets proxy-error callbacks refer to "the
//! backend I came from" by plain index. The only mutable piece of a backend
//! is its alive flag, behind a per-backend `RwLock`: `select` reads,
//! `mark_dead`/`mark_alive` write, and transitions are logged only on an
//! actual flip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::Url;
use tracing::{debug, info};

// =============================================================================
// ERROR TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("backend list is empty")]
    Empty,
    #[error("backend url #{index} ('{url}') is not valid: {source}")]
    InvalidUrl {
        index: usize,
        url: String,
        source: url::ParseError,
    },
    #[error("backend url #{index} ('{url}') must be absolute, e.g. 'http://host:port'")]
    NotAbsolute { index: usize, url: String },
}

/// Selection failed because every backend is marked dead.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("no healthy backends available")]
pub struct NoHealthyBackends;

// =============================================================================
// POLICY
// =============================================================================

/// Function from the alive subset to a single chosen backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    RoundRobin,
    Random,
}

impl Policy {
    /// Case-insensitive parse. Returns `None` for unrecognized input so the
    /// caller can decide whether that is a warning or an error.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "round_robin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::Random => "random",
        }
    }
}

// =============================================================================
// BACKEND
// =============================================================================

/// A configured upstream server. Created at pool construction, never
/// added or removed while running.
#[derive(Debug)]
pub struct Backend {
    url: Url,
    alive: RwLock<bool>,
}

impl Backend {
    fn new(url: Url) -> Self {
        Self { url, alive: RwLock::new(true) }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_alive(&self) -> bool {
        *self.alive.read().unwrap()
    }

    /// Flip the alive flag; logs only on an actual transition.
    fn set_alive(&self, alive: bool) {
        let mut guard = self.alive.write().unwrap();
        if *guard != alive {
            *guard = alive;
            info!(backend = %self.url, alive, "backend liveness changed");
        }
    }
}

/// Read-only view of one backend, for logs, tests, and the prober.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub url: Url,
    pub alive: bool,
}

// =============================================================================
// POOL
// =============================================================================

/// Ordered, fixed-size set of backends plus the selection state.
#[derive(Debug)]
pub struct BackendPool {
    backends: Vec<Backend>,
    policy: Policy,
    /// Round-robin cursor. Monotonic; the selection index is `cursor mod N`.
    cursor: AtomicU64,
    /// Per-pool PRNG for the random policy. Seeded from wall clock at
    /// construction; fine for load distribution, not for security.
    rng: Mutex<StdRng>,
}

impl BackendPool {
    /// Validate and register every backend URL. Fails the whole construction
    /// on the first URL that is not absolute. All backends start alive.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` when the list is empty or a URL is relative or
    /// unparseable.
    pub fn new(urls: &[String], policy: Policy) -> Result<Self, PoolError> {
        if urls.is_empty() {
            return Err(PoolError::Empty);
        }

        let mut backends = Vec::with_capacity(urls.len());
        for (index, raw) in urls.iter().enumerate() {
            let url = Url::parse(raw).map_err(|source| PoolError::InvalidUrl {
                index,
                url: raw.clone(),
                source,
            })?;
            if !url.has_host() {
                return Err(PoolError::NotAbsolute { index, url: raw.clone() });
            }
            info!(index, backend = %url, "backend registered");
            backends.push(Backend::new(url));
        }

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        Ok(Self {
            backends,
            policy,
            cursor: AtomicU64::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        })
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Pick one alive backend per the configured policy.
    ///
    /// # Errors
    ///
    /// Fails with [`NoHealthyBackends`] only when every backend is dead.
    pub fn select(&self) -> Result<(usize, &Backend), NoHealthyBackends> {
        match self.policy {
            Policy::RoundRobin => self.select_round_robin(),
            Policy::Random => self.select_random(),
        }
    }

    /// Advance the cursor, then scan at most N slots for the first alive
    /// backend. With everyone alive this visits each backend exactly once
    /// per N selections; under partial failure it falls through to the next
    /// alive slot without losing fairness among the remainder.
    fn select_round_robin(&self) -> Result<(usize, &Backend), NoHealthyBackends> {
        let n = self.backends.len() as u64;
        let start = self.cursor.fetch_add(1, Ordering::Relaxed);

        for offset in 0..n {
            let index = (start.wrapping_add(offset) % n) as usize;
            let backend = &self.backends[index];
            if backend.is_alive() {
                return Ok((index, backend));
            }
        }
        Err(NoHealthyBackends)
    }

    /// Uniform sample over the alive indices, so dead slots introduce no
    /// bias toward low indices.
    fn select_random(&self) -> Result<(usize, &Backend), NoHealthyBackends> {
        let alive: Vec<usize> = self
            .backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_alive())
            .map(|(i, _)| i)
            .collect();

        if alive.is_empty() {
            return Err(NoHealthyBackends);
        }

        let pick = self.rng.lock().unwrap().gen_range(0..alive.len());
        let index = alive[pick];
        Ok((index, &self.backends[index]))
    }

    /// Idempotent; logs only on an actual transition. Out-of-range indices
    /// are ignored with a debug note (the backend slice never resizes, so
    /// this can only happen on caller bugs).
    pub fn mark_dead(&self, index: usize) {
        match self.backends.get(index) {
            Some(backend) => backend.set_alive(false),
            None => debug!(index, "mark_dead: no such backend"),
        }
    }

    /// Idempotent; logs only on an actual transition.
    pub fn mark_alive(&self, index: usize) {
        match self.backends.get(index) {
            Some(backend) => backend.set_alive(true),
            None => debug!(index, "mark_alive: no such backend"),
        }
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    /// Read-only view of the pool, in configuration order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<BackendStatus> {
        self.backends
            .iter()
            .map(|b| BackendStatus { url: b.url.clone(), alive: b.is_alive() })
            .collect()
    }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod tests;
