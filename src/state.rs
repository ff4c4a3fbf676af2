//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor.
//! It holds the backend pool, the rate-limiting engine, the optional
//! quota store for the admin surface, and the upstream HTTP client the
//! dispatcher proxies through. Clone is required by Axum; every field is
//! Arc-wrapped or internally reference-counted.

use std::sync::Arc;
use std::time::Duration;

use crate::pool::BackendPool;
use crate::rate_limit::RateLimiter;
use crate::storage::Db;

const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub pool: Arc<BackendPool>,
    pub limiter: Arc<RateLimiter>,
    /// Quota store backing the admin surface. `None` when running without
    /// persistence; the admin API answers 503 in that case.
    pub store: Option<Arc<Db>>,
    /// Upstream client for proxied requests. Connect timeout only, since
    /// a proxied response may legitimately stream for a long time.
    pub http: reqwest::Client,
}

impl AppState {
    /// # Errors
    ///
    /// Returns an error when the upstream HTTP client cannot be built.
    pub fn new(
        pool: Arc<BackendPool>,
        limiter: Arc<RateLimiter>,
        store: Option<Arc<Db>>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(UPSTREAM_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { pool, limiter, store, http })
    }
}
