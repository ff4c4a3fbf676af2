//! Background health probing for the backend pool.
//!
//! DESIGN
//! ======
//! One long-lived task fires a probe cycle immediately, then on every
//! interval tick. Each cycle fans out one GET per backend in parallel,
//! bounded by the configured timeout, and flips the backend's alive flag
//! from the outcome. Probes never serialize against request traffic; the
//! alive flag's lock is the only shared point.
//!
//! Any 2xx status marks the backend alive. Everything else (a non-2xx
//! status, a connect/timeout/DNS failure, an unbuildable probe URL) marks
//! it dead.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::HealthCheckConfig;
use crate::pool::BackendPool;

const CONNECT_TIMEOUT_FRACTION: u32 = 2;

/// Handle to the probing task. Dropping it does not stop the task; call
/// [`HealthProber::stop`].
pub struct HealthProber {
    shutdown_tx: watch::Sender<bool>,
}

impl HealthProber {
    /// Spawn the probe loop. Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error when the probe HTTP client cannot be built.
    pub fn spawn(pool: Arc<BackendPool>, cfg: HealthCheckConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout)
            .connect_timeout(cfg.timeout / CONNECT_TIMEOUT_FRACTION)
            .build()?;

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(
            interval_ms = cfg.interval.as_millis() as u64,
            timeout_ms = cfg.timeout.as_millis() as u64,
            path = %cfg.path,
            "health prober started"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cfg.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => probe_all(&client, &pool, &cfg.path).await,
                    _ = shutdown_rx.changed() => {
                        info!("health prober stopped");
                        break;
                    }
                }
            }
        });

        Ok(Self { shutdown_tx })
    }

    /// Signal the probe loop to exit; it does so within one tick.
    /// Idempotent.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// One probe cycle: every backend in parallel.
async fn probe_all(client: &reqwest::Client, pool: &BackendPool, path: &str) {
    debug!("running health probe cycle");
    let probes = pool
        .backends()
        .iter()
        .enumerate()
        .map(|(index, backend)| probe_one(client, pool, index, probe_url(backend.url(), path)));
    join_all(probes).await;
}

async fn probe_one(client: &reqwest::Client, pool: &BackendPool, index: usize, url: String) {
    match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => pool.mark_alive(index),
        Ok(response) => {
            debug!(url = %url, status = %response.status(), "health probe returned non-2xx");
            pool.mark_dead(index);
        }
        Err(e) => {
            warn!(url = %url, error = %e, "health probe failed");
            pool.mark_dead(index);
        }
    }
}

/// Append the probe path to the backend base URL without disturbing any
/// path the backend URL already carries.
fn probe_url(base: &url::Url, path: &str) -> String {
    format!("{}{}", base.as_str().trim_end_matches('/'), path)
}

#[cfg(test)]
#[path = "health_test.rs"]
mod tests;
