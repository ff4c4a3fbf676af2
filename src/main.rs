#![allow(dead_code)]

mod config;
mod health;
mod pool;
mod proxy;
mod rate_limit;
mod response;
mod routes;
mod state;
mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::config::Config;
use crate::health::HealthProber;
use crate::pool::BackendPool;
use crate::rate_limit::RateLimiter;
use crate::storage::{Db, QuotaStore};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let cfg = Config::from_env().expect("invalid configuration");

    // The store exists only when the rate limiter is on and a database
    // path is configured; without it the limiter runs on defaults and the
    // admin API answers 503.
    let store = if cfg.rate_limit.enabled && !cfg.rate_limit.db_path.is_empty() {
        let db = Db::open(&cfg.rate_limit.db_path)
            .await
            .expect("failed to open quota store");
        Some(Arc::new(db))
    } else {
        info!("running without a quota store; admin API unavailable");
        None
    };

    let limiter = RateLimiter::new(
        &cfg.rate_limit,
        store.clone().map(|db| db as Arc<dyn QuotaStore>),
    );
    let pool = Arc::new(
        BackendPool::new(&cfg.backends, cfg.policy).expect("invalid backend configuration"),
    );

    let prober = if cfg.health.enabled {
        let prober = HealthProber::spawn(Arc::clone(&pool), cfg.health.clone())
            .expect("failed to start health prober");
        Some(prober)
    } else {
        info!("health checks disabled");
        None
    };

    let app_state = state::AppState::new(Arc::clone(&pool), Arc::clone(&limiter), store.clone())
        .expect("failed to build upstream http client");
    let app = routes::app(app_state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.port))
        .await
        .expect("failed to bind");
    info!(
        port = cfg.port,
        policy = cfg.policy.as_str(),
        backends = cfg.backends.len(),
        rate_limiter = limiter.is_enabled(),
        health_checks = cfg.health.enabled,
        "tollgate listening"
    );

    let (drain_tx, drain_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(async move {
                let _ = drain_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    info!("shutdown signal received");

    // Ordered shutdown: prober, refiller, state save, drain, store close.
    // Each step is bounded and none of them can veto the next.
    if let Some(prober) = &prober {
        prober.stop();
    }
    limiter.stop();
    if let Err(e) = limiter.save_state().await {
        error!(error = %e, "failed to save rate limiter state");
    }

    let _ = drain_tx.send(());
    match tokio::time::timeout(cfg.shutdown_grace, server).await {
        Ok(Ok(Ok(()))) => info!("server drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during drain"),
        Ok(Err(e)) => error!(error = %e, "server task failed"),
        Err(_) => warn!("drain grace period elapsed before all connections closed"),
    }

    if let Some(store) = &store {
        store.close().await;
        info!("quota store closed");
    }
    info!("shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        _ = terminate => {}
    }
}
