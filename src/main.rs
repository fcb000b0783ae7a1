// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use enclave_router::{
    allowance::{
        AllowanceGate, HttpOverageReporter, LoggingOverageReporter, OverageReporter,
        StoredEntitlements,
    },
    api::router,
    attestation::AttestationResolver,
    clock::{Clock, SystemClock},
    config::Config,
    gateway::InferenceGateway,
    pool::{AssignmentReaper, EnclaveRegistry},
    relay::{EnclaveRelay, SessionTimeouts},
    state::AppState,
    storage::{PoolDatabase, PoolSeed},
};

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("Invalid configuration");
    init_tracing(config.json_logs);

    std::fs::create_dir_all(&config.data_dir).expect("Failed to create data directory");
    let db = Arc::new(
        PoolDatabase::open(&config.database_path()).expect("Failed to open pool database"),
    );

    if let Some(path) = &config.pool_config {
        PoolSeed::load(path)
            .and_then(|seed| seed.apply(&db))
            .expect("Failed to apply pool configuration");
        info!(path = %path.display(), "Pool configuration loaded");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = Arc::new(EnclaveRegistry::new(db.clone(), clock.clone()));

    let reporter: Arc<dyn OverageReporter> = match &config.billing_overage_url {
        Some(url) => Arc::new(
            HttpOverageReporter::new(url.clone()).expect("Failed to build billing client"),
        ),
        None => {
            warn!("BILLING_OVERAGE_URL not set, overage events are only logged");
            Arc::new(LoggingOverageReporter)
        }
    };
    let allowance = Arc::new(AllowanceGate::new(
        db.clone(),
        Arc::new(StoredEntitlements::new(db.clone())),
        reporter,
        clock.clone(),
    ));

    let resolver = Arc::new(
        AttestationResolver::new(config.attestation.clone(), clock.clone())
            .expect("Failed to build attestation client"),
    );
    if !config.attestation.require_hardware {
        warn!("Hardware attestation not required, mock attestation reports are accepted");
    }
    let relay = Arc::new(EnclaveRelay::new(resolver, SessionTimeouts::default()));

    let gateway = Arc::new(InferenceGateway::new(
        db.clone(),
        registry.clone(),
        allowance,
        relay,
    ));

    let shutdown = CancellationToken::new();
    let reaper = AssignmentReaper::new(registry, clock)
        .with_interval(config.reaper_interval)
        .with_stale_after(config.assignment_stale_after);
    let reaper_handle = tokio::spawn(reaper.run(shutdown.clone()));

    let app = router(AppState::new(gateway));
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .expect("Failed to bind listener");
    info!(addr = %config.bind_addr, "Enclave router listening (docs at /docs)");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            server_shutdown.cancel();
        })
        .await
        .expect("HTTP server failed");

    shutdown.cancel();
    if let Err(e) = reaper_handle.await {
        warn!(error = %e, "Reaper task ended abnormally");
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
