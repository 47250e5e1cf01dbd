//! SFU Service
//!
//! Selective Forwarding Unit media-session orchestrator.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3016, `GET /ws`)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize tracing
//! 3. Initialize Prometheus metrics recorder
//! 4. Spawn the media worker pool
//! 5. Connect the meeting store (Redis if configured)
//! 6. Start health and signaling servers
//! 7. Wait for a shutdown signal or a fatal worker death

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use sfu_service::config::Config;
use sfu_service::media::codecs::default_media_codecs;
use sfu_service::media::loopback::LoopbackWorkerFactory;
use sfu_service::meetings::{MeetingStore, RedisMeetingStore, StaticMeetingStore};
use sfu_service::observability::{
    health_router, init_metrics_recorder, stats_router, HealthState,
};
use sfu_service::session::SessionManager;
use sfu_service::signaling::{signaling_router, RoomHub, RoomLocks, SignalingContext};
use sfu_service::system_info::gather_host_info;
use sfu_service::workers::{WorkerPool, WorkerPoolConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sfu_service=debug,tower_http=debug".into());

    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn parse_addr(raw: &str, what: &str) -> Result<SocketAddr, String> {
    raw.parse().map_err(|e| {
        error!(error = %e, addr = %raw, "Invalid {what} bind address");
        format!("Invalid {what} bind address: {e}")
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Tracing depends on SFU_LOG_JSON, so configuration loads first.
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;
    init_tracing(config.log_json);

    info!("Starting SFU service");
    info!(
        sfu_id = %config.sfu_id,
        bind_address = %config.bind_address,
        health_bind_address = %config.health_bind_address,
        num_workers = ?config.num_workers,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        listen_ip = %config.listen_ip,
        default_max_participants = config.default_max_participants,
        meeting_store = if config.redis_url.is_some() { "redis" } else { "static" },
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    // Worker pool
    let host = gather_host_info();
    let num_workers = config.num_workers.unwrap_or(host.cpu_cores);
    info!(
        num_workers = num_workers,
        cpu_cores = host.cpu_cores,
        total_memory_kb = host.total_memory_kb,
        "Spawning media workers..."
    );
    let pool = WorkerPool::initialize(
        &LoopbackWorkerFactory,
        WorkerPoolConfig {
            num_workers,
            worker_settings: config.worker_settings(),
            death_grace: config.worker_death_grace,
            cpu_cores: host.cpu_cores,
        },
    )
    .await
    .map_err(|e| {
        error!(error = %e, "Failed to initialize worker pool");
        e
    })?;
    let pool = Arc::new(pool);
    let fatal_token = pool.fatal_token();
    let pool_stats = pool.stats().await;
    info!(
        worker_count = pool_stats.worker_count,
        cpu_cores = pool_stats.cpu_cores,
        "Media workers ready"
    );

    // Meeting store
    let meetings: Arc<dyn MeetingStore> = if let Some(redis_url) = &config.redis_url {
        info!("Connecting to Redis...");
        let store = RedisMeetingStore::connect(redis_url).await.map_err(|e| {
            error!(error = %e, "Failed to connect to Redis");
            e
        })?;
        info!("Redis connection established");
        Arc::new(store)
    } else {
        warn!("REDIS_URL not set, every room key is treated as an active meeting");
        Arc::new(StaticMeetingStore::new(config.default_max_participants))
    };

    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&pool),
        default_media_codecs(),
        config.transport_options(),
    ));
    let signaling_ctx = Arc::new(SignalingContext {
        sessions: Arc::clone(&sessions),
        meetings,
        hub: Arc::new(RoomHub::new()),
        room_locks: RoomLocks::new(),
        default_max_participants: config.default_max_participants,
    });

    // Health server: liveness, readiness, Prometheus /metrics and /stats
    let health_addr = parse_addr(&config.health_bind_address, "health")?;
    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state))
        .merge(metrics_router)
        .merge(stats_router(Arc::clone(&pool), Arc::clone(&sessions)));

    // Bind listeners BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Signaling server
    let signaling_addr = parse_addr(&config.bind_address, "signaling")?;
    let signaling_app = signaling_router(signaling_ctx, shutdown_token.child_token())
        .layer(TraceLayer::new_for_http());
    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    let signaling_server = tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!("SFU service running - press Ctrl+C to shutdown");

    let fatal = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            false
        }
        () = fatal_token.cancelled() => {
            error!("Media worker died, shutting down");
            true
        }
    };

    // Mark as not ready immediately so k8s stops sending traffic
    health_state.set_not_ready();
    shutdown_token.cancel();

    // Connections clean up their own peers; wait for them before closing
    // whatever is left.
    if let Err(e) = signaling_server.await {
        warn!(error = %e, "Signaling server task failed");
    }
    let closed = sessions.close_all().await;
    pool.close().await;

    info!(peers_closed = closed.len(), "SFU service shutdown complete");

    if fatal {
        return Err("media worker died".into());
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
