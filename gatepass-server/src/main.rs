//! Gatepass server binary: wires the Postgres store, the notification
//! queue, the expiration scheduler and the HTTP router together.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use gatepass_core::config::GatepassConfig;
use gatepass_core::gate::GateVerifier;
use gatepass_core::lifecycle::RequestLifecycle;
use gatepass_core::notify::{NotificationQueue, Notifier, TracingNotifier};
use gatepass_core::scheduler::ExpirationScheduler;
use gatepass_core::store::PassStore;
use gatepass_core::store_pg::PgStore;

mod api;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatepass_server=info,gatepass_core=info,tower_http=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();
    let config = GatepassConfig::from_env();

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost:5432/gatepass".to_string());
    info!("connecting to {}", database_url);
    let pool = sqlx::PgPool::connect(&database_url).await?;
    let store: Arc<dyn PassStore> = Arc::new(PgStore::new(pool));

    // Notifications drain on their own task; delivery fan-out is an
    // external collaborator behind the sink.
    let notifier: Arc<dyn Notifier> =
        Arc::new(NotificationQueue::spawn(Arc::new(TracingNotifier)));

    let lifecycle = Arc::new(RequestLifecycle::new(
        store.clone(),
        notifier.clone(),
        config.clone(),
    ));
    let gate = Arc::new(GateVerifier::new(
        store.clone(),
        notifier.clone(),
        config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = ExpirationScheduler::new(store.clone(), notifier.clone(), config.clone());
    let sweeper = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

    let state = api::AppState {
        store,
        lifecycle,
        gate,
    };
    let app = api::router(state);

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = format!("0.0.0.0:{port}");
    info!("listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = sweeper.await;
    Ok(())
}
