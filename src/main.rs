use anyhow::{Context, Result};
use idempotency_gate::clock::SystemClock;
use idempotency_gate::config::Config;
use idempotency_gate::producer::KafkaPublisher;
use idempotency_gate::server::{AppState, router};
use idempotency_gate::store::RedbIdempotencyStore;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::from_env().context("load gate config")?;
    let store = Arc::new(
        RedbIdempotencyStore::open(&config.db_path).context("open idempotency store")?,
    );
    let publisher = KafkaPublisher::from_config(&config).context("initialize kafka producer")?;

    let state = Arc::new(
        AppState::new(config, store, Arc::new(publisher), Arc::new(SystemClock))
            .context("build application state")?,
    );
    let sweeper_handle = state.sweeper.spawn();

    let app = router(state.clone());
    let listener = TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("bind {}", state.config.bind_addr))?;

    info!(
        bind = %state.config.bind_addr,
        db = %state.config.db_path.display(),
        distributed_locks = state.config.distributed_locks,
        "idempotency gate listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("serve idempotency gate")?;

    sweeper_handle.abort();
    let _ = sweeper_handle.await;

    Ok(())
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
