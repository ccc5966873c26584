use anyhow::Result;
use calendar_booking::config::AppConfig;
use calendar_booking::handlers::build_router;
use calendar_booking::oauth::storage::{
    CredentialStore, FileCredentialStore, InMemoryCredentialStore,
};
use calendar_booking::AppState;
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::load()?;
    let store: Arc<dyn CredentialStore> = if config.storage.use_in_memory {
        Arc::new(InMemoryCredentialStore::new())
    } else {
        Arc::new(FileCredentialStore::new(&config.storage.credential_path)?)
    };

    let state = Arc::new(AppState::new(config, store)?);
    let bind_address = state.config.server.bind_address.clone();

    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;

    tracing::info!(
        bind_address = %bind_address,
        public_url = %state.config.server.public_url,
        redirect_uri = %state.config.redirect_uri(),
        "starting server"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received");
}
