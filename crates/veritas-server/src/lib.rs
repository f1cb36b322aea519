//! GitHub webhook service for Veritas.
//!
//! `POST /webhook` checks the delivery's signature and hands eligible
//! pull-request events to the [`Dispatcher`](dispatch::Dispatcher), which
//! runs one verification per pull request at a time. `GET /healthz` answers
//! `ok`.

pub mod dispatch;
pub mod error;
pub mod events;
pub mod http;
pub mod signature;

use tokio::net::TcpListener;
use veritas_core::{VeritasConfig, VeritasError};

use crate::dispatch::{Dispatcher, Services};
use crate::http::{router, AppState};

/// Serve the webhook endpoint on `config.server.bind` until Ctrl-C, then
/// let in-flight reviews finish.
///
/// # Errors
///
/// Returns [`VeritasError::Config`] for an invalid budget and
/// [`VeritasError::Io`] if the address cannot be bound.
pub async fn serve(config: &VeritasConfig, services: Services) -> Result<(), VeritasError> {
    let dispatcher = Dispatcher::new(services, config)?;
    if config.server.webhook_secret.is_none() {
        tracing::warn!("server.webhook_secret is not set; deliveries will not be authenticated");
    }
    let app = router(AppState::new(dispatcher.clone(), config.server.clone()));

    let listener = TcpListener::bind(&config.server.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, bot = %config.server.bot_name, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if dispatcher.in_flight() > 0 {
        tracing::info!(in_flight = dispatcher.in_flight(), "waiting for in-flight reviews");
    }
    dispatcher.wait_idle().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested");
}
