use std::sync::Arc;

use anyhow::Result;
use modlink_client::{
    ConnectionHandle, ConnectionStatus, DispatchQueue, MessageRouter, PubSubAuth, Registry,
    WsConnector,
};
use modlink_protocol::{encode_commands, ClientCommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::RunnerConfig;

/// Spawns a task that cancels the token on SIGTERM/SIGINT
fn setup_shutdown_signal(cancel_token: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }

        cancel_token.cancel();
    });
}

/// Log every payload and status change of an endpoint.
fn log_endpoint(router: &MessageRouter, handle: &ConnectionHandle) {
    router.on_message(handle.id().clone(), |endpoint, payload| {
        tracing::info!(endpoint = %endpoint, "Payload: {}", payload);
    });
    router.on_status(handle.id().clone(), |endpoint, status| {
        tracing::info!(endpoint = %endpoint, "Status: {:?}", status);
    });
}

fn open_endpoints(registry: &Registry, config: &RunnerConfig) -> Result<Vec<ConnectionHandle>> {
    let mut handles = Vec::new();

    if let Some(pubsub) = &config.pubsub {
        let auth = PubSubAuth {
            token: pubsub.token.clone(),
            user_id: pubsub.user_id.clone(),
        };
        for topic in &pubsub.topics {
            let handle = registry.open_pubsub(topic, auth.clone())?;
            log_endpoint(registry.router(), &handle);
            handles.push(handle);
        }
    }

    if let Some(archipelago) = &config.archipelago {
        let handle =
            registry.open_archipelago(archipelago.credentials.clone(), &archipelago.game)?;
        log_endpoint(registry.router(), &handle);

        if let Some(greeting) = archipelago.greeting.clone() {
            let sender = handle.clone();
            registry.router().on_status(handle.id().clone(), move |_, status| {
                if *status != ConnectionStatus::Connected {
                    return;
                }
                let frame = encode_commands(&[ClientCommand::say(greeting.clone())]);
                if let Err(e) = sender.send(frame) {
                    tracing::warn!("Failed to queue greeting: {}", e);
                }
            });
        }
        handles.push(handle);
    }

    Ok(handles)
}

pub async fn run() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "modlink=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting modlink runner");

    let config = RunnerConfig::from_env()?;
    tracing::info!("Configuration loaded");
    tracing::info!("  Poll wait: {:?}", config.session.poll_wait);
    tracing::info!("  Host tick: {:?}", config.tick_interval);

    let (queue, mut drain) = DispatchQueue::new();
    let registry = Registry::with_connector(
        queue,
        MessageRouter::new(),
        Arc::new(WsConnector),
        config.session.clone(),
    );
    let handles = open_endpoints(&registry, &config)?;
    tracing::info!("Opened {} endpoint(s)", handles.len());

    let cancel_token = CancellationToken::new();
    setup_shutdown_signal(cancel_token.clone());

    // Simulated host tick: the only place subscribers run
    let mut tick = tokio::time::interval(config.tick_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            _ = tick.tick() => {
                drain.drain_once();
            }
        }
    }

    // Joins the poll thread
    tokio::task::block_in_place(|| registry.close_all());
    drain.drain_once();

    tracing::info!("modlink runner stopped");
    Ok(())
}
