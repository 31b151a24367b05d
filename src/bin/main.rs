use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chat_relay=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (state, app) = chat_relay::create_app().await?;

    let shutdown = state.shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        shutdown.cancel();
    });

    if state.config.server.enabled {
        let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
        let listener = TcpListener::bind(&addr).await?;
        info!("chat-relay status API listening on {}", addr);
        let shutdown = state.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
    } else {
        state.shutdown.cancelled().await;
    }

    state.engine.stop().await?;
    Ok(())
}
