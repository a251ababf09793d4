use proxybill::error::AppError;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,proxybill=debug")),
        )
        .json()
        .init();

    if let Err(err) = run().await {
        eprintln!("error: {}", err.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let state = proxybill::app::load_state().await?;
    let cancel = CancellationToken::new();
    let workers = proxybill::app::spawn_background_workers(&state, &cancel);

    let app = proxybill::app::build_app(state.clone());
    let addr: std::net::SocketAddr = state
        .runtime
        .listen
        .parse()
        .map_err(|err: std::net::AddrParseError| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "listen_invalid",
                err.to_string(),
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| AppError::internal("listen_failed", err.to_string()))?;
    tracing::info!("listening on {}", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for shutdown signal: {err}");
            }
            tracing::info!("shutting down");
            shutdown.cancel();
        })
        .await
        .map_err(|err| AppError::internal("serve_failed", err.to_string()))?;

    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}
