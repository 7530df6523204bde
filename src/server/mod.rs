pub mod epg;
pub mod handlers;
pub mod hdhr;
pub mod library;
pub mod m3u;
pub mod plex;
pub mod routes;
pub mod state;
pub mod stream;

pub use state::AppState;

/// Server error types for proper error handling
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Server runtime error: {0}")]
    RuntimeError(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Start the HTTP server on the configured bind address. Streaming handlers
/// need the client's real socket address (admission logging, client
/// bindings), so the service is built with connect-info enabled.
pub async fn start_server(state: AppState) -> Result<(), ServerError> {
    let addr = state.config.snapshot().bind_address;
    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("HTTP server listening on http://{}", addr);
    axum::serve(listener, app.into_make_service_with_connect_info::<std::net::SocketAddr>())
        .await
        .map_err(|e| ServerError::RuntimeError(e.to_string()))?;

    Ok(())
}
