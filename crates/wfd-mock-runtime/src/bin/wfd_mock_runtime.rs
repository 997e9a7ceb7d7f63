use std::net::SocketAddr;

use wfd_mock_runtime::{router, MockOptions, MockRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    wfd_otel::init();

    let port = std::env::var("WFD_MOCK_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(5678);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let options = MockOptions::from_env();
    tracing::info!(
        target: "wfd::mock",
        %addr,
        auth = options.api_key.is_some(),
        failing = ?options.failing,
        "mock runtime listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(MockRuntime::new(options)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
