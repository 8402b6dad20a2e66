use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cmd_util::env::config_service;
use errors::MainError;
use ipfs::HttpIpfsClient;
use local_daemon::{
    config::LocalConfig,
    make_app,
    router::router,
};

fn main() -> Result<(), MainError> {
    config_service();
    let config = LocalConfig::parse();
    tracing::info!("Starting machined with config {config:?}");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run_server(config))?;
    Ok(())
}

async fn run_server(config: LocalConfig) -> anyhow::Result<()> {
    let ipfs = Arc::new(HttpIpfsClient::new(config.ipfs_api.clone()));
    let st = make_app(config.clone(), ipfs).await?;
    let router = router(st.clone());

    let bind_address = config.http_bind_address();
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Couldn't bind {bind_address}"))?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Received Ctrl-C signal, draining...");
        })
        .await?;

    st.shutdown().await;
    tracing::info!("Daemon shut down cleanly");
    Ok(())
}
