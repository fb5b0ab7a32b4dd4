use anyhow::Context;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    conductor_observability::init(&conductor_api::app::instance_id());

    let config = conductor_api::OrchestratorConfig::from_env()?;
    let bind_addr = config.bind_addr.clone();

    let app = conductor_api::app::start(config).await?;

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!("orchestrator listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
