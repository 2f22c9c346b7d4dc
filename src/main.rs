use std::sync::Arc;

use anyhow::{Context, Result};
use rmcp::transport::streamable_http_server::{
    StreamableHttpService, session::local::LocalSessionManager,
};
use tower_http::services::ServeDir;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use scene_gen_rmcp::{
    Collaborators, GenerationPipeline, Settings,
    mcp_server::SceneGenServer,
    queue_client::QueueClient,
    storage::{JsonRecordStore, LocalFileStorage, StaticTokenAuth},
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let settings = Settings::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let bind_address = settings.bind_address();
    let mcp_path = settings.route("/mcp");

    let storage = LocalFileStorage::new(
        settings.storage_dir.clone(),
        settings.storage_base_url.clone(),
    );
    let records = Arc::new(JsonRecordStore::new(storage.clone()));
    if let Some(grant) = &settings.plan_grant {
        match records.put_entitlement(&grant.user_id, &grant.entitlement).await {
            Ok(()) => info!(
                user_id = %grant.user_id,
                product_id = %grant.entitlement.product_id,
                "plan granted"
            ),
            Err(err) => warn!(user_id = %grant.user_id, error = %err, "plan grant not written"),
        }
    }
    let backend = QueueClient::new(&settings.pipeline.api_base, settings.pipeline.request_timeout)
        .context("build queue client")?;
    let http = backend.http().clone();
    let pipeline = GenerationPipeline::new(
        settings.pipeline.clone(),
        Collaborators {
            backend: Arc::new(backend),
            auth: Arc::new(StaticTokenAuth::new(settings.api_key.clone())),
            storage: Arc::new(storage),
            usage: records.clone(),
            images: records.clone(),
            entitlements: records,
            http,
        },
    );

    let service = StreamableHttpService::new(
        move || Ok(SceneGenServer::new(pipeline.clone())),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    // only the image bucket is served, records stay private
    let bucket = settings.pipeline.storage_bucket.trim_matches('/');
    let router = axum::Router::new()
        .nest_service(&mcp_path, service)
        .nest_service(
            &format!("/storage/{bucket}"),
            ServeDir::new(settings.storage_dir.join(bucket)),
        );
    let tcp_listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("bind {bind_address}"))?;

    info!(
        address = %bind_address,
        path = %mcp_path,
        storage = %settings.storage_dir.display(),
        "scene generation MCP server started"
    );

    axum::serve(tcp_listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}
