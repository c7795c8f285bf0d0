use std::sync::Arc;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use dotenv::dotenv;
use tokio_cron_scheduler::{Job, JobScheduler};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use maps_crawler::api::{self, AppState};
use maps_crawler::engine::{EngineAdapter, FallbackEngine, FastEngine};
use maps_crawler::{CacheStore, Config, Orchestrator};

#[derive(OpenApi)]
#[openapi(
    paths(
        api::extract,
        api::batch,
        api::cache_stats,
        api::cache_entry,
        api::cache_sweep
    ),
    components(
        schemas(
            api::ExtractBody,
            api::BatchBody,
            api::SweepBody,
            api::SweepResponse,
            api::ErrorResponse,
            maps_crawler::orchestrator::Extraction,
            maps_crawler::orchestrator::Provenance,
            maps_crawler::batch::BatchReport,
            maps_crawler::batch::BatchItem,
            maps_crawler::batch::BatchOutcome,
            maps_crawler::batch::BatchSummary,
            maps_crawler::cache::CacheEntry,
            maps_crawler::cache::CacheStats,
            maps_crawler::cache::EngineStats,
            maps_crawler::error::EngineFailureSummary,
            maps_crawler::record::Record,
            maps_crawler::record::GeoPoint,
            maps_crawler::record::Review,
            maps_crawler::record::Image
        )
    ),
    tags(
        (name = "extraction", description = "Business extraction"),
        (name = "cache", description = "Cache inspection and maintenance")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,maps_crawler=debug")),
        )
        .init();

    let config = Config::from_env();
    info!(database = %config.database_url, floor = config.quality_floor, "🚀 starting maps crawler");

    let cache = Arc::new(
        CacheStore::connect(&config.database_url)
            .await
            .with_context(|| format!("failed to open cache at {}", config.database_url))?,
    );

    let session = config.session();
    let engines: Vec<Arc<dyn EngineAdapter>> = vec![
        Arc::new(FastEngine::new(session.clone())),
        Arc::new(FallbackEngine::new(session)),
    ];
    let orchestrator = Arc::new(Orchestrator::new(cache.clone(), engines, config.policy()));

    // One-shot mode: `maps-crawler extract <query...>` prints the result and exits.
    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.first().map(String::as_str) == Some("extract") {
        let query = args[1..].join(" ");
        let request = maps_crawler::ExtractRequest {
            include_reviews: config.include_reviews,
            max_reviews: config.max_reviews,
            timeout: config.engine_timeout,
            ..Default::default()
        };
        let extraction = orchestrator.extract(&query, &request).await?;
        println!("{}", serde_json::to_string_pretty(&extraction)?);
        return Ok(());
    }

    let scheduler = schedule_sweep(cache.clone(), &config).await?;

    let state = Arc::new(AppState::new(orchestrator, config.clone()));
    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/extract", post(api::extract))
        .route("/batch", post(api::batch))
        .route("/cache/stats", get(api::cache_stats))
        .route("/cache/entry", get(api::cache_entry))
        .route("/cache/sweep", post(api::cache_sweep))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    let mut scheduler = scheduler;
    scheduler.shutdown().await?;
    Ok(())
}

/// Retention sweep on a cron schedule, off the request path.
async fn schedule_sweep(cache: Arc<CacheStore>, config: &Config) -> anyhow::Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;
    let retention = config.retention;

    let job = Job::new_async(config.sweep_cron.as_str(), move |_id, _scheduler| {
        let cache = cache.clone();
        Box::pin(async move {
            match cache.sweep(retention).await {
                Ok(deleted) => info!(deleted, "scheduled retention sweep finished"),
                Err(e) => error!(error = %e, "scheduled retention sweep failed"),
            }
        })
    })
    .with_context(|| format!("invalid SWEEP_CRON '{}'", config.sweep_cron))?;

    scheduler.add(job).await?;
    scheduler.start().await?;
    info!(cron = %config.sweep_cron, retention_days = retention.as_secs() / 86400, "🧹 retention sweep scheduled");
    Ok(scheduler)
}
