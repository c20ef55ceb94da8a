use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use supply_orchestrator::algorithm::Registry;
use supply_orchestrator::generator::GeneratorConfig;
use supply_orchestrator::store::postgres::PgStore;
use supply_orchestrator::workflow::EngineConfig;
use supply_orchestrator::{
    commands, dispatcher_job, Clients, Engine, Generator, MemoryStore, Recoverer, Settings, Store,
};

struct AppState {
    store: Arc<dyn Store>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env().context("invalid configuration")?;

    let store: Arc<dyn Store> = match &settings.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(url)
                .await
                .context("failed to connect to Postgres")?;
            sqlx::migrate!("../sqlx-migrations")
                .run(&pool)
                .await
                .context("failed to run migrations")?;
            tracing::info!("✅ [main] connected to database");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("⚠️ [main] DATABASE_URL not set, state is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let clients = Clients::build(&settings)?;
    let registry = Arc::new(Registry::default_dvm()?);
    let generator = Arc::new(Generator::new(
        store.clone(),
        clients.clone(),
        registry,
        GeneratorConfig::from(&settings),
    ));
    let engine = Engine::new(
        store.clone(),
        clients,
        generator,
        EngineConfig::from(&settings),
    );

    let redis_client = match &settings.redis_url {
        Some(url) => Some(redis::Client::open(url.as_str()).context("invalid REDIS_URL")?),
        None => {
            tracing::warn!("⚠️ [main] REDIS_URL not set, commands are not consumed");
            None
        }
    };

    // Recovery first; live traffic only starts once interrupted orders are settled.
    let background = engine.clone();
    let expire_days = settings.recover_expire_days;
    let every = settings.dispatch_interval;
    tokio::spawn(async move {
        match Recoverer::new(background.clone(), expire_days).run().await {
            Ok(report) => tracing::info!("✅ [main] recovery finished: {:?}", report),
            Err(e) => tracing::error!("❌ [main] recovery aborted: {}", e),
        }
        if let Some(client) = redis_client {
            let listener = background.clone();
            tokio::spawn(async move {
                if let Err(e) = commands::listen(client, listener).await {
                    tracing::error!("❌ [main] command listener stopped: {:#}", e);
                }
            });
        }
        dispatcher_job::run(background, every).await;
    });

    let app = Router::new()
        .route("/", get(root))
        .route("/admin/status", get(get_status))
        .with_state(Arc::new(AppState { store }));

    let addr = SocketAddr::from(([0, 0, 0, 0], settings.port));
    tracing::info!("[main] supply orchestrator listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn root() -> &'static str {
    "Supply Orchestrator Online"
}

async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.count_orders_by_status().await {
        Ok(counts) => {
            let by_status: BTreeMap<&str, u64> =
                counts.iter().map(|(s, n)| (s.as_str(), *n)).collect();
            Json(json!({ "orders": by_status })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}
