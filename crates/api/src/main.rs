use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use cardwise_core::catalog::source::HttpCatalogSource;
use cardwise_core::domain::catalog::{CardLookup, CatalogEntry};
use cardwise_core::domain::expense::{ExpenseRecord, SpendingProfile};
use cardwise_core::domain::recommendation::{RecommendationRun, ScoredRecommendation};
use cardwise_core::engine::{CardEngine, EngineOptions, RecommendationParams};
use cardwise_core::search::SearchIndexEntry;
use cardwise_core::storage::memory::MemoryKeyValueStore;
use cardwise_core::storage::pg::PgKeyValueStore;
use cardwise_core::storage::KeyValueStore;
use cardwise_core::user::{BackoffUserData, PgUserDataSource};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = cardwise_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();
    let pool: Option<PgPool> = match settings.require_database_url() {
        Ok(db_url) => match sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
        {
            Ok(pool) => match cardwise_core::storage::migrate(&pool).await {
                Ok(()) => Some(pool),
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "db migrations failed; starting API in degraded mode");
                    None
                }
            },
            Err(e) => {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "db connect failed; starting API in degraded mode");
                None
            }
        },
        Err(e) => {
            sentry_anyhow::capture_anyhow(&e);
            tracing::error!(error = %e, "DATABASE_URL missing; starting API in degraded mode");
            None
        }
    };

    let source = HttpCatalogSource::from_settings(&settings)?;
    let store: Arc<dyn KeyValueStore> = match &pool {
        Some(pool) => Arc::new(PgKeyValueStore::from_settings(pool.clone(), &settings)),
        None => Arc::new(MemoryKeyValueStore::new()),
    };
    let engine = CardEngine::new(Arc::new(source), store, EngineOptions::from_env());
    let user_data = pool
        .clone()
        .map(|pool| Arc::new(BackoffUserData::new(PgUserDataSource::new(pool))));

    let state = AppState {
        engine: Arc::new(engine),
        pool,
        user_data,
    };

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/cards/search", get(search_cards))
        .route("/cards/resolve", post(resolve_cards))
        .route("/cards/:id", get(get_card))
        .route("/recommendations", post(create_recommendations))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], settings.port));

    tracing::info!(%addr, "api listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Clone)]
struct AppState {
    engine: Arc<CardEngine>,
    pool: Option<PgPool>,
    user_data: Option<Arc<BackoffUserData<PgUserDataSource>>>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    q: String,
}

async fn search_cards(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> Json<Vec<SearchIndexEntry>> {
    Json(state.engine.search(&query.q).await)
}

async fn get_card(State(state): State<AppState>, Path(id): Path<String>) -> Json<CardLookup> {
    Json(state.engine.resolve(&id).await)
}

#[derive(Debug, Deserialize)]
struct ResolveRequest {
    ids: Vec<String>,
}

async fn resolve_cards(
    State(state): State<AppState>,
    Json(req): Json<ResolveRequest>,
) -> Json<BTreeMap<String, Option<Arc<CatalogEntry>>>> {
    Json(state.engine.resolve_many(&req.ids).await)
}

#[derive(Debug, Deserialize)]
struct RecommendationBody {
    /// When set and `expenses` is absent, expenses and card relationships are loaded for
    /// this user.
    user_id: Option<String>,
    expenses: Option<Vec<ExpenseRecord>>,
    #[serde(flatten)]
    params: RecommendationParams,
}

#[derive(Debug, Serialize)]
struct ApiRecommendations {
    run_id: Uuid,
    persisted: bool,
    catalog_available: bool,
    profile: SpendingProfile,
    recommendations: Vec<ScoredRecommendation>,
}

async fn create_recommendations(
    State(state): State<AppState>,
    Json(body): Json<RecommendationBody>,
) -> Result<Json<ApiRecommendations>, StatusCode> {
    let RecommendationBody {
        user_id,
        expenses,
        mut params,
    } = body;

    let expenses = match (expenses, user_id.as_deref()) {
        (Some(expenses), _) => expenses,
        (None, Some(user_id)) => {
            let Some(user_data) = &state.user_data else {
                return Err(StatusCode::SERVICE_UNAVAILABLE);
            };
            let loaded = user_data.load(user_id).await.map_err(|e| {
                let err = anyhow::Error::new(e);
                sentry_anyhow::capture_anyhow(&err);
                tracing::error!(error = %err, "user data load failed");
                StatusCode::SERVICE_UNAVAILABLE
            })?;
            merge_ids(&mut params.owned_card_ids, loaded.owned_card_ids);
            merge_ids(&mut params.not_interested_ids, loaded.not_interested_ids);
            loaded.expenses
        }
        (None, None) => return Err(StatusCode::BAD_REQUEST),
    };

    let outcome = state.engine.recommend_for(&expenses, &params).await;
    let run = RecommendationRun::new(
        user_id,
        &params.preference,
        params.credit_tier,
        &outcome.recommendations,
    );

    let persisted = match &state.pool {
        Some(pool) if !run.items.is_empty() => {
            match cardwise_core::storage::recommendations::persist_run(pool, &run).await {
                Ok(run_id) => {
                    tracing::info!(%run_id, items = run.items.len(), "persisted recommendation run");
                    true
                }
                Err(e) => {
                    sentry_anyhow::capture_anyhow(&e);
                    tracing::error!(error = %e, "recommendation run persist failed");
                    false
                }
            }
        }
        _ => false,
    };

    Ok(Json(ApiRecommendations {
        run_id: run.id,
        persisted,
        catalog_available: outcome.catalog_available,
        profile: outcome.profile,
        recommendations: outcome.recommendations,
    }))
}

fn merge_ids(into: &mut Vec<String>, extra: Vec<String>) {
    for id in extra {
        if !into.contains(&id) {
            into.push(id);
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_sentry(settings: &cardwise_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}
